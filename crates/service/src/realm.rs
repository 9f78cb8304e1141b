use regex::bytes::{Regex, RegexBuilder};

/// A routing entry: requests whose User-Name matches the pattern go
/// to the listed servers, in order of preference.
pub struct Realm {
    pub name: String,
    pub pattern: Regex,
    /// Reject text for requests that cannot be forwarded anywhere.
    pub message: Option<String>,
    /// Indices into the server table, all resolved at load time.
    pub servers: Vec<usize>,
}

impl Realm {
    /// Compile a configured realm pattern.
    ///
    /// `*` alone routes everything. A pattern wrapped in slashes is a
    /// raw regex. Anything else is a literal realm suffix: dots are
    /// escaped and the value anchored as `@realm$`. Matching is
    /// case-insensitive throughout, and runs over raw bytes so an
    /// unprintable User-Name cannot break routing.
    ///
    /// # Test
    ///
    /// ```
    /// use radius_proxy_service::realm::Realm;
    ///
    /// let pattern = Realm::compile("example.org").unwrap();
    ///
    /// assert!(pattern.is_match(b"alice@example.org"));
    /// assert!(pattern.is_match(b"alice@EXAMPLE.ORG"));
    /// assert!(!pattern.is_match(b"alice@examplexorg"));
    /// assert!(!pattern.is_match(b"alice@example.org.evil"));
    ///
    /// assert!(Realm::compile("*").unwrap().is_match(b"anyone"));
    /// assert!(Realm::compile("/^host/").unwrap().is_match(b"hostmaster"));
    /// ```
    pub fn compile(pattern: &str) -> Result<Regex, regex::Error> {
        let source = if pattern == "*" {
            ".*".to_string()
        } else if let Some(expression) = pattern.strip_prefix('/') {
            expression.strip_suffix('/').unwrap_or(expression).to_string()
        } else {
            format!("@{}$", pattern.replace('.', "\\."))
        };

        RegexBuilder::new(&source).case_insensitive(true).build()
    }
}
