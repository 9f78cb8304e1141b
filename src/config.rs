use std::{
    fs::read_to_string,
    net::{IpAddr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result, bail, ensure};
use clap::Parser;
use serde::Deserialize;

use service::{
    peers::{ClientConfig, EXACT_HOST, ServerConfig, Transport as PeerTransport},
    realm::Realm,
    rewrite::{Rewrite, UserRewrite},
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/radius-proxy.toml";

pub const DEFAULT_AUTH_PORT: u16 = 1812;
pub const DEFAULT_ACCOUNTING_PORT: u16 = 1813;
pub const DEFAULT_TLS_PORT: u16 = 2083;

/// The well-known fallback secret of RFC 6614; TLS peers that do not
/// configure one get it implicitly.
pub const DEFAULT_TLS_SECRET: &str = "radsec";

/// Longest value a Reply-Message attribute can carry.
const MAX_REPLY_MESSAGE: usize = 253;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tls,
}

impl From<Transport> for PeerTransport {
    fn from(value: Transport) -> Self {
        match value {
            Transport::Udp => Self::Udp,
            Transport::Tls => Self::Tls,
        }
    }
}

/// An inbound peer allowed to send requests.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Client {
    pub name: Option<String>,
    pub transport: Transport,
    ///
    /// Address, hostname, or (for udp) CIDR prefix the peer sends
    /// from.
    ///
    pub host: String,
    pub secret: Option<String>,
    ///
    /// Name of the tls block this peer handshakes under. Mandatory
    /// for tls peers unless a block named "default" exists.
    ///
    pub tls: Option<String>,
    pub certificate_cn: Option<String>,
    pub certificate_uri: Option<String>,
    ///
    /// Name of the rewrite block applied to requests from this peer.
    ///
    pub rewrite_in: Option<String>,
    pub rewrite_attribute: Option<RewriteAttribute>,
}

/// Regex rewrite of the User-Name of inbound requests. The
/// replacement supports `\1` to `\9` backreferences.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct RewriteAttribute {
    pub pattern: String,
    pub replacement: String,
}

/// An upstream server requests can be forwarded to.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// Unique key realms refer to this server by.
    ///
    pub name: String,
    pub transport: Transport,
    pub host: String,
    ///
    /// Defaults to 1812 for udp and 2083 for tls.
    ///
    pub port: Option<u16>,
    pub secret: Option<String>,
    pub tls: Option<String>,
    pub certificate_cn: Option<String>,
    pub certificate_uri: Option<String>,
    ///
    /// Name of the rewrite block applied to replies from this server.
    ///
    pub rewrite_out: Option<String>,
    ///
    /// Probe this server with periodic Status-Server requests and
    /// steer traffic away while it stays silent.
    ///
    #[serde(default)]
    pub status_server: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct RealmEntry {
    ///
    /// `*` matches everything, `/…/` is a raw regex, anything else a
    /// literal realm suffix.
    ///
    pub pattern: String,
    #[serde(default)]
    pub servers: Vec<String>,
    ///
    /// Reject text for requests this realm cannot forward anywhere.
    /// Without it such requests are dropped silently.
    ///
    pub reply_message: Option<String>,
}

/// A named TLS identity: certificate, key, and the authorities peers
/// are checked against.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Tls {
    pub name: String,
    pub ca_file: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub certificate_file: PathBuf,
    pub key_file: PathBuf,
    pub key_password: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct RewriteEntry {
    pub name: String,
    ///
    /// Attribute type codes to strip.
    ///
    #[serde(default)]
    pub remove_attributes: Vec<u8>,
    ///
    /// `[vendor, sub-attribute]` pairs to strip from Vendor-Specific
    /// attributes. A negative sub-attribute drops the whole vendor
    /// attribute.
    ///
    #[serde(default)]
    pub remove_vendor_attributes: Vec<(u32, i32)>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Listen {
    ///
    /// Authentication listener. Defaults to [::]:1812 when udp
    /// clients are configured.
    ///
    pub udp: Option<SocketAddr>,
    ///
    /// Accounting listener. Defaults to [::]:1813 when udp clients
    /// are configured.
    ///
    pub accounting_udp: Option<SocketAddr>,
    ///
    /// RadSec listener. Defaults to [::]:2083 when tls clients are
    /// configured.
    ///
    pub tls: Option<SocketAddr>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Source {
    ///
    /// Local address upstream udp sockets bind to. Kernel-chosen when
    /// unset.
    ///
    pub udp: Option<SocketAddr>,
    ///
    /// Local address upstream tls connections are dialed from.
    ///
    pub tls: Option<SocketAddr>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_filter(&self) -> log::LevelFilter {
        match *self {
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Trace => log::LevelFilter::Trace,
        }
    }

    /// The numeric scale of the `-d` flag, 1 (errors only) to 5
    /// (trace).
    pub fn from_debug(level: u8) -> Self {
        match level {
            1 => Self::Error,
            2 => Self::Warn,
            3 => Self::Info,
            4 => Self::Debug,
            _ => Self::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
    ///
    /// Log file. Only used outside the foreground mode; SIGHUP
    /// reopens it.
    ///
    pub file: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default, rename = "client")]
    pub clients: Vec<Client>,
    #[serde(default, rename = "server")]
    pub servers: Vec<Server>,
    #[serde(default, rename = "realm")]
    pub realms: Vec<RealmEntry>,
    #[serde(default, rename = "tls")]
    pub tls: Vec<Tls>,
    #[serde(default, rename = "rewrite")]
    pub rewrites: Vec<RewriteEntry>,
    #[serde(default)]
    pub listen: Listen,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub log: Log,
    pub pid_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    author = env!("CARGO_PKG_AUTHORS"),
    disable_version_flag = true,
)]
pub struct Cli {
    ///
    /// Specify the configuration file path.
    ///
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
    ///
    /// Log verbosity, 1 (errors only) to 5 (trace). Overrides the
    /// configured level.
    ///
    #[arg(long, short, value_parser = clap::value_parser!(u8).range(1..=5))]
    pub debug: Option<u8>,
    ///
    /// Stay in the foreground and log to stderr.
    ///
    #[arg(long, short)]
    pub foreground: bool,
    ///
    /// Write the process id to this file after startup.
    ///
    #[arg(long, short = 'i')]
    pub pid_file: Option<PathBuf>,
    ///
    /// Only check whether the configuration is valid, then exit.
    ///
    #[arg(long, short = 'p')]
    pub pretend: bool,
    ///
    /// Print the version and exit.
    ///
    #[arg(long, short = 'v')]
    pub version: bool,
}

impl Config {
    ///
    /// Load the configuration from a file.
    ///
    pub fn load(path: &Path) -> Result<Self> {
        toml::from_str(
            &read_to_string(path)
                .with_context(|| format!("unable to read configuration: {}", path.display()))?,
        )
        .with_context(|| format!("malformed configuration: {}", path.display()))
    }
}

/// Everything the orchestrator needs, derived from the file once and
/// never mutated again.
pub struct Setup {
    pub clients: Vec<ClientConfig>,
    pub servers: Vec<ServerConfig>,
    pub realms: Vec<Realm>,
    pub tls: Vec<Tls>,
    pub listen_udp: Option<SocketAddr>,
    pub listen_accounting_udp: Option<SocketAddr>,
    pub listen_tls: Option<SocketAddr>,
    pub source_udp: Option<SocketAddr>,
    pub source_tls: Option<SocketAddr>,
}

impl Config {
    /// Resolve, compile, and cross-check the whole file. Everything
    /// that can fail at runtime should fail here instead.
    pub fn build(&self) -> Result<Setup> {
        ensure!(!self.clients.is_empty(), "no clients configured");
        ensure!(!self.servers.is_empty(), "no servers configured");
        ensure!(!self.realms.is_empty(), "no realms configured");

        for entry in &self.tls {
            ensure!(
                entry.key_password.is_none(),
                "tls block {:?}: encrypted private keys are not supported",
                entry.name
            );
            ensure!(
                entry.ca_file.is_some() || entry.ca_path.is_some(),
                "tls block {:?} needs a ca-file or ca-path",
                entry.name
            );
        }

        let mut clients = Vec::with_capacity(self.clients.len());
        for (index, entry) in self.clients.iter().enumerate() {
            let name = entry
                .name
                .clone()
                .unwrap_or_else(|| format!("client-{index}"));

            let (addrs, prefix_len) = resolve_client_host(&entry.host, entry.transport)
                .with_context(|| format!("client {name:?}"))?;

            clients.push(ClientConfig {
                transport: entry.transport.into(),
                host: entry.host.clone(),
                addrs,
                prefix_len,
                secret: self
                    .peer_secret(&name, entry.transport, entry.secret.as_deref())?,
                tls: self.tls_reference(&name, entry.transport, entry.tls.as_deref())?,
                certificate_cn: compile_match(entry.certificate_cn.as_deref())
                    .with_context(|| format!("client {name:?}: certificate-cn"))?,
                certificate_uri: compile_match(entry.certificate_uri.as_deref())
                    .with_context(|| format!("client {name:?}: certificate-uri"))?,
                rewrite_in: self
                    .rewrite_reference(entry.rewrite_in.as_deref())
                    .with_context(|| format!("client {name:?}"))?,
                rewrite_user: entry
                    .rewrite_attribute
                    .as_ref()
                    .map(|it| compile_user_rewrite(it))
                    .transpose()
                    .with_context(|| format!("client {name:?}: rewrite-attribute"))?,
                name,
            });
        }

        let mut servers = Vec::with_capacity(self.servers.len());
        for entry in &self.servers {
            ensure!(
                servers.iter().all(|it: &ServerConfig| it.name != entry.name),
                "duplicate server name: {:?}",
                entry.name
            );

            let port = entry.port.unwrap_or(match entry.transport {
                Transport::Udp => DEFAULT_AUTH_PORT,
                Transport::Tls => DEFAULT_TLS_PORT,
            });

            let addrs: Vec<SocketAddr> = (entry.host.as_str(), port)
                .to_socket_addrs()
                .with_context(|| format!("server {:?}: unresolvable host {:?}", entry.name, entry.host))?
                .collect();
            ensure!(
                !addrs.is_empty(),
                "server {:?}: host {:?} resolved to nothing",
                entry.name,
                entry.host
            );

            servers.push(ServerConfig {
                name: entry.name.clone(),
                transport: entry.transport.into(),
                host: entry.host.clone(),
                addrs,
                secret: self.peer_secret(&entry.name, entry.transport, entry.secret.as_deref())?,
                tls: self.tls_reference(&entry.name, entry.transport, entry.tls.as_deref())?,
                certificate_cn: compile_match(entry.certificate_cn.as_deref())
                    .with_context(|| format!("server {:?}: certificate-cn", entry.name))?,
                certificate_uri: compile_match(entry.certificate_uri.as_deref())
                    .with_context(|| format!("server {:?}: certificate-uri", entry.name))?,
                rewrite_out: self
                    .rewrite_reference(entry.rewrite_out.as_deref())
                    .with_context(|| format!("server {:?}", entry.name))?,
                status_server: entry.status_server,
            });
        }

        let mut realms = Vec::with_capacity(self.realms.len());
        for entry in &self.realms {
            if let Some(message) = &entry.reply_message {
                ensure!(
                    message.len() <= MAX_REPLY_MESSAGE,
                    "realm {:?}: reply-message longer than {MAX_REPLY_MESSAGE} bytes",
                    entry.pattern
                );
            }

            let mut members = Vec::with_capacity(entry.servers.len());
            for name in &entry.servers {
                let index = servers
                    .iter()
                    .position(|it| &it.name == name)
                    .with_context(|| {
                        format!("realm {:?}: unknown server {name:?}", entry.pattern)
                    })?;

                members.push(index);
            }

            realms.push(Realm {
                name: entry.pattern.clone(),
                pattern: Realm::compile(&entry.pattern)
                    .with_context(|| format!("realm {:?}: invalid pattern", entry.pattern))?,
                message: entry.reply_message.clone(),
                servers: members,
            });
        }

        let has_udp_clients = clients.iter().any(|it| it.transport == PeerTransport::Udp);
        let has_tls_clients = clients.iter().any(|it| it.transport == PeerTransport::Tls);

        Ok(Setup {
            clients,
            servers,
            realms,
            tls: self.tls.clone(),
            listen_udp: self
                .listen
                .udp
                .or(has_udp_clients.then(|| any_addr(DEFAULT_AUTH_PORT))),
            listen_accounting_udp: self
                .listen
                .accounting_udp
                .or(has_udp_clients.then(|| any_addr(DEFAULT_ACCOUNTING_PORT))),
            listen_tls: self
                .listen
                .tls
                .or(has_tls_clients.then(|| any_addr(DEFAULT_TLS_PORT))),
            source_udp: self.source.udp,
            source_tls: self.source.tls,
        })
    }

    fn peer_secret(
        &self,
        name: &str,
        transport: Transport,
        secret: Option<&str>,
    ) -> Result<Vec<u8>> {
        match (secret, transport) {
            (Some(secret), _) => Ok(secret.as_bytes().to_vec()),
            (None, Transport::Tls) => Ok(DEFAULT_TLS_SECRET.as_bytes().to_vec()),
            (None, Transport::Udp) => bail!("peer {name:?}: udp peers need a secret"),
        }
    }

    /// TLS peers must reference a tls block; a block named "default"
    /// stands in when they name none.
    fn tls_reference(
        &self,
        name: &str,
        transport: Transport,
        tls: Option<&str>,
    ) -> Result<Option<String>> {
        if transport != Transport::Tls {
            ensure!(tls.is_none(), "peer {name:?}: tls reference on a udp peer");
            return Ok(None);
        }

        let reference = tls.unwrap_or("default");
        ensure!(
            self.tls.iter().any(|it| it.name == reference),
            "peer {name:?}: unknown tls block {reference:?}"
        );

        Ok(Some(reference.to_string()))
    }

    fn rewrite_reference(&self, reference: Option<&str>) -> Result<Option<Rewrite>> {
        let Some(reference) = reference else {
            return Ok(None);
        };

        let entry = self
            .rewrites
            .iter()
            .find(|it| it.name == reference)
            .with_context(|| format!("unknown rewrite block {reference:?}"))?;

        let mut remove_vendor_attributes = Vec::with_capacity(entry.remove_vendor_attributes.len());
        for (vendor, subattribute) in &entry.remove_vendor_attributes {
            ensure!(
                (-1..=255).contains(subattribute),
                "rewrite {reference:?}: sub-attribute out of range: {subattribute}"
            );

            remove_vendor_attributes.push((
                *vendor,
                (*subattribute >= 0).then(|| *subattribute as u8),
            ));
        }

        Ok(Some(Rewrite {
            remove_attributes: entry.remove_attributes.clone(),
            remove_vendor_attributes,
        }))
    }
}

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
}

fn resolve_client_host(host: &str, transport: Transport) -> Result<(Vec<IpAddr>, u8)> {
    if let Some((addr, prefix)) = host.split_once('/') {
        ensure!(
            transport == Transport::Udp,
            "prefix matching is only available for udp clients"
        );

        let addr: IpAddr = addr
            .parse()
            .with_context(|| format!("invalid prefix base address: {addr:?}"))?;
        let prefix: u8 = prefix
            .parse()
            .ok()
            .filter(|&it| it <= if addr.is_ipv4() { 32 } else { 128 })
            .with_context(|| format!("invalid prefix length: {prefix:?}"))?;

        return Ok((vec![addr], prefix));
    }

    let addrs: Vec<IpAddr> = (host, 0)
        .to_socket_addrs()
        .with_context(|| format!("unresolvable host: {host:?}"))?
        .map(|it| it.ip())
        .collect();
    ensure!(!addrs.is_empty(), "host resolved to nothing: {host:?}");

    Ok((addrs, EXACT_HOST))
}

fn compile_match(pattern: Option<&str>) -> Result<Option<regex::Regex>> {
    pattern
        .map(|it| {
            regex::RegexBuilder::new(it)
                .case_insensitive(true)
                .build()
                .context("invalid regex")
        })
        .transpose()
}

fn compile_user_rewrite(entry: &RewriteAttribute) -> Result<UserRewrite> {
    Ok(UserRewrite {
        pattern: regex::bytes::RegexBuilder::new(&entry.pattern)
            .case_insensitive(true)
            .build()
            .context("invalid pattern")?,
        replacement: convert_replacement(&entry.replacement),
    })
}

/// Translate `\1`-style backreferences into the `${1}` expansion the
/// regex engine uses, and neutralize literal dollar signs.
fn convert_replacement(replacement: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(replacement.len() + 8);
    let mut bytes = replacement.bytes();

    while let Some(byte) = bytes.next() {
        match byte {
            b'$' => out.extend_from_slice(b"$$"),
            b'\\' => match bytes.next() {
                Some(digit @ b'1'..=b'9') => {
                    out.extend_from_slice(b"${");
                    out.push(digit);
                    out.push(b'}');
                }
                Some(other) => out.push(other),
                None => out.push(b'\\'),
            },
            other => out.push(other),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        toml::from_str(
            r#"
            [[client]]
            transport = "udp"
            host = "192.0.2.1"
            secret = "c"

            [[server]]
            name = "home"
            transport = "udp"
            host = "192.0.2.10"
            secret = "s"

            [[realm]]
            pattern = "example.org"
            servers = ["home"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_minimal_config_builds() {
        let setup = minimal().build().unwrap();

        assert_eq!(setup.clients.len(), 1);
        assert_eq!(setup.servers.len(), 1);
        assert_eq!(setup.servers[0].addrs[0].port(), DEFAULT_AUTH_PORT);
        assert_eq!(setup.realms[0].servers, vec![0]);
        assert!(setup.listen_udp.is_some());
        assert!(setup.listen_accounting_udp.is_some());
        assert!(setup.listen_tls.is_none());
    }

    #[test]
    fn test_udp_peer_requires_secret() {
        let mut config = minimal();
        config.clients[0].secret = None;

        assert!(config.build().is_err());
    }

    #[test]
    fn test_realm_must_reference_known_server() {
        let mut config = minimal();
        config.realms[0].servers = vec!["nowhere".to_string()];

        assert!(config.build().is_err());
    }

    #[test]
    fn test_empty_sections_are_fatal() {
        let mut config = minimal();
        config.realms.clear();

        assert!(config.build().is_err());
    }

    #[test]
    fn test_cidr_client_host() {
        let mut config = minimal();
        config.clients[0].host = "192.0.2.0/24".to_string();

        let setup = config.build().unwrap();
        assert_eq!(setup.clients[0].prefix_len, 24);
        assert!(setup.clients[0].matches("192.0.2.200".parse().unwrap()));

        config.clients[0].host = "192.0.2.0/40".to_string();
        assert!(config.build().is_err());
    }

    #[test]
    fn test_tls_peer_needs_a_context() {
        let mut config = minimal();
        config.clients.push(Client {
            name: None,
            transport: Transport::Tls,
            host: "192.0.2.2".to_string(),
            secret: None,
            tls: None,
            certificate_cn: None,
            certificate_uri: None,
            rewrite_in: None,
            rewrite_attribute: None,
        });

        assert!(config.build().is_err());
    }

    #[test]
    fn test_replacement_conversion() {
        assert_eq!(convert_replacement("\\1@example.org"), b"${1}@example.org");
        assert_eq!(convert_replacement("user$"), b"user$$");
        assert_eq!(convert_replacement("\\\\plain"), b"\\plain");
    }
}
