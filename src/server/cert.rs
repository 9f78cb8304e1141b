use std::{net::IpAddr, path::Path, sync::Arc};

use ahash::AHashMap;
use anyhow::{Context as _, Result, bail, ensure};
use regex::Regex;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject};
use tokio_rustls::{
    TlsAcceptor, TlsConnector,
    rustls::{
        self, DigitallySignedStruct,
        client::{
            WebPkiServerVerifier,
            danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        },
        server::WebPkiClientVerifier,
    },
};
use x509_parser::prelude::*;

use crate::config;

/// A named TLS identity, usable on both sides: accepting RadSec
/// clients and dialing RadSec servers. Peers reference it by name.
pub struct TlsContext {
    pub name: String,
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
}

pub fn build_contexts(entries: &[config::Tls]) -> Result<AHashMap<String, Arc<TlsContext>>> {
    let mut contexts = AHashMap::with_capacity(entries.len());
    for entry in entries {
        let context =
            build_context(entry).with_context(|| format!("tls block {:?}", entry.name))?;

        if contexts
            .insert(entry.name.clone(), Arc::new(context))
            .is_some()
        {
            bail!("duplicate tls block name: {:?}", entry.name);
        }
    }

    Ok(contexts)
}

fn build_context(entry: &config::Tls) -> Result<TlsContext> {
    let certs = CertificateDer::pem_file_iter(&entry.certificate_file)
        .context("unable to read certificate-file")?
        .collect::<Result<Vec<_>, _>>()
        .context("malformed certificate-file")?;
    let key = PrivateKeyDer::from_pem_file(&entry.key_file).context("unable to read key-file")?;

    let mut roots = rustls::RootCertStore::empty();
    if let Some(path) = &entry.ca_file {
        add_authorities(&mut roots, path)?;
    }

    if let Some(path) = &entry.ca_path {
        for file in std::fs::read_dir(path).context("unable to read ca-path")? {
            let path = file.context("unable to read ca-path")?.path();
            if path
                .extension()
                .map(|it| it == "pem" || it == "crt")
                .unwrap_or(false)
            {
                add_authorities(&mut roots, &path)?;
            }
        }
    }

    ensure!(!roots.is_empty(), "no usable certificate authorities");
    let roots = Arc::new(roots);

    // RadSec is mutual TLS: inbound peers must present a certificate
    // chaining to the configured authorities.
    let verifier = WebPkiClientVerifier::builder(roots.clone())
        .build()
        .context("unable to build the client verifier")?;

    let acceptor = TlsAcceptor::from(Arc::new(
        rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs.clone(), key.clone_key())
            .context("certificate and key do not fit together")?,
    ));

    let upstream = WebPkiServerVerifier::builder(roots)
        .build()
        .context("unable to build the server verifier")?;

    let connector = TlsConnector::from(Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(UpstreamVerifier(upstream)))
            .with_client_auth_cert(certs, key)
            .context("certificate and key do not fit together")?,
    ));

    Ok(TlsContext {
        name: entry.name.clone(),
        acceptor,
        connector,
    })
}

fn add_authorities(roots: &mut rustls::RootCertStore, path: &Path) -> Result<()> {
    let certs = CertificateDer::pem_file_iter(path)
        .with_context(|| format!("unable to read authorities: {}", path.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("malformed authorities: {}", path.display()))?;

    let (_, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        log::warn!("ignored {ignored} unusable authorities: {}", path.display());
    }

    Ok(())
}

/// Chain and validity checks stay with webpki; the name binding is
/// the configured identity match, applied after the handshake, so a
/// name mismatch must not abort the connection here.
#[derive(Debug)]
struct UpstreamVerifier(Arc<WebPkiServerVerifier>);

impl ServerCertVerifier for UpstreamVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.0.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName
                | rustls::CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}

/// Check a handshaken peer certificate against the identity rules of
/// a peer config.
///
/// An IP literal host binds to a subjectAltName iPAddress entry.
/// Hostnames bind to a dNSName entry first, the common name second.
/// Configured certificate-cn / certificate-uri patterns must match on
/// top of that.
pub fn verify_identity(
    der: &CertificateDer<'_>,
    host: &str,
    certificate_cn: Option<&Regex>,
    certificate_uri: Option<&Regex>,
) -> bool {
    let Ok((_, cert)) = X509Certificate::from_der(der.as_ref()) else {
        log::warn!("peer certificate does not parse");
        return false;
    };

    let mut dns_names = Vec::new();
    let mut uris = Vec::new();
    let mut ips: Vec<&[u8]> = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(value) => dns_names.push(*value),
                GeneralName::URI(value) => uris.push(*value),
                GeneralName::IPAddress(value) => ips.push(*value),
                _ => {}
            }
        }
    }

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|it| it.as_str().ok());

    let host_ok = match host.parse::<IpAddr>() {
        Ok(addr) => {
            let octets = match addr {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                IpAddr::V6(v6) => v6.octets().to_vec(),
            };

            ips.iter().any(|it| *it == octets.as_slice())
        }
        Err(_) => {
            dns_names.iter().any(|it| it.eq_ignore_ascii_case(host))
                || common_name
                    .map(|it| it.eq_ignore_ascii_case(host))
                    .unwrap_or(false)
        }
    };

    if !host_ok {
        log::debug!("peer certificate does not bind to host {host:?}");
        return false;
    }

    if let Some(pattern) = certificate_cn {
        if !common_name.map(|it| pattern.is_match(it)).unwrap_or(false) {
            log::debug!("peer certificate common name does not match the configured pattern");
            return false;
        }
    }

    if let Some(pattern) = certificate_uri {
        if !uris.iter().any(|it| pattern.is_match(it)) {
            log::debug!("peer certificate carries no uri matching the configured pattern");
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CertificateDer<'static> {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params =
            rcgen::CertificateParams::new(vec!["radius.example.org".to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "radius.example.org");
        params
            .subject_alt_names
            .push(rcgen::SanType::IpAddress("192.0.2.10".parse().unwrap()));
        params.subject_alt_names.push(rcgen::SanType::URI(
            rcgen::Ia5String::try_from("https://roaming.example.org".to_string()).unwrap(),
        ));

        params.self_signed(&key).unwrap().der().clone()
    }

    fn pattern(source: &str) -> Regex {
        regex::RegexBuilder::new(source)
            .case_insensitive(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_ip_host_binds_to_san_ip() {
        let cert = sample();

        assert!(verify_identity(&cert, "192.0.2.10", None, None));
        assert!(!verify_identity(&cert, "192.0.2.11", None, None));
    }

    #[test]
    fn test_hostname_binds_to_dns_or_cn() {
        let cert = sample();

        assert!(verify_identity(&cert, "radius.example.org", None, None));
        assert!(verify_identity(&cert, "RADIUS.EXAMPLE.ORG", None, None));
        assert!(!verify_identity(&cert, "other.example.org", None, None));
    }

    #[test]
    fn test_configured_patterns_are_mandatory() {
        let cert = sample();

        assert!(verify_identity(
            &cert,
            "radius.example.org",
            Some(&pattern("^radius\\.")),
            None
        ));
        assert!(!verify_identity(
            &cert,
            "radius.example.org",
            Some(&pattern("^other\\.")),
            None
        ));

        assert!(verify_identity(
            &cert,
            "radius.example.org",
            None,
            Some(&pattern("^https://roaming\\."))
        ));
        assert!(!verify_identity(
            &cert,
            "radius.example.org",
            None,
            Some(&pattern("^spiffe://"))
        ));
    }
}
