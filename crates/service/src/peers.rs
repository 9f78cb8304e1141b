use std::net::{IpAddr, SocketAddr};

use regex::Regex;

use crate::rewrite::{Rewrite, UserRewrite};

/// Marker prefix length for entries that match the whole resolved
/// address set instead of a network.
pub const EXACT_HOST: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tls,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Udp => "UDP",
            Self::Tls => "TLS",
        })
    }
}

/// Identity and policy of an inbound peer. Built once at startup,
/// immutable afterwards.
pub struct ClientConfig {
    pub name: String,
    pub transport: Transport,
    /// Host as configured, kept for certificate matching and logs.
    pub host: String,
    pub addrs: Vec<IpAddr>,
    /// `EXACT_HOST`, or the prefix length of a CIDR entry.
    pub prefix_len: u8,
    pub secret: Vec<u8>,
    /// Name of the TLS context this peer handshakes under.
    pub tls: Option<String>,
    pub certificate_cn: Option<Regex>,
    pub certificate_uri: Option<Regex>,
    pub rewrite_in: Option<Rewrite>,
    pub rewrite_user: Option<UserRewrite>,
}

/// An upstream peer requests are forwarded to.
pub struct ServerConfig {
    pub name: String,
    pub transport: Transport,
    pub host: String,
    pub addrs: Vec<SocketAddr>,
    pub secret: Vec<u8>,
    pub tls: Option<String>,
    pub certificate_cn: Option<Regex>,
    pub certificate_uri: Option<Regex>,
    pub rewrite_out: Option<Rewrite>,
    pub status_server: bool,
}

/// Strip the v4-mapped wrapping so mixed family sockets compare by
/// the address they actually represent.
pub fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        addr => addr,
    }
}

fn prefix_match(addr: IpAddr, network: IpAddr, bits: u8) -> bool {
    match (addr, network) {
        (IpAddr::V4(addr), IpAddr::V4(network)) => {
            let bits = bits.min(32) as u32;
            if bits == 0 {
                return true;
            }

            let mask = u32::MAX << (32 - bits);
            u32::from(addr) & mask == u32::from(network) & mask
        }
        (IpAddr::V6(addr), IpAddr::V6(network)) => {
            let bits = bits.min(128) as u32;
            if bits == 0 {
                return true;
            }

            let mask = u128::MAX << (128 - bits);
            u128::from(addr) & mask == u128::from(network) & mask
        }
        _ => false,
    }
}

impl ClientConfig {
    /// Whether a source address belongs to this entry.
    ///
    /// Exact-host entries match any address in their resolved set;
    /// CIDR entries compare only the first resolved address against
    /// the stored prefix length.
    pub fn matches(&self, addr: IpAddr) -> bool {
        let addr = unmap(addr);
        if self.prefix_len == EXACT_HOST {
            self.addrs.iter().any(|it| unmap(*it) == addr)
        } else {
            self.addrs
                .first()
                .map(|it| prefix_match(addr, unmap(*it), self.prefix_len))
                .unwrap_or(false)
        }
    }
}

impl ServerConfig {
    pub fn matches(&self, addr: SocketAddr) -> bool {
        self.addrs
            .iter()
            .any(|it| unmap(it.ip()) == unmap(addr.ip()) && it.port() == addr.port())
    }
}

/// Find the first client config at or after `cursor` admitting the
/// given source. Several configs can share an address; callers that
/// disambiguate by certificate keep calling with an advanced cursor.
pub fn find_client(
    clients: &[ClientConfig],
    transport: Transport,
    addr: IpAddr,
    cursor: usize,
) -> Option<usize> {
    clients
        .iter()
        .enumerate()
        .skip(cursor)
        .find(|(_, it)| it.transport == transport && it.matches(addr))
        .map(|(index, _)| index)
}
