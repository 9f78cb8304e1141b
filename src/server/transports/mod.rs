pub mod tls;
pub mod udp;
