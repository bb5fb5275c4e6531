/// Display wrapper rendering a socket address as canonical ip + port,
/// so IPv4-mapped IPv6 peers (`::ffff:1.2.3.4`) log as plain IPv4.
///
/// ```
/// use scrape_target::util::format::SocketAddrFormat;
/// use std::net::SocketAddr;
///
/// let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
/// assert_eq!(format!("{}", SocketAddrFormat(&addr)), "127.0.0.1 8080");
/// ```
pub struct SocketAddrFormat<'a>(pub &'a std::net::SocketAddr);

impl std::fmt::Display for SocketAddrFormat<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.0.ip().to_canonical(), self.0.port())
    }
}
