use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// A peer's addressing tuple. Circuits, the unacked bookkeeping and all
///  per-peer state are keyed by this value.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Host {
    pub addr: IpAddr,
    pub port: u16,
}

impl Host {
    pub fn new(addr: IpAddr, port: u16) -> Host {
        Host { addr, port }
    }

    pub fn localhost(port: u16) -> Host {
        Host {
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl Debug for Host {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", self.addr, self.port)
    }
}

impl Display for Host {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl From<SocketAddr> for Host {
    fn from(addr: SocketAddr) -> Self {
        Host {
            addr: addr.ip(),
            port: addr.port(),
        }
    }
}

impl From<Host> for SocketAddr {
    fn from(host: Host) -> Self {
        host.socket_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[rstest]
    #[case::v4("1.2.3.4:5678")]
    #[case::v6("[::1]:9000")]
    fn test_socket_addr_round_trip(#[case] addr: &str) {
        let socket_addr = SocketAddr::from_str(addr).unwrap();
        let host = Host::from(socket_addr);
        assert_eq!(host.socket_addr(), socket_addr);
    }

    #[test]
    fn test_usable_as_map_key() {
        let mut map = rustc_hash::FxHashMap::default();
        map.insert(Host::localhost(9000), 1);
        map.insert(Host::localhost(9001), 2);
        assert_eq!(map.get(&Host::localhost(9000)), Some(&1));
        assert_eq!(map.len(), 2);
    }
}
