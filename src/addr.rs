use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;

/// A socket address paired with the interface it arrived on or should leave
/// through.
///
/// The interface index is an explicit field rather than being smuggled
/// through the IPv6 zone: IPv4 PKTINFO needs it on egress too. A zero index
/// leaves interface selection to the routing table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Addr {
    socket: SocketAddr,
    interface: u32,
}

impl Addr {
    pub fn new(socket: SocketAddr) -> Self {
        Self {
            socket,
            interface: 0,
        }
    }

    pub fn with_interface(socket: SocketAddr, interface: u32) -> Self {
        Self { socket, interface }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.socket
    }

    pub fn ip(&self) -> IpAddr {
        self.socket.ip()
    }

    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    pub fn interface_index(&self) -> u32 {
        self.interface
    }

    pub fn is_ipv4(&self) -> bool {
        self.socket.is_ipv4()
    }

    /// Collapse a v4-mapped IPv6 address into its IPv4 form.
    ///
    /// Dual-stack sockets report IPv4 traffic with mapped addresses; the
    /// datapath unmaps on ingress and never re-maps on egress, so callers
    /// only ever observe native-family addresses.
    pub(crate) fn unmap(self) -> Self {
        match self.socket {
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => Self {
                    socket: SocketAddr::V4(SocketAddrV4::new(v4, v6.port())),
                    interface: self.interface,
                },
                None => self,
            },
            SocketAddr::V4(_) => self,
        }
    }

    /// Wildcard address of the requested family, port 0.
    pub(crate) fn unspecified(ipv4: bool) -> Self {
        let ip: IpAddr = if ipv4 {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        Self::new(SocketAddr::new(ip, 0))
    }
}

impl From<SocketAddr> for Addr {
    fn from(socket: SocketAddr) -> Self {
        Self::new(socket)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket.fmt(f)
    }
}

/// Local and remote address of a received datagram.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Tuple {
    pub local: Addr,
    pub remote: Addr,
}

impl Tuple {
    pub(crate) fn unspecified() -> Self {
        Self {
            local: Addr::unspecified(false),
            remote: Addr::unspecified(false),
        }
    }
}

/// Decode the `msg_name` of a received message.
pub(crate) fn decode_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            let v4: libc::sockaddr_in = unsafe { ptr::read(storage as *const _ as *const _) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr)),
                u16::from_be(v4.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let v6: libc::sockaddr_in6 = unsafe { ptr::read(storage as *const _ as *const _) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(v6.sin6_addr.s6_addr),
                u16::from_be(v6.sin6_port),
                v6.sin6_flowinfo,
                v6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmap_collapses_mapped_v4() {
        let mapped: SocketAddr = "[::ffff:192.0.2.7]:443".parse().unwrap();
        let addr = Addr::with_interface(mapped, 3).unmap();
        assert_eq!(addr.socket_addr(), "192.0.2.7:443".parse().unwrap());
        assert_eq!(addr.interface_index(), 3);
    }

    #[test]
    fn unmap_leaves_native_addresses() {
        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(Addr::new(v6).unmap().socket_addr(), v6);
        let v4: SocketAddr = "192.0.2.7:443".parse().unwrap();
        assert_eq!(Addr::new(v4).unmap().socket_addr(), v4);
    }
}
