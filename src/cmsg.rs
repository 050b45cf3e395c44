//! PKTINFO control-message codec over the host `cmsghdr` ABI.
//!
//! The datapath only ever carries one kind of ancillary data: the per-packet
//! local address and interface. The codec is shaped around that contract;
//! egress headers carry exactly one PKTINFO and ingress walks stop at the
//! first match.

use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ptr;

/// Keeps control buffers aligned the way the host ABI expects.
#[derive(Copy, Clone)]
#[repr(align(8))] // Conservative bound for align_of<libc::cmsghdr>
pub(crate) struct Aligned<T>(pub(crate) T);

/// Control-buffer capacity: ample headroom for one PKTINFO of either family.
///
/// `CMSG_SPACE` is not a constant expression on every platform, so the
/// capacity is fixed here and validated against the runtime value when a
/// datapath is initialized.
pub(crate) const CMSG_CAPACITY: usize = 88;

/// Runtime upper bound on the space one PKTINFO control message needs.
pub(crate) fn space_for_pktinfo() -> usize {
    unsafe { libc::CMSG_SPACE(mem::size_of::<libc::in6_pktinfo>() as _) as usize }
}

/// Address and interface carried by a PKTINFO message: the receive
/// destination on ingress, the source selector on egress. A zero interface
/// leaves the choice to the routing table.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct PktInfo {
    pub(crate) ip: IpAddr,
    pub(crate) interface: u32,
}

/// Attach exactly one PKTINFO control message to an outgoing header, with
/// the level/type pair matching the address family of `info`.
pub(crate) fn encode_pktinfo(
    hdr: &mut libc::msghdr,
    buf: &mut Aligned<[u8; CMSG_CAPACITY]>,
    info: PktInfo,
) {
    match info.ip {
        IpAddr::V4(v4) => put(
            hdr,
            buf,
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            v4_pktinfo(v4, info.interface),
        ),
        IpAddr::V6(v6) => put(
            hdr,
            buf,
            libc::IPPROTO_IPV6,
            libc::IPV6_PKTINFO,
            libc::in6_pktinfo {
                ipi6_ifindex: info.interface as _,
                ipi6_addr: libc::in6_addr { s6_addr: v6.octets() },
            },
        ),
    }
}

/// Walk a received header's control messages and decode the first PKTINFO
/// of either family.
pub(crate) fn decode_pktinfo(hdr: &libc::msghdr) -> Option<PktInfo> {
    let mut cursor = unsafe { libc::CMSG_FIRSTHDR(hdr) };
    while !cursor.is_null() {
        let cmsg = unsafe { &*cursor };
        match (cmsg.cmsg_level, cmsg.cmsg_type) {
            (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO) => {
                let info: libc::in6_pktinfo = unsafe { payload(cmsg) };
                return Some(PktInfo {
                    ip: Ipv6Addr::from(info.ipi6_addr.s6_addr).into(),
                    interface: info.ipi6_ifindex as u32,
                });
            }
            (libc::IPPROTO_IP, libc::IP_PKTINFO) => {
                let info: libc::in_pktinfo = unsafe { payload(cmsg) };
                return Some(PktInfo {
                    ip: Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr)).into(),
                    interface: info.ipi_ifindex as u32,
                });
            }
            _ => {}
        }
        cursor = unsafe { libc::CMSG_NXTHDR(hdr, cursor) };
    }
    None
}

/// Write one control message into `buf` and size the header to exactly it.
fn put<T: Copy>(
    hdr: &mut libc::msghdr,
    buf: &mut Aligned<[u8; CMSG_CAPACITY]>,
    level: libc::c_int,
    ty: libc::c_int,
    value: T,
) {
    assert!(mem::align_of::<T>() <= mem::align_of::<libc::cmsghdr>());
    let space = unsafe { libc::CMSG_SPACE(mem::size_of::<T>() as _) as usize };
    assert!(space <= buf.0.len(), "control message buffer too small");

    hdr.msg_control = buf.0.as_mut_ptr() as _;
    hdr.msg_controllen = space as _;
    let cmsg = match unsafe { libc::CMSG_FIRSTHDR(hdr).as_mut() } {
        Some(cmsg) => cmsg,
        None => unreachable!("control buffer registered above"),
    };
    cmsg.cmsg_level = level;
    cmsg.cmsg_type = ty;
    cmsg.cmsg_len = unsafe { libc::CMSG_LEN(mem::size_of::<T>() as _) } as _;
    unsafe { ptr::write(libc::CMSG_DATA(cmsg).cast::<T>(), value) };
}

/// Copy a control message's payload out.
///
/// # Safety
///
/// The payload must be a `T`, as reflected by the message length.
unsafe fn payload<T: Copy>(cmsg: &libc::cmsghdr) -> T {
    debug_assert!(
        cmsg.cmsg_len as usize >= libc::CMSG_LEN(mem::size_of::<T>() as _) as usize
    );
    ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const T)
}

/// The kernel reads the egress source address from `ipi_spec_dst` on Linux
/// and from `ipi_addr` on Darwin.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn v4_pktinfo(src: Ipv4Addr, interface: u32) -> libc::in_pktinfo {
    libc::in_pktinfo {
        ipi_ifindex: interface as _,
        ipi_spec_dst: libc::in_addr {
            s_addr: u32::from_ne_bytes(src.octets()),
        },
        ipi_addr: libc::in_addr { s_addr: 0 },
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn v4_pktinfo(src: Ipv4Addr, interface: u32) -> libc::in_pktinfo {
    libc::in_pktinfo {
        ipi_ifindex: interface as _,
        ipi_spec_dst: libc::in_addr { s_addr: 0 },
        ipi_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(src.octets()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_hdr() -> libc::msghdr {
        unsafe { mem::zeroed() }
    }

    #[test]
    fn v6_pktinfo_round_trip() {
        let mut hdr = zeroed_hdr();
        let mut buf = Aligned([0u8; CMSG_CAPACITY]);
        let info = PktInfo {
            ip: "2001:db8::7".parse().unwrap(),
            interface: 9,
        };
        encode_pktinfo(&mut hdr, &mut buf, info);

        // The header is sized for one message and nothing more.
        assert_eq!(
            hdr.msg_controllen as usize,
            unsafe { libc::CMSG_SPACE(mem::size_of::<libc::in6_pktinfo>() as _) } as usize
        );
        assert_eq!(decode_pktinfo(&hdr), Some(info));
    }

    #[test]
    fn v4_encode_targets_the_ipv4_level() {
        let mut hdr = zeroed_hdr();
        let mut buf = Aligned([0u8; CMSG_CAPACITY]);
        encode_pktinfo(
            &mut hdr,
            &mut buf,
            PktInfo {
                ip: "192.0.2.7".parse().unwrap(),
                interface: 4,
            },
        );

        let cmsg = unsafe { &*libc::CMSG_FIRSTHDR(&hdr) };
        assert_eq!(
            (cmsg.cmsg_level, cmsg.cmsg_type),
            (libc::IPPROTO_IP, libc::IP_PKTINFO)
        );
        assert_eq!(
            cmsg.cmsg_len as usize,
            unsafe { libc::CMSG_LEN(mem::size_of::<libc::in_pktinfo>() as _) } as usize
        );
        assert!(unsafe { libc::CMSG_NXTHDR(&hdr, cmsg) }.is_null());
    }

    #[test]
    fn v4_receive_payload_decodes() {
        let mut hdr = zeroed_hdr();
        let mut buf = Aligned([0u8; CMSG_CAPACITY]);
        // Kernel receive layout: the destination rides in ipi_addr.
        let raw = libc::in_pktinfo {
            ipi_ifindex: 4 as _,
            ipi_spec_dst: libc::in_addr { s_addr: 0 },
            ipi_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes([192, 0, 2, 7]),
            },
        };
        put(&mut hdr, &mut buf, libc::IPPROTO_IP, libc::IP_PKTINFO, raw);

        let info = decode_pktinfo(&hdr).expect("pktinfo present");
        assert_eq!(info.ip, "192.0.2.7".parse::<IpAddr>().unwrap());
        assert_eq!(info.interface, 4);
    }

    #[test]
    fn unrelated_control_messages_decode_to_none() {
        let mut hdr = zeroed_hdr();
        let mut buf = Aligned([0u8; CMSG_CAPACITY]);
        put(
            &mut hdr,
            &mut buf,
            libc::IPPROTO_IP,
            libc::IP_TTL,
            64 as libc::c_int,
        );
        assert_eq!(decode_pktinfo(&hdr), None);
    }

    #[test]
    fn capacity_covers_either_family() {
        assert!(space_for_pktinfo() <= CMSG_CAPACITY);
        let v4 = unsafe { libc::CMSG_SPACE(mem::size_of::<libc::in_pktinfo>() as _) as usize };
        assert!(v4 <= CMSG_CAPACITY);
    }
}
