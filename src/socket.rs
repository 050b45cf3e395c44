//! One UDP socket per core: receive arming, PKTINFO decode, send paths, and
//! the pending-send queue drained on write readiness.

use std::collections::VecDeque;
use std::io;
use std::mem::{self, MaybeUninit};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, error, trace, warn};

use crate::addr::{decode_sockaddr, Addr, Tuple};
use crate::binding::BindingInner;
use crate::cmsg::{self, Aligned, CMSG_CAPACITY};
use crate::datagram::{Datagram, DatagramChain};
use crate::proc::ProcShared;
use crate::send::{free_send_context, SendContextInner, SendOutcome};
use crate::{DatapathError, MAX_SEND_BATCH_SIZE, MIN_IPV4_HEADER_SIZE, UDP_HEADER_SIZE};

/// Create and configure the datagram socket for one core of a binding.
///
/// The effective address family comes from the remote when one is given,
/// else from the local address. Returns the socket together with the local
/// address the kernel actually assigned.
pub(crate) fn open_socket(
    local: &Addr,
    remote: Option<&Addr>,
) -> io::Result<(Socket, SocketAddr)> {
    let effective = remote.unwrap_or(local);
    let domain = if effective.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;

    if effective.is_ipv4() {
        set_option(&socket, libc::IPPROTO_IP, libc::IP_PKTINFO, 1)?;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            set_option(&socket, libc::IPPROTO_IP, libc::IP_RECVDSTADDR, 1)?;
            set_option(&socket, libc::IPPROTO_IP, libc::IP_RECVIF, 1)?;
        }
    } else {
        set_option(&socket, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1)?;
        socket.set_only_v6(false)?;
    }

    // The port is shared across cores.
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;

    socket.bind(&SockAddr::from(local.socket_addr()))?;
    if let Some(remote) = remote {
        socket.connect(&SockAddr::from(remote.socket_addr()))?;
    }

    let assigned = socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "socket has no inet address"))?;
    Ok((socket, assigned))
}

fn set_option(
    socket: &Socket,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const _ as _,
            mem::size_of_val(&value) as _,
        )
    };
    match rc {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

struct PendingSends {
    queue: VecDeque<Box<SendContextInner>>,
    write_interest: bool,
}

/// One UDP socket plus its receive arming state and pending-send queue.
pub(crate) struct SocketContext {
    binding: Weak<BindingInner>,
    pub(crate) socket: Socket,
    pub(crate) token: Token,
    pub(crate) partition: usize,
    proc: Arc<ProcShared>,
    registry: Registry,
    /// Exactly one receive is armed at a time; the slot is empty while the
    /// received block is on its way to the upper layer.
    current_recv: Mutex<Option<Box<Datagram>>>,
    pending: Mutex<PendingSends>,
    pub(crate) shutdown: AtomicBool,
}

impl SocketContext {
    pub(crate) fn new(
        binding: Weak<BindingInner>,
        socket: Socket,
        token: Token,
        partition: usize,
        proc: Arc<ProcShared>,
        registry: Registry,
    ) -> Self {
        Self {
            binding,
            socket,
            token,
            partition,
            proc,
            registry,
            current_recv: Mutex::new(None),
            pending: Mutex::new(PendingSends {
                queue: VecDeque::new(),
                write_interest: false,
            }),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Register with the owning core's event queue for read readiness.
    /// Edge-triggered on both kqueue (`EV_CLEAR`) and epoll (`EPOLLET`).
    pub(crate) fn register(&self) -> io::Result<()> {
        self.registry.register(
            &mut SourceFd(&self.socket.as_raw_fd()),
            self.token,
            Interest::READABLE,
        )
    }

    pub(crate) fn deregister(&self) {
        if let Err(err) = self
            .registry
            .deregister(&mut SourceFd(&self.socket.as_raw_fd()))
        {
            debug!(error = %err, "socket deregistration failed");
        }
    }

    fn set_interest(&self, interest: Interest) -> io::Result<()> {
        self.registry
            .reregister(&mut SourceFd(&self.socket.as_raw_fd()), self.token, interest)
    }

    /// Arm the first receive. Called once the socket is published to its
    /// core; later re-arming happens inline in the drain loop.
    pub(crate) fn start_receive(&self) {
        let mut slot = self.current_recv.lock().unwrap();
        if slot.is_none() {
            *slot = Some(Datagram::alloc(
                &self.proc.recv_blocks,
                self.proc.recv_context_len,
            ));
        }
    }

    /// Pull every queued datagram off the socket, invoking the receive
    /// callback for each. Runs on the owning core's worker; receives stay
    /// strictly serialized per socket.
    pub(crate) fn drain_receives(&self) {
        let Some(binding) = self.binding.upgrade() else {
            return;
        };
        // The guard keeps the rundown reference balanced even if an upcall
        // unwinds out of the drain.
        let Some(_guard) = binding.rundown.enter() else {
            return;
        };
        self.drain_receives_locked(&binding);
    }

    fn drain_receives_locked(&self, binding: &Arc<BindingInner>) {
        let recv_len =
            (binding.mtu - MIN_IPV4_HEADER_SIZE - UDP_HEADER_SIZE) as usize;
        loop {
            if self.shutdown.load(Ordering::Acquire)
                || binding.shutdown.load(Ordering::Acquire)
            {
                return;
            }

            let mut slot = self.current_recv.lock().unwrap();
            let block = slot.get_or_insert_with(|| {
                Datagram::alloc(&self.proc.recv_blocks, self.proc.recv_context_len)
            });

            let mut name = MaybeUninit::<libc::sockaddr_storage>::uninit();
            let mut ctrl = Aligned(MaybeUninit::<[u8; CMSG_CAPACITY]>::uninit());
            let mut iov = libc::iovec {
                iov_base: block.buffer.as_mut_ptr() as *mut _,
                iov_len: recv_len,
            };
            let mut hdr = unsafe { mem::zeroed::<libc::msghdr>() };
            hdr.msg_name = name.as_mut_ptr() as *mut _;
            hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as _;
            hdr.msg_iov = &mut iov;
            hdr.msg_iovlen = 1;
            hdr.msg_control = ctrl.0.as_mut_ptr() as *mut _;
            hdr.msg_controllen = CMSG_CAPACITY as _;

            let n = unsafe { libc::recvmsg(self.socket.as_raw_fd(), &mut hdr, 0) };
            if n == -1 {
                drop(slot);
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => return,
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::ConnectionRefused => {
                        // The connected remote bounced a previous send; the
                        // kernel reports it here in place of ICMP delivery.
                        if let Some(remote) = binding.remote {
                            debug!(%remote, "remote endpoint unreachable");
                            binding.deliver_unreachable(&remote);
                        }
                        continue;
                    }
                    _ => {
                        warn!(error = %err, "recvmsg failed");
                        return;
                    }
                }
            }

            if hdr.msg_flags & libc::MSG_TRUNC != 0 {
                // An oversized datagram was cut short by the kernel; the
                // payload is unusable. The armed block is reused as is.
                drop(slot);
                warn!(bytes = n, "truncated datagram dropped");
                continue;
            }

            let Some(mut block) = slot.take() else {
                return;
            };
            drop(slot);

            let name = unsafe { name.assume_init() };
            let Some(remote) = decode_sockaddr(&name) else {
                warn!("datagram without a decodable source address");
                *self.current_recv.lock().unwrap() = Some(block);
                continue;
            };

            // The socket options guarantee a PKTINFO on every datagram; the
            // receive destination is a hard prerequisite for multi-address
            // endpoints.
            let local = match cmsg::decode_pktinfo(&hdr) {
                Some(info) => local_addr_from(info, binding.local.port()),
                None => {
                    error!("received datagram without packet info");
                    std::process::abort();
                }
            };

            block.tuple = Tuple {
                local,
                remote: Addr::new(remote).unmap(),
            };
            block.len = n as u16;
            block.partition = self.proc.index;
            trace!(
                bytes = n,
                src = %block.tuple.remote,
                dst = %block.tuple.local,
                "datagram received"
            );

            binding.deliver(DatagramChain::single(block));
            // Next loop iteration re-arms the receive with a fresh block.
        }
    }

    /// Submit a send on the caller's thread. `WouldBlock` parks the context
    /// on this socket and arms write readiness; the worker resumes it.
    pub(crate) fn send(
        &self,
        binding: &Arc<BindingInner>,
        mut ctx: Box<SendContextInner>,
    ) -> Result<SendOutcome, DatapathError> {
        {
            // Park behind sends that are already waiting so the socket
            // drains in submission order.
            let mut pending = self.pending.lock().unwrap();
            if !pending.queue.is_empty() {
                self.park_locked(&mut pending, ctx);
                return Ok(SendOutcome::Pending);
            }
        }

        match self.send_buffers(binding, &mut ctx) {
            Ok(()) => {
                free_send_context(ctx);
                Ok(SendOutcome::Sent)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                let mut pending = self.pending.lock().unwrap();
                self.park_locked(&mut pending, ctx);
                Ok(SendOutcome::Pending)
            }
            Err(err) => {
                warn!(error = %err, "send failed");
                free_send_context(ctx);
                Err(err.into())
            }
        }
    }

    fn park_locked(&self, pending: &mut PendingSends, ctx: Box<SendContextInner>) {
        pending.queue.push_back(ctx);
        if !pending.write_interest {
            match self.set_interest(Interest::READABLE | Interest::WRITABLE) {
                Ok(()) => pending.write_interest = true,
                Err(err) => error!(error = %err, "failed to arm write readiness"),
            }
        }
        trace!(queued = pending.queue.len(), "send pending");
    }

    /// Resume parked sends on write readiness. Runs on the owning core's
    /// worker; once the queue empties the socket drops back to read-only
    /// interest.
    pub(crate) fn drain_pending_sends(&self) {
        let Some(binding) = self.binding.upgrade() else {
            return;
        };
        let Some(_guard) = binding.rundown.enter() else {
            return;
        };
        loop {
            let mut ctx = {
                let mut pending = self.pending.lock().unwrap();
                match pending.queue.pop_front() {
                    Some(ctx) => ctx,
                    None => {
                        if pending.write_interest {
                            if let Err(err) = self.set_interest(Interest::READABLE) {
                                warn!(error = %err, "failed to drop write readiness");
                            }
                            pending.write_interest = false;
                        }
                        break;
                    }
                }
            };
            match self.send_buffers(&binding, &mut ctx) {
                Ok(()) => free_send_context(ctx),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.pending.lock().unwrap().queue.push_front(ctx);
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "pending send failed");
                    free_send_context(ctx);
                }
            }
        }
    }

    fn send_buffers(
        &self,
        binding: &Arc<BindingInner>,
        ctx: &mut SendContextInner,
    ) -> io::Result<()> {
        match ctx.local {
            None => self.send_sequential(binding, ctx),
            Some(local) => self.send_gathered(binding, ctx, &local),
        }
    }

    /// Plain sends, one datagram per buffer, resuming at the cursor. A
    /// connected socket must not be handed a destination (`EISCONN`).
    fn send_sequential(
        &self,
        binding: &Arc<BindingInner>,
        ctx: &mut SendContextInner,
    ) -> io::Result<()> {
        let remote = ctx
            .remote
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "send without remote"))?;
        let dst = SockAddr::from(remote.socket_addr());
        while ctx.current_index < ctx.buffers.len() {
            let buffer = &ctx.buffers[ctx.current_index];
            let payload = &buffer.data[..buffer.len as usize];
            let result = if binding.connected {
                self.socket.send(payload)
            } else {
                self.socket.send_to(payload, &dst)
            };
            match result {
                Ok(sent) => {
                    trace!(bytes = sent, dst = %remote, "sendto complete");
                    ctx.current_index += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Source-address-controlled send: one `sendmsg` gathering the unsent
    /// buffers, with exactly one PKTINFO control message selecting the local
    /// address and interface.
    fn send_gathered(
        &self,
        binding: &Arc<BindingInner>,
        ctx: &mut SendContextInner,
        local: &Addr,
    ) -> io::Result<()> {
        if ctx.current_index >= ctx.buffers.len() {
            return Ok(());
        }
        let remote = ctx
            .remote
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "send without remote"))?;

        let mut iovs: [libc::iovec; MAX_SEND_BATCH_SIZE] = unsafe { mem::zeroed() };
        let tail = &ctx.buffers[ctx.current_index..];
        for (iov, buffer) in iovs.iter_mut().zip(tail) {
            iov.iov_base = buffer.data.as_ptr() as *const _ as *mut _;
            iov.iov_len = buffer.len as usize;
        }

        let dst = SockAddr::from(remote.socket_addr());
        let mut hdr = unsafe { mem::zeroed::<libc::msghdr>() };
        if !binding.connected {
            hdr.msg_name = dst.as_ptr() as *const _ as *mut _;
            hdr.msg_namelen = dst.len();
        }
        hdr.msg_iov = iovs.as_mut_ptr();
        hdr.msg_iovlen = tail.len() as _;

        let mut ctrl = Aligned([0u8; CMSG_CAPACITY]);
        cmsg::encode_pktinfo(
            &mut hdr,
            &mut ctrl,
            cmsg::PktInfo {
                ip: local.ip(),
                interface: local.interface_index(),
            },
        );

        loop {
            let n = unsafe { libc::sendmsg(self.socket.as_raw_fd(), &hdr, 0) };
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            trace!(bytes = n, dst = %remote, src = %local, "sendmsg complete");
            ctx.current_index = ctx.buffers.len();
            return Ok(());
        }
    }
}

impl Drop for SocketContext {
    fn drop(&mut self) {
        if let Ok(pending) = self.pending.get_mut() {
            while let Some(ctx) = pending.queue.pop_front() {
                free_send_context(ctx);
            }
        }
    }
}

/// Local address of a received datagram: the PKTINFO destination plus the
/// binding's bound port, unmapped to its native family.
fn local_addr_from(info: cmsg::PktInfo, port: u16) -> Addr {
    Addr::with_interface(SocketAddr::new(info.ip, port), info.interface).unmap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmsg::PktInfo;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    #[test]
    fn local_addr_carries_the_bound_port_and_interface() {
        let info = PktInfo {
            ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
            interface: 2,
        };
        let local = local_addr_from(info, 4433);
        assert_eq!(local.ip(), Ipv6Addr::LOCALHOST);
        assert_eq!(local.port(), 4433);
        assert_eq!(local.interface_index(), 2);
    }

    #[test]
    fn mapped_v4_local_addr_is_unmapped() {
        let info = PktInfo {
            ip: IpAddr::V6(Ipv4Addr::new(127, 0, 0, 1).to_ipv6_mapped()),
            interface: 0,
        };
        let local = local_addr_from(info, 4433);
        assert!(local.is_ipv4());
        assert_eq!(local.ip(), Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(local.port(), 4433);
    }
}
