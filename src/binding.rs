//! A logical UDP endpoint fanned out to one socket per core.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::addr::Addr;
use crate::datagram::DatagramChain;
use crate::datapath::DatapathInner;
use crate::rundown::Rundown;
use crate::send::{SendContext, SendContextInner, SendOutcome};
use crate::socket::{open_socket, SocketContext};
use crate::{DatapathError, MAX_MTU};

/// Socket buffer parameters adjustable per binding.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Param {
    RecvBufferSize,
    SendBufferSize,
}

pub(crate) struct BindingInner {
    pub(crate) datapath: Arc<DatapathInner>,
    context: Box<dyn Any + Send + Sync>,
    pub(crate) local: Addr,
    pub(crate) remote: Option<Addr>,
    pub(crate) connected: bool,
    pub(crate) mtu: u16,
    /// Drain barrier for in-flight upcalls; teardown waits on it.
    pub(crate) rundown: Rundown,
    pub(crate) shutdown: AtomicBool,
    pub(crate) sockets: Vec<Arc<SocketContext>>,
}

impl BindingInner {
    pub(crate) fn deliver(self: &Arc<Self>, datagrams: DatagramChain) {
        let handle = Binding {
            inner: self.clone(),
            owned: false,
        };
        self.datapath.events.datagrams_received(&handle, datagrams);
    }

    pub(crate) fn deliver_unreachable(self: &Arc<Self>, remote: &Addr) {
        let handle = Binding {
            inner: self.clone(),
            owned: false,
        };
        self.datapath.events.remote_unreachable(&handle, remote);
    }
}

/// A logical UDP endpoint: one local address, optional connected remote,
/// one socket per core sharing the port.
///
/// Handed out by [`Datapath::create_binding`](crate::Datapath::create_binding)
/// and passed by reference to callbacks. Dropping (or [`delete`](Self::delete)-ing)
/// the created handle tears the endpoint down and blocks until every
/// in-flight receive callback has returned; never do so from inside a
/// callback.
pub struct Binding {
    inner: Arc<BindingInner>,
    owned: bool,
}

impl Binding {
    pub(crate) fn create(
        datapath: &Arc<DatapathInner>,
        local: Option<&Addr>,
        remote: Option<&Addr>,
        context: Box<dyn Any + Send + Sync>,
    ) -> Result<Self, DatapathError> {
        if local.is_none() && remote.is_none() {
            return Err(DatapathError::InvalidParameter);
        }
        if let (Some(local), Some(remote)) = (local, remote) {
            if local.is_ipv4() != remote.is_ipv4() {
                return Err(DatapathError::InvalidParameter);
            }
        }

        let requested_port = local.map(Addr::port).unwrap_or(0);
        let mut bound = match (local, remote) {
            (Some(local), _) => *local,
            (None, Some(remote)) => Addr::unspecified(remote.is_ipv4()),
            (None, None) => unreachable!(),
        };

        // Connected (client-style) bindings take a single socket: every
        // per-core socket would otherwise occupy the identical four-tuple.
        let socket_count = if remote.is_some() {
            1
        } else {
            datapath.procs.len()
        };

        // The first bind picks the port, the rest share it.
        let mut raw_sockets = Vec::with_capacity(socket_count);
        for _ in 0..socket_count {
            let (socket, assigned) = open_socket(&bound, remote)?;
            bound = Addr::with_interface(assigned, bound.interface_index());
            raw_sockets.push(socket);
        }
        if requested_port != 0 {
            debug_assert_eq!(requested_port, bound.port());
        }

        if !datapath.bindings_rundown.acquire() {
            // The datapath is shutting down.
            return Err(DatapathError::InvalidParameter);
        }

        let mut cores = Vec::with_capacity(socket_count);
        for proc in datapath.procs.iter().take(socket_count) {
            match proc.shared.registry.try_clone() {
                Ok(registry) => cores.push((proc.shared.clone(), registry)),
                Err(err) => {
                    datapath.bindings_rundown.release();
                    return Err(DatapathError::Internal(err));
                }
            }
        }

        let inner = Arc::new_cyclic(|weak| BindingInner {
            datapath: datapath.clone(),
            context,
            local: bound,
            remote: remote.copied(),
            connected: remote.is_some(),
            mtu: MAX_MTU,
            rundown: Rundown::new(),
            shutdown: AtomicBool::new(false),
            sockets: raw_sockets
                .into_iter()
                .zip(cores)
                .enumerate()
                .map(|(partition, (socket, (shared, registry)))| {
                    let token = shared.next_token();
                    Arc::new(SocketContext::new(
                        weak.clone(),
                        socket,
                        token,
                        partition,
                        shared,
                        registry,
                    ))
                })
                .collect(),
        });

        // Arm receives: publish each socket in its core's map first so the
        // worker can resolve events the instant registration lands.
        for (partition, socket) in inner.sockets.iter().enumerate() {
            socket.start_receive();
            let shared = &datapath.procs[partition].shared;
            shared
                .sockets
                .lock()
                .unwrap()
                .insert(socket.token, socket.clone());
            if let Err(err) = socket.register() {
                warn!(error = %err, "event queue registration failed");
                Self::teardown(&inner);
                return Err(DatapathError::Internal(err));
            }
        }

        debug!(local = %inner.local, connected = inner.connected, "binding created");
        Ok(Self { inner, owned: true })
    }

    fn teardown(inner: &Arc<BindingInner>) {
        inner.shutdown.store(true, Ordering::Release);
        for socket in &inner.sockets {
            socket.shutdown.store(true, Ordering::Release);
            let shared = &inner.datapath.procs[socket.partition].shared;
            shared.sockets.lock().unwrap().remove(&socket.token);
            socket.deregister();
        }
        // Block until every in-flight upcall has returned.
        inner.rundown.release_and_wait();
        inner.datapath.bindings_rundown.release();
    }

    /// Tear the binding down. Equivalent to dropping the handle; on return
    /// no further callbacks will fire for this binding.
    pub fn delete(self) {}

    pub fn local_addr(&self) -> Addr {
        self.inner.local
    }

    /// The connected remote. `None` for bindings created without one.
    pub fn remote_addr(&self) -> Option<Addr> {
        self.inner.remote
    }

    pub fn local_mtu(&self) -> u16 {
        self.inner.mtu
    }

    /// The opaque per-binding context supplied at creation.
    pub fn context(&self) -> &(dyn Any + Send + Sync) {
        &*self.inner.context
    }

    /// Allocate an empty send context. Contexts draw their buffers from the
    /// per-core pools, rotating cores to spread pool pressure.
    pub fn alloc_send_context(&self) -> SendContext {
        let partition = self.inner.datapath.next_send_partition();
        let shared = &self.inner.datapath.procs[partition].shared;
        SendContext::from_inner(SendContextInner::alloc(
            &shared.send_contexts,
            &shared.send_buffers,
        ))
    }

    /// Send the batch to `remote`, letting the kernel pick the source
    /// address. Connected bindings send without a destination.
    pub fn send_to(
        &self,
        remote: &Addr,
        ctx: SendContext,
    ) -> Result<SendOutcome, DatapathError> {
        self.send_internal(None, remote, ctx)
    }

    /// Send the batch to `remote` from the explicit `local` address and
    /// interface, carried as a PKTINFO control message.
    pub fn send_from_to(
        &self,
        local: &Addr,
        remote: &Addr,
        ctx: SendContext,
    ) -> Result<SendOutcome, DatapathError> {
        self.send_internal(Some(*local), remote, ctx)
    }

    fn send_internal(
        &self,
        local: Option<Addr>,
        remote: &Addr,
        ctx: SendContext,
    ) -> Result<SendOutcome, DatapathError> {
        if remote.port() == 0 {
            return Err(DatapathError::InvalidParameter);
        }
        let Some(mut inner_ctx) = ctx.take_inner() else {
            return Err(DatapathError::InvalidParameter);
        };
        if self.inner.shutdown.load(Ordering::Acquire) {
            crate::send::free_send_context(inner_ctx);
            return Err(DatapathError::InvalidParameter);
        }
        if inner_ctx.buffers.is_empty() {
            crate::send::free_send_context(inner_ctx);
            return Ok(SendOutcome::Sent);
        }
        inner_ctx.local = local;
        inner_ctx.remote = Some(*remote);

        let partition = self
            .inner
            .datapath
            .partition_for(remote, self.inner.sockets.len());
        self.inner.sockets[partition].send(&self.inner, inner_ctx)
    }

    /// Apply a socket buffer parameter to every socket of the binding.
    pub fn set_param(&self, param: Param, value: usize) -> Result<(), DatapathError> {
        for socket in &self.inner.sockets {
            match param {
                Param::RecvBufferSize => socket.socket.set_recv_buffer_size(value)?,
                Param::SendBufferSize => socket.socket.set_send_buffer_size(value)?,
            }
        }
        Ok(())
    }

    pub fn get_param(&self, param: Param) -> Result<usize, DatapathError> {
        let socket = self
            .inner
            .sockets
            .first()
            .ok_or(DatapathError::InvalidParameter)?;
        Ok(match param {
            Param::RecvBufferSize => socket.socket.recv_buffer_size()?,
            Param::SendBufferSize => socket.socket.send_buffer_size()?,
        })
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        if self.owned {
            Self::teardown(&self.inner);
            debug!(local = %self.inner.local, "binding deleted");
        }
    }
}
