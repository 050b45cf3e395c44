//! The root handle: per-core engines, binding creation, resolver.

use std::any::Any;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rustc_hash::FxHasher;
use tracing::debug;

use crate::addr::Addr;
use crate::binding::Binding;
use crate::cmsg;
use crate::datagram::DatagramChain;
use crate::proc::ProcContext;
use crate::rundown::Rundown;
use crate::{DatapathError, Features, MAX_SEND_BATCH_SIZE};

/// How sends are spread across the per-core sockets of a binding.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum Partitioner {
    /// Hash of the remote address; a given peer sticks to one core.
    #[default]
    RemoteHash,
    /// Successive sends rotate across cores.
    RoundRobin,
}

/// Datapath construction knobs.
#[derive(Debug, Default, Clone)]
pub struct DatapathConfig {
    /// Worker and event-queue count; defaults to the logical CPU count.
    pub proc_count: Option<usize>,
    pub partitioner: Partitioner,
}

/// Upper-layer callbacks. Both run inline on a datapath worker thread.
pub trait DatapathEvents: Send + Sync + 'static {
    /// Receive upcall. The chain must eventually be dropped or passed to
    /// [`Datapath::return_recv_datagrams`] so its blocks return to their
    /// pools. Must not block indefinitely and must not delete the binding.
    fn datagrams_received(&self, binding: &Binding, datagrams: DatagramChain);

    /// The connected remote of `binding` rejected a datagram (the ICMP
    /// port-unreachable equivalent).
    fn remote_unreachable(&self, binding: &Binding, remote: &Addr) {
        let _ = (binding, remote);
    }
}

pub(crate) struct DatapathInner {
    shutdown: AtomicBool,
    pub(crate) bindings_rundown: Rundown,
    pub(crate) events: Arc<dyn DatapathEvents>,
    partitioner: Partitioner,
    send_partition: AtomicUsize,
    round_robin: AtomicUsize,
    pub(crate) procs: Vec<ProcContext>,
}

impl DatapathInner {
    /// Pick the socket a send goes out on.
    pub(crate) fn partition_for(&self, remote: &Addr, sockets: usize) -> usize {
        if sockets <= 1 {
            return 0;
        }
        match self.partitioner {
            Partitioner::RemoteHash => {
                let mut hasher = FxHasher::default();
                remote.socket_addr().hash(&mut hasher);
                hasher.finish() as usize % sockets
            }
            Partitioner::RoundRobin => {
                self.round_robin.fetch_add(1, Ordering::Relaxed) % sockets
            }
        }
    }

    /// Rotate send-context allocation across the per-core pools.
    pub(crate) fn next_send_partition(&self) -> usize {
        self.send_partition.fetch_add(1, Ordering::Relaxed) % self.procs.len()
    }
}

/// The datapath: owns the per-core event queues, workers and pools, and the
/// lifetime of every binding created from it.
///
/// Dropping (or [`shutdown`](Self::shutdown)-ing) the handle blocks until
/// all bindings have been deleted, then stops the workers.
pub struct Datapath {
    inner: Arc<DatapathInner>,
}

impl Datapath {
    /// Start the per-core engines.
    ///
    /// `client_recv_context_length` bytes of scratch space ride along with
    /// every delivered datagram for the upper layer's use.
    pub fn new(
        client_recv_context_length: usize,
        events: Arc<dyn DatapathEvents>,
        config: DatapathConfig,
    ) -> Result<Self, DatapathError> {
        // CMSG_SPACE is not a constant expression on every platform; check
        // the fixed control-buffer capacity against the runtime value once.
        assert!(
            cmsg::space_for_pktinfo() <= cmsg::CMSG_CAPACITY,
            "control message buffer too small for this platform"
        );

        let proc_count = config.proc_count.unwrap_or_else(num_cpus::get).max(1);
        let mut procs = Vec::with_capacity(proc_count);
        for index in 0..proc_count {
            match ProcContext::new(index, client_recv_context_length) {
                Ok(proc) => procs.push(proc),
                Err(err) => {
                    for proc in &procs {
                        proc.shutdown_and_join();
                    }
                    return Err(DatapathError::Internal(err));
                }
            }
        }

        debug!(procs = proc_count, "datapath initialized");
        Ok(Self {
            inner: Arc::new(DatapathInner {
                shutdown: AtomicBool::new(false),
                bindings_rundown: Rundown::new(),
                events,
                partitioner: config.partitioner,
                send_partition: AtomicUsize::new(0),
                round_robin: AtomicUsize::new(0),
                procs,
            }),
        })
    }

    /// Tear the datapath down: wait for every binding to be deleted, then
    /// stop the workers. Dropping the handle does the same.
    pub fn shutdown(self) {}

    /// Create a binding for the given local and/or remote address. Receives
    /// are armed before this returns; the callback may fire immediately.
    pub fn create_binding(
        &self,
        local: Option<&Addr>,
        remote: Option<&Addr>,
        context: Box<dyn Any + Send + Sync>,
    ) -> Result<Binding, DatapathError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(DatapathError::InvalidParameter);
        }
        Binding::create(&self.inner, local, remote, context)
    }

    pub fn supported_features(&self) -> Features {
        Features::default()
    }

    /// Whether the upper layer should pad datagrams to the path MTU. Always
    /// `false` without segmentation offload.
    pub fn is_padding_preferred(&self) -> bool {
        false
    }

    pub fn max_send_batch_size(&self) -> usize {
        MAX_SEND_BATCH_SIZE
    }

    /// Return a delivered datagram chain to its owning pools. Dropping the
    /// chain is equivalent; this spelling exists for call sites that want
    /// the transfer to read explicitly.
    pub fn return_recv_datagrams(datagrams: DatagramChain) {
        drop(datagrams);
    }

    /// Resolve a hostname to an address with port 0, numeric forms first,
    /// then the system resolver.
    pub fn resolve_address(&self, host: &str) -> Result<Addr, DatapathError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Addr::new(SocketAddr::new(ip, 0)).unmap());
        }
        let mut candidates = (host, 0u16).to_socket_addrs().map_err(|err| {
            debug!(host, error = %err, "hostname resolution failed");
            DatapathError::DnsResolution
        })?;
        match candidates.next() {
            Some(addr) => Ok(Addr::new(addr).unmap()),
            None => Err(DatapathError::DnsResolution),
        }
    }
}

impl Drop for Datapath {
    fn drop(&mut self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        // No new bindings from here on; wait for the existing ones.
        self.inner.bindings_rundown.release_and_wait();
        for proc in &self.inner.procs {
            proc.shutdown_and_join();
        }
        debug!("datapath shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner_with(partitioner: Partitioner) -> DatapathInner {
        DatapathInner {
            shutdown: AtomicBool::new(false),
            bindings_rundown: Rundown::new(),
            events: Arc::new(NoEvents),
            partitioner,
            send_partition: AtomicUsize::new(0),
            round_robin: AtomicUsize::new(0),
            procs: Vec::new(),
        }
    }

    struct NoEvents;
    impl DatapathEvents for NoEvents {
        fn datagrams_received(&self, _binding: &Binding, _datagrams: DatagramChain) {}
    }

    #[test]
    fn remote_hash_is_stable_per_peer() {
        let inner = inner_with(Partitioner::RemoteHash);
        let remote = Addr::new("192.0.2.1:4433".parse().unwrap());
        let first = inner.partition_for(&remote, 4);
        for _ in 0..8 {
            assert_eq!(inner.partition_for(&remote, 4), first);
        }
        assert!(first < 4);
    }

    #[test]
    fn round_robin_cycles() {
        let inner = inner_with(Partitioner::RoundRobin);
        let remote = Addr::new("192.0.2.1:4433".parse().unwrap());
        let picks: Vec<usize> = (0..4).map(|_| inner.partition_for(&remote, 4)).collect();
        assert_eq!(picks, [0, 1, 2, 3]);
    }

    #[test]
    fn single_socket_bindings_always_use_the_first() {
        let inner = inner_with(Partitioner::RemoteHash);
        let remote = Addr::new("[2001:db8::1]:4433".parse().unwrap());
        assert_eq!(inner.partition_for(&remote, 1), 0);
    }
}
