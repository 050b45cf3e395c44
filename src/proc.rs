//! Per-core state: one event queue, one worker thread, three pools.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use mio::{Events, Poll, Registry, Token, Waker};
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace};

use crate::datagram::Datagram;
use crate::pool::Pool;
use crate::send::{PayloadBuffer, SendContextInner};
use crate::socket::SocketContext;

const WAKER_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 32;

/// Core state shared between the worker thread and callers on other threads.
pub(crate) struct ProcShared {
    pub(crate) index: usize,
    pub(crate) registry: Registry,
    /// Sockets currently armed on this core's event queue.
    pub(crate) sockets: Mutex<FxHashMap<Token, Arc<SocketContext>>>,
    next_token: AtomicUsize,
    shutdown: AtomicBool,
    pub(crate) recv_blocks: Arc<Pool<Datagram>>,
    pub(crate) send_buffers: Arc<Pool<PayloadBuffer>>,
    pub(crate) send_contexts: Arc<Pool<SendContextInner>>,
    pub(crate) recv_context_len: usize,
}

impl ProcShared {
    pub(crate) fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) struct ProcContext {
    pub(crate) shared: Arc<ProcShared>,
    waker: Waker,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ProcContext {
    /// Build the event queue and pools for one core and start its worker.
    pub(crate) fn new(index: usize, recv_context_len: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let shared = Arc::new(ProcShared {
            index,
            registry,
            sockets: Mutex::new(FxHashMap::default()),
            next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
            shutdown: AtomicBool::new(false),
            recv_blocks: Arc::new(Pool::new()),
            send_buffers: Arc::new(Pool::new()),
            send_contexts: Arc::new(Pool::new()),
            recv_context_len,
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("datapath-{index}"))
            .spawn(move || run_worker(worker_shared, poll))?;

        Ok(Self {
            shared,
            waker,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Latch shutdown, kick the worker out of its wait, and join it.
    pub(crate) fn shutdown_and_join(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            error!(error = %err, "failed to wake datapath worker");
        }
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(index = self.shared.index, "datapath worker panicked");
            }
        }
    }
}

/// The worker blocks on the event queue until shutdown. Readable (or error)
/// events drain receives; writable events resume parked sends. The upper
/// layer's callback runs inline here with no locks held, so it may post
/// sends reentrantly on any socket.
fn run_worker(shared: Arc<ProcShared>, mut poll: Poll) {
    let mut events = Events::with_capacity(EVENT_CAPACITY);
    debug!(index = shared.index, "datapath worker running");
    while !shared.shutdown.load(Ordering::Acquire) {
        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                // Spurious wakeup; keep looping.
                continue;
            }
            error!(error = %err, "event queue wait failed");
            break;
        }
        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                // Shutdown is re-checked at the top of the loop.
                continue;
            }
            let socket = shared.sockets.lock().unwrap().get(&token).cloned();
            let Some(socket) = socket else {
                trace!(?token, "event for a departed socket");
                continue;
            };
            if event.is_readable() || event.is_error() {
                socket.drain_receives();
            }
            if event.is_writable() {
                socket.drain_pending_sends();
            }
        }
    }
    debug!(index = shared.index, "datapath worker exiting");
}
