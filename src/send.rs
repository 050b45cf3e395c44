use std::sync::{Arc, Weak};

use tracing::trace;

use crate::addr::Addr;
use crate::pool::Pool;
use crate::{MAX_SEND_BATCH_SIZE, MAX_UDP_PAYLOAD_LENGTH};

pub(crate) type PayloadBuffer = [u8; MAX_UDP_PAYLOAD_LENGTH];

/// One pooled datagram buffer queued in a send context.
pub(crate) struct SendBuffer {
    pub(crate) data: Box<PayloadBuffer>,
    pub(crate) len: u16,
}

/// Disposition of a send call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOutcome {
    /// Every buffer was handed to the kernel.
    Sent,
    /// The socket would block. The datapath retained the context and will
    /// resume it from its cursor once the socket signals write readiness.
    Pending,
}

/// A batched set of outgoing buffers targeted at a single remote.
///
/// Holds at most [`MAX_SEND_BATCH_SIZE`] buffers. Consumed by
/// [`Binding::send_to`](crate::Binding::send_to) and
/// [`Binding::send_from_to`](crate::Binding::send_from_to); dropping an
/// unsent context returns the buffers to their pools.
pub struct SendContext {
    inner: Option<Box<SendContextInner>>,
}

impl SendContext {
    pub(crate) fn from_inner(inner: Box<SendContextInner>) -> Self {
        Self { inner: Some(inner) }
    }

    pub(crate) fn take_inner(mut self) -> Option<Box<SendContextInner>> {
        self.inner.take()
    }

    /// Reserve the next datagram buffer and return it for the caller to
    /// fill. Refuses once the batch bound is reached or when `len` exceeds
    /// the payload cap.
    pub fn alloc_datagram(&mut self, len: u16) -> Option<&mut [u8]> {
        let inner = self.inner.as_mut()?;
        if len as usize > MAX_UDP_PAYLOAD_LENGTH {
            return None;
        }
        if inner.buffers.len() == MAX_SEND_BATCH_SIZE {
            trace!("send batch limit hit");
            return None;
        }
        let pool = inner.buf_pool.upgrade()?;
        let data = pool.alloc_with(|| [0; MAX_UDP_PAYLOAD_LENGTH]);
        inner.buffers.push(SendBuffer { data, len });
        inner
            .buffers
            .last_mut()
            .map(|buffer| &mut buffer.data[..len as usize])
    }

    /// Release the most recently allocated datagram buffer.
    pub fn free_last_datagram(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            if let Some(buffer) = inner.buffers.pop() {
                if let Some(pool) = inner.buf_pool.upgrade() {
                    pool.free(buffer.data);
                }
            }
        }
    }

    pub fn is_full(&self) -> bool {
        self.inner
            .as_ref()
            .map(|inner| inner.buffers.len() == MAX_SEND_BATCH_SIZE)
            .unwrap_or(true)
    }

    pub fn datagram_count(&self) -> usize {
        self.inner
            .as_ref()
            .map(|inner| inner.buffers.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.datagram_count() == 0
    }
}

impl Drop for SendContext {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            free_send_context(inner);
        }
    }
}

/// The pooled interior of a send context. The public wrapper hands this to
/// the socket layer at send time; a pending send keeps it parked on the
/// socket until write readiness.
pub(crate) struct SendContextInner {
    ctx_pool: Weak<Pool<SendContextInner>>,
    buf_pool: Weak<Pool<PayloadBuffer>>,
    pub(crate) buffers: Vec<SendBuffer>,
    /// First buffer not yet handed to the kernel.
    pub(crate) current_index: usize,
    pub(crate) local: Option<Addr>,
    pub(crate) remote: Option<Addr>,
}

impl SendContextInner {
    pub(crate) fn alloc(
        ctx_pool: &Arc<Pool<SendContextInner>>,
        buf_pool: &Arc<Pool<PayloadBuffer>>,
    ) -> Box<Self> {
        let mut inner = ctx_pool.alloc_with(|| Self {
            ctx_pool: Weak::new(),
            buf_pool: Weak::new(),
            buffers: Vec::with_capacity(MAX_SEND_BATCH_SIZE),
            current_index: 0,
            local: None,
            remote: None,
        });
        debug_assert!(inner.buffers.is_empty() && inner.current_index == 0);
        inner.ctx_pool = Arc::downgrade(ctx_pool);
        inner.buf_pool = Arc::downgrade(buf_pool);
        inner
    }
}

/// Return a context and its buffers to their pools.
pub(crate) fn free_send_context(mut inner: Box<SendContextInner>) {
    match inner.buf_pool.upgrade() {
        Some(pool) => {
            for buffer in inner.buffers.drain(..) {
                pool.free(buffer.data);
            }
        }
        None => inner.buffers.clear(),
    }
    inner.current_index = 0;
    inner.local = None;
    inner.remote = None;
    if let Some(pool) = inner.ctx_pool.upgrade() {
        pool.free(inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> (
        Arc<Pool<SendContextInner>>,
        Arc<Pool<PayloadBuffer>>,
        SendContext,
    ) {
        let ctx_pool = Arc::new(Pool::new());
        let buf_pool = Arc::new(Pool::new());
        let ctx = SendContext::from_inner(SendContextInner::alloc(&ctx_pool, &buf_pool));
        (ctx_pool, buf_pool, ctx)
    }

    #[test]
    fn rejects_allocations_past_the_batch_bound() {
        let (_ctx_pool, _buf_pool, mut ctx) = test_context();
        for i in 0..MAX_SEND_BATCH_SIZE {
            assert!(!ctx.is_full());
            let buf = ctx.alloc_datagram(1200).expect("within batch bound");
            assert_eq!(buf.len(), 1200);
            assert_eq!(ctx.datagram_count(), i + 1);
        }
        assert!(ctx.is_full());
        assert!(ctx.alloc_datagram(1200).is_none());
        // The context is still intact and holds the first ten buffers.
        assert_eq!(ctx.datagram_count(), MAX_SEND_BATCH_SIZE);
    }

    #[test]
    fn rejects_oversized_datagrams() {
        let (_ctx_pool, _buf_pool, mut ctx) = test_context();
        assert!(ctx
            .alloc_datagram(MAX_UDP_PAYLOAD_LENGTH as u16 + 1)
            .is_none());
        assert!(ctx.alloc_datagram(MAX_UDP_PAYLOAD_LENGTH as u16).is_some());
    }

    #[test]
    fn dropping_returns_buffers_to_their_pools() {
        let (ctx_pool, buf_pool, mut ctx) = test_context();
        ctx.alloc_datagram(100);
        ctx.alloc_datagram(200);
        drop(ctx);
        assert_eq!(buf_pool.available(), 2);
        assert_eq!(ctx_pool.available(), 1);
    }

    #[test]
    fn free_last_datagram_releases_one_buffer() {
        let (_ctx_pool, buf_pool, mut ctx) = test_context();
        ctx.alloc_datagram(100);
        ctx.alloc_datagram(200);
        ctx.free_last_datagram();
        assert_eq!(ctx.datagram_count(), 1);
        assert_eq!(buf_pool.available(), 1);
    }
}
