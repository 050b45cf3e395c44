use std::sync::{Arc, Weak};

use crate::addr::{Addr, Tuple};
use crate::pool::Pool;
use crate::MAX_UDP_PAYLOAD_LENGTH;

/// A received UDP datagram and its addressing.
///
/// Blocks are pooled per core. They travel from the receiving socket to the
/// upper layer inside a [`DatagramChain`] and return to the pool recorded in
/// the block when the chain is dropped, which may happen on any thread.
pub struct Datagram {
    pool: Weak<Pool<Datagram>>,
    pub(crate) next: Option<Box<Datagram>>,
    pub(crate) len: u16,
    pub(crate) partition: usize,
    pub(crate) tuple: Tuple,
    pub(crate) buffer: [u8; MAX_UDP_PAYLOAD_LENGTH],
    recv_context: Box<[u8]>,
}

impl Datagram {
    /// Draw a block from `pool`, resetting everything a recycled block may
    /// carry over from its previous life.
    pub(crate) fn alloc(pool: &Arc<Pool<Datagram>>, recv_context_len: usize) -> Box<Self> {
        let mut block = pool.alloc_with(|| Self {
            pool: Weak::new(),
            next: None,
            len: 0,
            partition: 0,
            tuple: Tuple::unspecified(),
            buffer: [0; MAX_UDP_PAYLOAD_LENGTH],
            recv_context: vec![0; recv_context_len].into_boxed_slice(),
        });
        block.pool = Arc::downgrade(pool);
        block.next = None;
        block.len = 0;
        block.recv_context.fill(0);
        block
    }

    /// The UDP payload, exactly as many bytes as were received.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.len as usize]
    }

    /// The address the datagram arrived on, including the interface index.
    pub fn local(&self) -> &Addr {
        &self.tuple.local
    }

    /// The sender's address.
    pub fn remote(&self) -> &Addr {
        &self.tuple.remote
    }

    pub fn tuple(&self) -> &Tuple {
        &self.tuple
    }

    /// Index of the core that received the datagram.
    pub fn partition_index(&self) -> usize {
        self.partition
    }

    /// Upper-layer scratch space carried with the block, sized at datapath
    /// initialization and zeroed on every delivery.
    pub fn recv_context(&self) -> &[u8] {
        &self.recv_context
    }

    pub fn recv_context_mut(&mut self) -> &mut [u8] {
        &mut self.recv_context
    }
}

/// An owned chain of received datagrams.
///
/// Delivered to the receive callback and eventually handed back (or simply
/// dropped), at which point every block returns to its owning pool.
pub struct DatagramChain {
    head: Option<Box<Datagram>>,
    len: usize,
}

impl DatagramChain {
    pub fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub(crate) fn single(datagram: Box<Datagram>) -> Self {
        let mut chain = Self::new();
        chain.push(datagram);
        chain
    }

    pub fn push(&mut self, mut datagram: Box<Datagram>) {
        datagram.next = self.head.take();
        self.head = Some(datagram);
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<Box<Datagram>> {
        let mut datagram = self.head.take()?;
        self.head = datagram.next.take();
        self.len -= 1;
        Some(datagram)
    }

    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            next: self.head.as_deref(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

impl Default for DatagramChain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DatagramChain {
    fn drop(&mut self) {
        while let Some(mut block) = self.head.take() {
            self.head = block.next.take();
            if let Some(pool) = block.pool.upgrade() {
                pool.free(block);
            }
            // With the pool gone the block simply deallocates.
        }
    }
}

pub struct ChainIter<'a> {
    next: Option<&'a Datagram>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a Datagram;

    fn next(&mut self) -> Option<&'a Datagram> {
        let datagram = self.next?;
        self.next = datagram.next.as_deref();
        Some(datagram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_preserves_push_order_lifo() {
        let pool = Arc::new(Pool::new());
        let mut chain = DatagramChain::new();
        for len in [1u16, 2, 3] {
            let mut block = Datagram::alloc(&pool, 0);
            block.len = len;
            chain.push(block);
        }
        assert_eq!(chain.len(), 3);
        let lens: Vec<u16> = chain.iter().map(|d| d.len).collect();
        assert_eq!(lens, [3, 2, 1]);
    }

    #[test]
    fn dropping_a_chain_returns_blocks_to_the_pool() {
        let pool = Arc::new(Pool::new());
        let mut chain = DatagramChain::new();
        chain.push(Datagram::alloc(&pool, 8));
        chain.push(Datagram::alloc(&pool, 8));
        assert_eq!(pool.available(), 0);
        drop(chain);
        assert_eq!(pool.available(), 2);

        // Recycled blocks come back with zeroed receive context.
        let block = Datagram::alloc(&pool, 8);
        assert_eq!(block.recv_context(), &[0u8; 8][..]);
        assert!(block.payload().is_empty());
    }

    #[test]
    fn pop_detaches_the_most_recent_block() {
        let pool = Arc::new(Pool::new());
        let mut chain = DatagramChain::new();
        chain.push(Datagram::alloc(&pool, 0));
        assert!(chain.pop().is_some());
        assert!(chain.pop().is_none());
        assert!(chain.is_empty());
    }
}
