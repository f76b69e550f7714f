//! Fixed pool of receive buffers.
//!
//! Buffers are allocated once at startup and cycle between the pool, a
//! receive thread, a worker queue and a worker. The pool never grows; when
//! it runs dry reception pauses until workers hand buffers back.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::error;

use crate::store::VrfId;

/// Who currently holds a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Custody {
    Free,
    Receive,
    Queue(usize),
    Processing(usize),
}

/// A datagram buffer.
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    len: usize,
    pub vrf: VrfId,
    pub src: Option<SocketAddrV4>,
    pub custody: Custody,
}

impl Buffer {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            len: 0,
            vrf: VrfId(0),
            src: None,
            custody: Custody::Free,
        }
    }

    /// Whole buffer, for receiving into.
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Marks the first `len` bytes as a datagram from `src` on `vrf`.
    pub fn fill(&mut self, len: usize, vrf: VrfId, src: SocketAddrV4) {
        self.len = len.min(self.data.len());
        self.vrf = vrf;
        self.src = Some(src);
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    fn reset(&mut self) {
        self.len = 0;
        self.src = None;
        self.custody = Custody::Free;
    }
}

/// The shared free list.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Buffer>>,
    total: usize,
    in_use: AtomicUsize,
}

impl BufferPool {
    pub fn new(count: usize, size: usize) -> Self {
        Self {
            free: Mutex::new((0..count).map(|_| Buffer::new(size)).collect()),
            total: count,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Takes a free buffer for `custody`, or `None` if the pool is empty.
    pub fn acquire(&self, custody: Custody) -> Option<Buffer> {
        let mut buffer = self.free.lock().pop()?;
        self.in_use.fetch_add(1, Ordering::Relaxed);
        buffer.custody = custody;
        Some(buffer)
    }

    /// Returns a buffer to the free list.
    pub fn release(&self, mut buffer: Buffer) {
        if buffer.custody == Custody::Free {
            error!("Buffer released twice");
            return;
        }
        buffer.reset();
        self.free.lock().push(buffer);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}
