//! Recycled audio block pool
//!
//! A fixed set of [`AudioBlock`]s circulates between two bounded queues:
//!
//! ```text
//!            take_empty()                 publish()
//!  return ─────────────────▶ producer ─────────────────▶ carrier
//!  queue                   (network rx)                  queue
//!    ▲                                                     │
//!    │        recycle()                 next_filled()      │
//!    └──────────────────── consumer ◀──────────────────────┘
//!                          (playback)
//! ```
//!
//! Blocks are allocated once in [`AudioQueuePair::new`]; steady-state
//! operation only moves them. Moving a block through a channel moves its
//! ownership, so a block is never reachable from two places at once.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::INGEST_POLL_MS;
use crate::error::AudioError;

/// Fixed-capacity byte buffer with a valid-length field
#[derive(Debug)]
pub struct AudioBlock {
    data: Box<[u8]>,
    len: usize,
}

impl AudioBlock {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Valid bytes only
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Copy `payload` in, replacing previous contents.
    ///
    /// Oversized payloads are rejected and leave the block untouched.
    pub fn fill(&mut self, payload: &[u8]) -> Result<(), AudioError> {
        let capacity = self.capacity();
        let dst = self
            .data
            .get_mut(..payload.len())
            .ok_or(AudioError::BlockOverflow {
                len: payload.len(),
                capacity,
            })?;
        dst.copy_from_slice(payload);
        self.len = payload.len();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub frames_queued: u64,
    pub frames_rejected: u64,
    pub pool_exhausted: u64,
}

#[derive(Default)]
struct Counters {
    frames_queued: AtomicU64,
    frames_rejected: AtomicU64,
    pool_exhausted: AtomicU64,
}

/// Return queue (empty blocks) and carrier queue (filled blocks)
pub struct AudioQueuePair {
    block_capacity: usize,
    pool_size: usize,
    return_tx: Sender<AudioBlock>,
    return_rx: Receiver<AudioBlock>,
    carrier_tx: Sender<AudioBlock>,
    carrier_rx: Receiver<AudioBlock>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl AudioQueuePair {
    /// Allocate `pool_size` blocks of `block_capacity` bytes, all empty
    pub fn new(pool_size: usize, block_capacity: usize) -> Self {
        let (return_tx, return_rx) = bounded(pool_size);
        let (carrier_tx, carrier_rx) = bounded(pool_size);

        for _ in 0..pool_size {
            // Cannot fail: the queue was sized for exactly this many blocks
            let _ = return_tx.try_send(AudioBlock::with_capacity(block_capacity));
        }

        Self {
            block_capacity,
            pool_size,
            return_tx,
            return_rx,
            carrier_tx,
            carrier_rx,
            closed: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn block_capacity(&self) -> usize {
        self.block_capacity
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Writer side, used by the inbound frame handler
    pub fn producer(&self) -> BlockProducer {
        BlockProducer {
            return_rx: self.return_rx.clone(),
            carrier_tx: self.carrier_tx.clone(),
            closed: self.closed.clone(),
            counters: self.counters.clone(),
            block_capacity: self.block_capacity,
            poll: Duration::from_millis(INGEST_POLL_MS),
        }
    }

    /// Reader side, used by playback
    pub fn consumer(&self) -> BlockConsumer {
        BlockConsumer {
            carrier_rx: self.carrier_rx.clone(),
            return_tx: self.return_tx.clone(),
        }
    }

    /// Empty blocks currently available
    pub fn available(&self) -> usize {
        self.return_rx.len()
    }

    /// Filled blocks awaiting playback
    pub fn pending(&self) -> usize {
        self.carrier_rx.len()
    }

    /// Wake any writer blocked on an exhausted pool and refuse further frames
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            frames_queued: self.counters.frames_queued.load(Ordering::Relaxed),
            frames_rejected: self.counters.frames_rejected.load(Ordering::Relaxed),
            pool_exhausted: self.counters.pool_exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Takes empty blocks, fills them, and hands them to the carrier queue
#[derive(Clone)]
pub struct BlockProducer {
    return_rx: Receiver<AudioBlock>,
    carrier_tx: Sender<AudioBlock>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
    block_capacity: usize,
    poll: Duration,
}

impl BlockProducer {
    /// Use a different wake-up interval while the pool is exhausted
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Wait for an empty block.
    ///
    /// Blocks while the pool is exhausted, waking every poll interval to
    /// notice `close()`.
    pub fn take_empty(&self) -> Result<AudioBlock, AudioError> {
        let mut waited = false;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(AudioError::PoolClosed);
            }
            match self.return_rx.recv_timeout(self.poll) {
                Ok(block) => return Ok(block),
                Err(RecvTimeoutError::Timeout) => {
                    if !waited {
                        waited = true;
                        self.counters.pool_exhausted.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Audio pool exhausted, waiting for playback");
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(AudioError::Disconnected),
            }
        }
    }

    /// Queue a filled block for playback
    pub fn publish(&self, block: AudioBlock) -> Result<(), AudioError> {
        self.carrier_tx
            .send(block)
            .map_err(|_| AudioError::Disconnected)?;
        self.counters.frames_queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Copy one received frame into the pool.
    ///
    /// Oversized frames are rejected before a block is taken, so the pool
    /// never loses a block to a bad frame.
    pub fn write_frame(&self, payload: &[u8]) -> Result<(), AudioError> {
        if payload.len() > self.block_capacity {
            self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Dropping {} byte frame, block capacity is {}",
                payload.len(),
                self.block_capacity
            );
            return Err(AudioError::BlockOverflow {
                len: payload.len(),
                capacity: self.block_capacity,
            });
        }

        let mut block = self.take_empty()?;
        block.fill(payload)?;
        self.publish(block)
    }
}

/// Takes filled blocks for playback and recycles them
#[derive(Clone)]
pub struct BlockConsumer {
    carrier_rx: Receiver<AudioBlock>,
    return_tx: Sender<AudioBlock>,
}

impl BlockConsumer {
    /// Wait for the next filled block
    pub fn next_filled(&self) -> Result<AudioBlock, AudioError> {
        self.carrier_rx.recv().map_err(|_| AudioError::Disconnected)
    }

    /// Wait up to `timeout` for a filled block
    pub fn next_filled_timeout(&self, timeout: Duration) -> Option<AudioBlock> {
        self.carrier_rx.recv_timeout(timeout).ok()
    }

    /// Non-blocking variant of [`next_filled`](Self::next_filled)
    pub fn try_next_filled(&self) -> Option<AudioBlock> {
        match self.carrier_rx.try_recv() {
            Ok(block) => Some(block),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Hand a played block back to the pool
    pub fn recycle(&self, mut block: AudioBlock) -> Result<(), AudioError> {
        block.clear();
        self.return_tx
            .send(block)
            .map_err(|_| AudioError::Disconnected)
    }
}
