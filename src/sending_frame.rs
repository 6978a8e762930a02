use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::trace;

use crate::buffers::fixed_buffer::FixedBuf;
use crate::chunk_header::ChunkHeader;

/// One position in the ring of in-flight frames.
///
/// A slot keeps the fully encoded chunk packets of the frame it was last
///  claimed for, so a retransmission request can be answered straight from
///  the buffered bytes. The ref count tracks outstanding I/O against those
///  bytes: it is set to the chunk count on claim, decremented per completed
///  send, and briefly incremented around each retransmission. The slot can
///  only be reclaimed for a new frame at zero.
pub struct SendSlot {
    ref_count: AtomicU32,
    pub state: tokio::sync::Mutex<SlotState>,
}

pub struct SlotState {
    /// Host-order headers as originally sent, one per chunk of the current
    ///  frame. Resend requests carry no trustworthy sizes; they are
    ///  rehydrated from here.
    pub chunk_headers: Vec<ChunkHeader>,

    /// Encoded packets (header plus payload), one per chunk. Grows to the
    ///  largest chunk count this slot has seen and is never shrunk.
    pub chunks: Vec<FixedBuf>,
}

impl SendSlot {
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }
}

impl SlotState {
    pub fn ensure_chunks(&mut self, total_chunks: usize, chunk_buf_size: usize) {
        while self.chunks.len() < total_chunks {
            self.chunks.push(FixedBuf::new(chunk_buf_size));
        }
    }
}

/// The bounded ring of [`SendSlot`]s, with a round-robin claim cursor and an
///  id index for O(1) retransmission lookup.
pub struct SlotRing {
    slots: Vec<Arc<SendSlot>>,
    inner: Mutex<RingInner>,
    slot_freed: Notify,
}

struct RingInner {
    next_slot: usize,
    /// frame id currently held by each slot; `None` until first claimed
    ids: Vec<Option<u32>>,
    /// auxiliary index over `ids`
    by_id: FxHashMap<u32, usize>,
}

impl SlotRing {
    pub fn new(buffer_size: usize, preallocated_chunks: usize, chunk_buf_size: usize) -> SlotRing {
        let slots = (0..buffer_size)
            .map(|_| {
                let chunks = (0..preallocated_chunks)
                    .map(|_| FixedBuf::new(chunk_buf_size))
                    .collect();
                Arc::new(SendSlot {
                    ref_count: AtomicU32::new(0),
                    state: tokio::sync::Mutex::new(SlotState {
                        chunk_headers: Vec::with_capacity(preallocated_chunks),
                        chunks,
                    }),
                })
            })
            .collect::<Vec<_>>();

        SlotRing {
            slots,
            inner: Mutex::new(RingInner {
                next_slot: 0,
                ids: vec![None; buffer_size],
                by_id: FxHashMap::default(),
            }),
            slot_freed: Notify::new(),
        }
    }

    /// Claim a free slot for a new frame, waiting while every slot is in
    ///  flight. This wait is the sender's back-pressure against the
    ///  application.
    pub async fn claim(&self, id: u32, total_chunks: u32) -> Arc<SendSlot> {
        loop {
            let notified = self.slot_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(slot) = self.try_claim(id, total_chunks) {
                return slot;
            }

            trace!("all {} send slots in flight - waiting for a free slot", self.slots.len());
            notified.await;
        }
    }

    fn try_claim(&self, id: u32, total_chunks: u32) -> Option<Arc<SendSlot>> {
        let mut inner = self.inner.lock().unwrap();

        for _ in 0..self.slots.len() {
            let index = inner.next_slot;
            inner.next_slot = (inner.next_slot + 1) % self.slots.len();

            let slot = &self.slots[index];
            if slot.ref_count.load(Ordering::Acquire) != 0 {
                continue;
            }

            // at ref count zero no I/O runs against the slot, and the id
            //  index is only touched under the ring lock we hold, so the
            //  state lock is uncontended
            let Ok(mut state) = slot.state.try_lock() else {
                continue;
            };
            state.chunk_headers.clear();

            if let Some(old_id) = inner.ids[index].replace(id) {
                inner.by_id.remove(&old_id);
            }
            inner.by_id.insert(id, index);
            slot.ref_count.store(total_chunks, Ordering::Release);

            trace!("claimed send slot {} for frame #{}", index, id);
            return Some(slot.clone());
        }

        None
    }

    /// Look up the slot buffering the given frame id, taking one additional
    ///  reference on it. The caller must pair this with `release_ref`.
    pub fn find(&self, id: u32) -> Option<Arc<SendSlot>> {
        let inner = self.inner.lock().unwrap();
        let &index = inner.by_id.get(&id)?;

        let slot = &self.slots[index];
        slot.ref_count.fetch_add(1, Ordering::AcqRel);
        Some(slot.clone())
    }

    /// Give back one reference, waking a claimer if the slot became free.
    pub fn release_ref(&self, slot: &SendSlot) {
        let prev = slot.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "send slot ref count underflow");

        if prev == 1 {
            self.slot_freed.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::time::timeout;
    use super::*;

    #[tokio::test]
    async fn test_claim_up_to_capacity() {
        let ring = SlotRing::new(3, 0, 64);

        let a = ring.claim(10, 1).await;
        let b = ring.claim(11, 1).await;
        let c = ring.claim(12, 1).await;

        assert_eq!(a.ref_count(), 1);
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&b, &c));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_claim_waits_while_all_slots_in_flight() {
        let ring = Arc::new(SlotRing::new(1, 0, 64));
        let busy = ring.claim(1, 2).await;

        // both references outstanding: a second claim must not succeed yet
        assert!(timeout(Duration::from_millis(50), ring.claim(2, 1)).await.is_err());

        ring.release_ref(&busy);
        assert!(timeout(Duration::from_millis(50), ring.claim(2, 1)).await.is_err());

        let ring2 = ring.clone();
        let waiter = tokio::spawn(async move { ring2.claim(2, 1).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ring.release_ref(&busy);

        let reclaimed = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&reclaimed, &busy));
    }

    #[tokio::test]
    async fn test_find_by_id() {
        let ring = SlotRing::new(2, 0, 64);
        let claimed = ring.claim(7, 3).await;

        let found = ring.find(7).expect("claimed id should be indexed");
        assert!(Arc::ptr_eq(&claimed, &found));
        assert_eq!(found.ref_count(), 4);

        ring.release_ref(&found);
        assert_eq!(found.ref_count(), 3);

        assert!(ring.find(99).is_none());
    }

    #[tokio::test]
    async fn test_reclaimed_slot_forgets_old_id() {
        let ring = SlotRing::new(1, 0, 64);

        let first = ring.claim(1, 1).await;
        ring.release_ref(&first);

        let _second = ring.claim(2, 1).await;

        assert!(ring.find(1).is_none());
        assert!(ring.find(2).is_some());
    }

    #[tokio::test]
    async fn test_claim_clears_stored_headers() {
        let ring = SlotRing::new(1, 0, 64);

        let slot = ring.claim(1, 1).await;
        slot.state.lock().await.chunk_headers.push(ChunkHeader::nak(1, 0, 1));
        ring.release_ref(&slot);

        let slot = ring.claim(2, 1).await;
        assert!(slot.state.lock().await.chunk_headers.is_empty());
    }

    #[tokio::test]
    async fn test_preallocated_chunk_buffers() {
        let ring = SlotRing::new(2, 4, 128);
        let slot = ring.claim(1, 4).await;

        let state = slot.state.lock().await;
        assert_eq!(state.chunks.len(), 4);
        assert!(state.chunks.iter().all(|c| c.capacity() == 128));
    }

    #[tokio::test]
    async fn test_ensure_chunks_grows_but_never_shrinks() {
        let ring = SlotRing::new(1, 2, 32);
        let slot = ring.claim(1, 5).await;

        let mut state = slot.state.lock().await;
        state.ensure_chunks(5, 32);
        assert_eq!(state.chunks.len(), 5);

        state.ensure_chunks(3, 32);
        assert_eq!(state.chunks.len(), 5);
    }
}
