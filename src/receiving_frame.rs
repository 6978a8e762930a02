use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::buffers::fixed_buffer::FixedBuf;
use crate::chunk_header::{ChunkHeader, TransmissionType};
use crate::config::FrameTimeouts;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// The capability interface through which a frame reaches back into its
///  receiver. The receiver implements this; frames hold it as a shared
///  reference, so the receiver owns the frame while the frame merely
///  observes the receiver.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameEvents: Send + Sync + 'static {
    /// Ask the peer at `to` to retransmit one chunk. The header carries id,
    ///  chunk index and chunk count; the size fields are not meaningful in a
    ///  request.
    async fn request_resend(&self, header: ChunkHeader, to: SocketAddr);

    /// All chunks are present; `data` holds `size` assembled bytes.
    async fn frame_assembled(&self, id: u32, data: FixedBuf, size: usize);

    /// The frame-drop timeout expired before assembly completed. `data` is
    ///  the (partially filled) frame buffer, handed back for reclamation.
    async fn frame_dropped(&self, id: u32, data: FixedBuf);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Assembling,
    Ready,
    Dropped,
}

/// Reassembly state of one inbound frame.
///
/// A frame starts out `Assembling` with an all-clear chunk bitmap. Chunks are
///  copied to their indexed offset in the frame buffer as they arrive. Every
///  INIT chunk re-arms a short grace timer; if that timer expires with chunks
///  still missing, the frame enters its NAK loop, requesting the missing
///  chunks from the sender at a fixed pace until either the bitmap fills
///  (`Ready`) or the frame-drop timeout caps the wait (`Dropped`). Both
///  terminal states are absorbing - the receiver filters further chunks.
///
/// Timers are spawned tasks; cancellation is `JoinHandle::abort`, and every
///  timer continuation re-checks the frame state after waking, so a
///  cancellation that loses the race against an already-scheduled wake-up
///  degrades to a no-op.
pub struct ReceivingFrame {
    self_ref: Weak<ReceivingFrame>,
    id: u32,
    sender_addr: SocketAddr,
    total_chunks: usize,
    payload_size: usize,
    timeouts: FrameTimeouts,
    events: Arc<dyn FrameEvents>,
    state: Mutex<FrameState>,
    needs_resend: AtomicBool,
    timed_out: AtomicBool,
}

struct FrameState {
    status: FrameStatus,
    chunk_bitmap: Vec<bool>,
    chunk_headers: Vec<Option<ChunkHeader>>,
    added_chunks: usize,
    data: Option<FixedBuf>,
    init_chunk_timer: Option<JoinHandle<()>>,
    frame_drop_timer: Option<JoinHandle<()>>,
    resend_loop: Option<JoinHandle<()>>,
}

enum AddChunkOutcome {
    Pending,
    Complete(FixedBuf, usize),
}

impl ReceivingFrame {
    pub fn new(
        id: u32,
        sender_addr: SocketAddr,
        total_chunks: usize,
        mut data: FixedBuf,
        payload_size: usize,
        timeouts: FrameTimeouts,
        events: Arc<dyn FrameEvents>,
    ) -> Arc<ReceivingFrame> {
        data.maximize_len();

        Arc::new_cyclic(|self_ref| ReceivingFrame {
            self_ref: self_ref.clone(),
            id,
            sender_addr,
            total_chunks,
            payload_size,
            timeouts,
            events,
            state: Mutex::new(FrameState {
                status: FrameStatus::Assembling,
                chunk_bitmap: vec![false; total_chunks],
                chunk_headers: vec![None; total_chunks],
                added_chunks: 0,
                data: Some(data),
                init_chunk_timer: None,
                frame_drop_timer: None,
                resend_loop: None,
            }),
            needs_resend: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn sender_addr(&self) -> SocketAddr {
        self.sender_addr
    }

    pub fn status(&self) -> FrameStatus {
        self.state.lock().unwrap().status
    }

    /// True once the frame-drop timeout fired - the receiver uses this to
    ///  filter late chunks without locking the bitmap.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub fn is_chunk_added(&self, chunk_index: u16) -> bool {
        let state = self.state.lock().unwrap();
        state.chunk_bitmap.get(chunk_index as usize).copied().unwrap_or(false)
    }

    /// Record one chunk: set its bitmap bit, remember its header, copy its
    ///  payload to the chunk's offset in the frame buffer. Completes the
    ///  frame if this was the last missing chunk; (re-)arms the init-chunk
    ///  timer for an INIT chunk that was not.
    ///
    /// Duplicate chunks are idempotent, chunks for a frame in a terminal
    ///  state are ignored.
    pub async fn add_chunk(&self, header: ChunkHeader, payload: &[u8]) {
        let outcome = {
            let mut state = self.state.lock().unwrap();

            if state.status != FrameStatus::Assembling {
                trace!("chunk {} for frame #{} in terminal state - ignoring", header.chunk_index, self.id);
                return;
            }

            let chunk_index = header.chunk_index as usize;
            let chunk_size = header.chunk_size as usize;
            let offset = chunk_index * self.payload_size;

            if chunk_index >= self.total_chunks
                || chunk_size > payload.len()
                || offset + chunk_size > state.data.as_ref().map(|d| d.len()).unwrap_or(0)
            {
                warn!("chunk {} of frame #{} does not fit its frame buffer - ignoring", header.chunk_index, self.id);
                return;
            }

            if !state.chunk_bitmap[chunk_index] {
                state.chunk_bitmap[chunk_index] = true;
                state.chunk_headers[chunk_index] = Some(header);
                state.added_chunks += 1;

                let data = state.data.as_mut()
                    .expect("an assembling frame owns its data block");
                data.as_mut()[offset..offset + chunk_size]
                    .copy_from_slice(&payload[..chunk_size]);
            }

            if state.added_chunks == self.total_chunks {
                state.status = FrameStatus::Ready;
                self.needs_resend.store(false, Ordering::Release);
                Self::abort_timers(&mut state);

                let data = state.data.take()
                    .expect("an assembling frame owns its data block");
                let total_size: usize = header.total_size.safe_cast();
                let size = total_size.min(data.len());
                AddChunkOutcome::Complete(data, size)
            }
            else {
                if header.transmission_type == TransmissionType::Init
                    && !self.needs_resend.load(Ordering::Acquire)
                {
                    if let Some(timer) = state.init_chunk_timer.take() {
                        timer.abort();
                    }
                    let frame = self.self_ref.upgrade()
                        .expect("frames are owned through an Arc");
                    state.init_chunk_timer = Some(tokio::spawn(async move {
                        sleep(frame.timeouts.init_chunk).await;
                        frame.on_init_chunk_timeout();
                    }));
                }
                AddChunkOutcome::Pending
            }
        };

        if let AddChunkOutcome::Complete(data, size) = outcome {
            debug!("frame #{} assembled ({} bytes in {} chunks)", self.id, size, self.total_chunks);
            self.events.frame_assembled(self.id, data, size).await;
        }
    }

    /// The init-chunk grace period elapsed without the frame completing:
    ///  start the frame-drop countdown and open the NAK loop.
    fn on_init_chunk_timeout(self: Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.status != FrameStatus::Assembling {
            return;
        }
        if self.needs_resend.swap(true, Ordering::AcqRel) {
            // lost the race against a concurrent re-arm: the NAK loop is already open
            return;
        }

        debug!("frame #{}: {} of {} chunks after init timeout - requesting resends",
            self.id, state.added_chunks, self.total_chunks);

        let frame = self.clone();
        state.frame_drop_timer = Some(tokio::spawn(async move {
            sleep(frame.timeouts.frame_drop).await;
            frame.on_frame_drop_timeout().await;
        }));

        let frame = self.clone();
        state.resend_loop = Some(tokio::spawn(async move {
            frame.resend_loop().await;
        }));
    }

    /// Request every still-missing chunk, then sleep and repeat, until the
    ///  frame reaches a terminal state.
    async fn resend_loop(self: Arc<Self>) {
        loop {
            if !self.needs_resend.load(Ordering::Acquire) {
                return;
            }

            let missing = {
                let state = self.state.lock().unwrap();
                if state.status != FrameStatus::Assembling {
                    return;
                }
                state.chunk_bitmap.iter()
                    .enumerate()
                    .filter(|(_, added)| !**added)
                    .map(|(chunk_index, _)| ChunkHeader::nak(
                        self.id,
                        chunk_index.prechecked_cast(),
                        self.total_chunks.prechecked_cast(),
                    ))
                    .collect::<Vec<_>>()
            };

            trace!("frame #{}: requesting resend of {} chunks", self.id, missing.len());
            for header in missing {
                self.events.request_resend(header, self.sender_addr).await;
            }

            sleep(self.timeouts.resend).await;
        }
    }

    /// The frame-drop timeout capped the wait: give up on this frame.
    async fn on_frame_drop_timeout(self: Arc<Self>) {
        let data = {
            let mut state = self.state.lock().unwrap();
            if state.status != FrameStatus::Assembling {
                return;
            }
            state.status = FrameStatus::Dropped;
            self.needs_resend.store(false, Ordering::Release);
            self.timed_out.store(true, Ordering::Release);

            if let Some(timer) = state.init_chunk_timer.take() {
                timer.abort();
            }
            if let Some(resend_loop) = state.resend_loop.take() {
                resend_loop.abort();
            }

            state.data.take()
        };

        if let Some(data) = data {
            warn!("dropping frame #{} - incomplete after frame drop timeout", self.id);
            self.events.frame_dropped(self.id, data).await;
        }
    }

    /// Tear the frame down without invoking any callback: cancel all timers
    ///  and hand back the data block if the frame still owns one. Used when
    ///  the receiver flushes or stops.
    pub fn abandon(&self) -> Option<FixedBuf> {
        let mut state = self.state.lock().unwrap();
        state.status = FrameStatus::Dropped;
        self.needs_resend.store(false, Ordering::Release);
        Self::abort_timers(&mut state);
        state.data.take()
    }

    fn abort_timers(state: &mut FrameState) {
        if let Some(timer) = state.init_chunk_timer.take() {
            timer.abort();
        }
        if let Some(timer) = state.frame_drop_timer.take() {
            timer.abort();
        }
        if let Some(resend_loop) = state.resend_loop.take() {
            resend_loop.abort();
        }
    }
}
