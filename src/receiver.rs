use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::Notify;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::buffers::fixed_buffer::FixedBuf;
use crate::buffers::memory_pool::MemoryPool;
use crate::buffers::ordered_index::OrderedIndex;
use crate::chunk_header::{ChunkHeader, TransmissionType};
use crate::config::ReceiverConfig;
use crate::receiving_frame::{FrameEvents, ReceivingFrame};
use crate::safe_converter::SafeCast;

/// The sink for assembled frames. Delivery order is completion order, which
///  need not match the order of submission on the sender.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn on_frame(&self, frame: AssembledFrame);
}

/// A fully reassembled frame, handed to the sink.
///
/// The frame bytes stay in their pool block for zero-copy access; dropping
///  this guard releases the block and the reassembly bookkeeping. Holding on
///  to guards therefore keeps pool blocks occupied - with all of them held,
///  new frames are discarded on arrival.
pub struct AssembledFrame {
    id: u32,
    size: usize,
    data: Option<FixedBuf>,
    core: Arc<ReceiverCore>,
}

impl AssembledFrame {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Deref for AssembledFrame {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let data = self.data.as_ref()
            .expect("an undropped guard owns its data block");
        &data.as_ref()[..self.size]
    }
}

impl Drop for AssembledFrame {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.core.release_assembled(self.id, data);
        }
    }
}

/// Receiving endpoint: listens on a UDP socket, routes every inbound chunk to
///  the frame it belongs to, answers gaps with retransmission requests, and
///  hands completed frames to the sink.
///
/// All per-datagram buffers come from three preallocated pools (assembled
///  frames, raw datagrams, outgoing request headers), so the ingress path
///  never allocates.
pub struct Receiver {
    core: Arc<ReceiverCore>,
}

struct ReceiverCore {
    self_ref: Weak<ReceiverCore>,
    config: ReceiverConfig,
    socket: Arc<UdpSocket>,
    data_pool: MemoryPool,
    raw_pool: MemoryPool,
    resend_pool: MemoryPool,
    assembling_queue: Mutex<OrderedIndex<u32, Arc<ReceivingFrame>>>,
    dropped_queue: Mutex<VecDeque<(u32, FixedBuf)>>,
    sink: Option<Arc<dyn FrameSink>>,
    assembled_count: AtomicU64,
    dropped_count: AtomicU64,
    running: AtomicBool,
    shutdown: Notify,
}

impl Receiver {
    /// Bind the listen socket and size the pools. `sink: None` counts and
    ///  discards assembled frames.
    pub async fn new(config: ReceiverConfig, sink: Option<Arc<dyn FrameSink>>) -> anyhow::Result<Receiver> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.listen_port)).await?);
        info!("bound receive socket to {:?}", socket.local_addr()?);

        let data_pool = MemoryPool::new(config.max_data_size, config.buffer_size);
        let raw_pool = MemoryPool::new(config.raw_block_size(), config.raw_pool_blocks());
        let resend_pool = MemoryPool::new(ChunkHeader::SERIALIZED_LEN, config.buffer_size);

        let core = Arc::new_cyclic(|self_ref| ReceiverCore {
            self_ref: self_ref.clone(),
            config,
            socket,
            data_pool,
            raw_pool,
            resend_pool,
            assembling_queue: Mutex::new(OrderedIndex::new()),
            dropped_queue: Mutex::new(VecDeque::new()),
            sink,
            assembled_count: AtomicU64::new(0),
            dropped_count: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        Ok(Receiver { core })
    }

    /// Run the ingress loop on the calling task. Returns on [`Receiver::stop`],
    ///  or with an error if the raw datagram pool runs dry.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.core.clone().recv_loop().await
    }

    /// Cancel the ingress loop and reset both counters.
    pub fn stop(&self) {
        self.core.running.store(false, Ordering::Release);
        self.core.shutdown.notify_waiters();
        self.core.assembled_count.store(0, Ordering::Relaxed);
        self.core.dropped_count.store(0, Ordering::Relaxed);
    }

    /// Discard every frame currently under reassembly, returning their blocks
    ///  to the pools. No callbacks are invoked for discarded frames.
    pub fn flush(&self) {
        self.core.flush();
    }

    /// Frames assembled since the last `stop`.
    pub fn frame_count(&self) -> u64 {
        self.core.assembled_count.load(Ordering::Relaxed)
    }

    /// Frames dropped since the last `stop`.
    pub fn drop_count(&self) -> u64 {
        self.core.dropped_count.load(Ordering::Relaxed)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.socket.local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        // frames hold the core through their event interface; clearing the
        //  queue breaks that reference chain
        self.stop();
        self.core.flush();
    }
}

impl ReceiverCore {
    async fn recv_loop(self: Arc<Self>) -> anyhow::Result<()> {
        info!("starting receive loop");
        self.running.store(true, Ordering::Release);

        loop {
            let Some(mut buf) = self.raw_pool.acquire() else {
                error!("raw datagram pool exhausted - stopping the receive loop; this means more \
                    chunks are in flight than max_data_size and buffer_size provide for");
                bail!("raw datagram pool exhausted");
            };
            buf.maximize_len();

            // register for shutdown before re-checking the flag, so a stop
            //  between the check and the select cannot be missed
            let shutdown = self.shutdown.notified();
            tokio::pin!(shutdown);
            shutdown.as_mut().enable();
            if !self.running.load(Ordering::Acquire) {
                self.raw_pool.release(buf);
                break;
            }

            let (num_read, from) = select! {
                recv_result = self.socket.recv_from(buf.as_mut()) => {
                    match recv_result {
                        Ok(x) => x,
                        Err(e) => {
                            error!("socket error: {}", e);
                            self.raw_pool.release(buf);
                            continue;
                        }
                    }
                }
                _ = &mut shutdown => {
                    self.raw_pool.release(buf);
                    break;
                }
            };
            buf.truncate(num_read);

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "chunk_received", ?correlation_id);

            if num_read >= ChunkHeader::SERIALIZED_LEN {
                self.route_datagram(&buf, from).instrument(span).await;
            }
            else {
                debug!("datagram from {:?} shorter than a chunk header - dropping", from);
            }

            self.raw_pool.release(buf);
        }

        Ok(())
    }

    async fn route_datagram(&self, buf: &FixedBuf, from: SocketAddr) {
        let mut parse_buf = buf.as_ref();
        let header = match ChunkHeader::deser(&mut parse_buf) {
            Ok(header) => header,
            Err(_) => {
                debug!("received datagram with unparseable chunk header from {:?} - dropping", from);
                return;
            }
        };

        trace!("received chunk {}/{} of frame #{} from {:?}",
            header.chunk_index, header.total_chunks, header.id, from);

        if header.chunk_index >= header.total_chunks {
            debug!("chunk index {} out of range for frame #{} with {} chunks - dropping",
                header.chunk_index, header.id, header.total_chunks);
            return;
        }
        if header.chunk_size.safe_cast() > self.config.payload_size()
            || header.chunk_size.safe_cast() > parse_buf.len()
        {
            debug!("chunk {} of frame #{} declares more payload than was received - dropping",
                header.chunk_index, header.id);
            return;
        }

        let payload = &buf.as_ref()[ChunkHeader::SERIALIZED_LEN..];

        let frame = {
            let mut assembling_queue = self.assembling_queue.lock().unwrap();

            let known = assembling_queue.find(&header.id).cloned();
            match known {
                None if assembling_queue.is_empty()
                    || header.transmission_type == TransmissionType::Init =>
                {
                    self.evict_dropped(&mut assembling_queue);
                    self.new_frame(&mut assembling_queue, &header, from)
                }
                None => {
                    trace!("resend chunk for unknown frame #{} - dropping", header.id);
                    None
                }
                Some(frame) => {
                    if !frame.is_timed_out() && !frame.is_chunk_added(header.chunk_index) {
                        Some(frame)
                    }
                    else {
                        trace!("late or duplicate chunk {} for frame #{} - dropping",
                            header.chunk_index, header.id);
                        None
                    }
                }
            }
        };

        if let Some(frame) = frame {
            frame.add_chunk(header, payload).await;
        }
    }

    /// Dropped frames are not reclaimed from within timer callbacks; this is
    ///  the deferred eviction opportunity, taken whenever a fresh frame is
    ///  about to be created.
    fn evict_dropped(&self, assembling_queue: &mut OrderedIndex<u32, Arc<ReceivingFrame>>) {
        let mut dropped_queue = self.dropped_queue.lock().unwrap();
        while let Some((id, data)) = dropped_queue.pop_front() {
            trace!("evicting dropped frame #{}", id);
            assembling_queue.remove(&id);
            self.data_pool.release(data);
        }
    }

    fn new_frame(
        &self,
        assembling_queue: &mut OrderedIndex<u32, Arc<ReceivingFrame>>,
        header: &ChunkHeader,
        from: SocketAddr,
    ) -> Option<Arc<ReceivingFrame>> {
        if header.total_size.safe_cast() > self.config.max_data_size
            || header.total_chunks.safe_cast() > self.config.chunks_per_frame()
        {
            warn!("frame #{} announces {} bytes in {} chunks, exceeding the configured \
                max_data_size of {} - dropping",
                header.id, header.total_size, header.total_chunks, self.config.max_data_size);
            return None;
        }

        let Some(data) = self.data_pool.acquire() else {
            warn!("frame data pool exhausted - dropping datagram; consider a bigger buffer_size \
                or releasing delivered frames sooner");
            return None;
        };

        debug!("starting reassembly of frame #{} ({} chunks) from {:?}",
            header.id, header.total_chunks, from);

        let events = self.self_ref.upgrade()
            .expect("new_frame runs on a task holding the core");
        let frame = ReceivingFrame::new(
            header.id,
            from,
            header.total_chunks.safe_cast(),
            data,
            self.config.payload_size(),
            self.config.timeouts,
            events as Arc<dyn FrameEvents>,
        );
        assembling_queue.push_back(header.id, frame.clone());
        Some(frame)
    }

    fn release_assembled(&self, id: u32, data: FixedBuf) {
        self.assembling_queue.lock().unwrap().remove(&id);
        self.data_pool.release(data);
    }

    fn flush(&self) {
        let mut assembling_queue = self.assembling_queue.lock().unwrap();
        while let Some((id, frame)) = assembling_queue.pop_front() {
            trace!("flushing frame #{}", id);
            if let Some(data) = frame.abandon() {
                self.data_pool.release(data);
            }
        }

        let mut dropped_queue = self.dropped_queue.lock().unwrap();
        while let Some((_, data)) = dropped_queue.pop_front() {
            self.data_pool.release(data);
        }
    }
}

#[async_trait]
impl FrameEvents for ReceiverCore {
    async fn request_resend(&self, header: ChunkHeader, to: SocketAddr) {
        let Some(mut buf) = self.resend_pool.acquire() else {
            warn!("resend header pool exhausted - skipping resend request for frame #{}", header.id);
            return;
        };
        header.ser(&mut buf);

        trace!("requesting resend of chunk {} of frame #{} from {:?}", header.chunk_index, header.id, to);
        if let Err(e) = self.socket.send_to(buf.as_ref(), to).await {
            error!("error sending resend request to {:?}: {}", to, e);
        }

        self.resend_pool.release(buf);
    }

    async fn frame_assembled(&self, id: u32, data: FixedBuf, size: usize) {
        self.assembled_count.fetch_add(1, Ordering::Relaxed);

        let core = self.self_ref.upgrade()
            .expect("the receiver core outlives its frames");
        let frame = AssembledFrame { id, size, data: Some(data), core };

        match &self.sink {
            Some(sink) => sink.on_frame(frame).await,
            None => drop(frame), // releases the block right away
        }
    }

    async fn frame_dropped(&self, id: u32, data: FixedBuf) {
        self.dropped_count.fetch_add(1, Ordering::Relaxed);
        self.dropped_queue.lock().unwrap().push_back((id, data));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use bytes::BufMut;
    use crate::config::{FrameTimeouts, IP_UDP_OVERHEAD};
    use crate::receiving_frame::FrameStatus;
    use super::*;

    fn test_config() -> ReceiverConfig {
        // port 0 for an ephemeral port - tests must not collide
        ReceiverConfig::new(0, 16 * 1024)
    }

    /// An MTU leaving 8 payload bytes per chunk, so routing tests work with
    ///  hand-sized chunks instead of 1454 byte ones.
    fn small_chunk_config() -> ReceiverConfig {
        let mut config = ReceiverConfig::new(0, 32); // 4 chunks of 8 bytes
        config.mtu = IP_UDP_OVERHEAD + ChunkHeader::SERIALIZED_LEN + 8;
        config.buffer_size = 4;
        config
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn init_chunk(id: u32, total_size: u32, total_chunks: u16, chunk_index: u16, chunk_size: u32) -> ChunkHeader {
        ChunkHeader {
            id,
            total_size,
            total_chunks,
            chunk_index,
            chunk_size,
            transmission_type: TransmissionType::Init,
        }
    }

    fn datagram(header: ChunkHeader, payload: &[u8]) -> FixedBuf {
        let mut buf = FixedBuf::new(ChunkHeader::SERIALIZED_LEN + payload.len());
        header.ser(&mut buf);
        buf.put_slice(payload);
        buf
    }

    #[tokio::test]
    async fn test_new_validates_config() {
        let mut config = test_config();
        config.max_data_size = 0;
        assert!(Receiver::new(config, None).await.is_err());
    }

    #[tokio::test]
    async fn test_new_binds_socket() {
        let receiver = Receiver::new(test_config(), None).await.unwrap();
        assert_ne!(receiver.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_counters_start_at_zero() {
        let receiver = Receiver::new(test_config(), None).await.unwrap();
        assert_eq!(receiver.frame_count(), 0);
        assert_eq!(receiver.drop_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_on_empty_receiver_is_a_noop() {
        let receiver = Receiver::new(test_config(), None).await.unwrap();
        receiver.flush();
        assert_eq!(receiver.core.data_pool.free_blocks(), 10);
    }

    #[tokio::test]
    async fn test_pool_sizing() {
        let mut config = test_config();
        config.buffer_size = 3;
        config.max_data_size = 1454 * 4; // 4 chunks per frame at the default MTU

        let receiver = Receiver::new(config, None).await.unwrap();
        assert_eq!(receiver.core.data_pool.free_blocks(), 3);
        assert_eq!(receiver.core.data_pool.block_size(), 1454 * 4);
        assert_eq!(receiver.core.raw_pool.free_blocks(), 4 * 3);
        assert_eq!(receiver.core.raw_pool.block_size(), 1472);
        assert_eq!(receiver.core.resend_pool.free_blocks(), 3);
        assert_eq!(receiver.core.resend_pool.block_size(), ChunkHeader::SERIALIZED_LEN);
    }

    #[tokio::test]
    async fn test_route_assembles_and_delivers_to_sink() {
        let mut sink = MockFrameSink::new();
        sink.expect_on_frame()
            .withf(|frame| frame.id() == 0 && frame[..] == *b"aaaaaaaabbbb")
            .times(1)
            .returning(|frame| drop(frame));

        let receiver = Receiver::new(small_chunk_config(), Some(Arc::new(sink))).await.unwrap();

        for (chunk_index, payload) in [(0u16, &b"aaaaaaaa"[..]), (1u16, &b"bbbb"[..])] {
            let header = init_chunk(0, 12, 2, chunk_index, payload.len() as u32);
            receiver.core.route_datagram(&datagram(header, payload), peer()).await;
        }

        assert_eq!(receiver.frame_count(), 1);
        // the sink dropped its guard: entry erased, block back in the pool
        assert!(receiver.core.assembling_queue.lock().unwrap().is_empty());
        assert_eq!(receiver.core.data_pool.free_blocks(), 4);
    }

    #[tokio::test]
    async fn test_route_drops_resend_for_unknown_frame() {
        let mut sink = MockFrameSink::new();
        sink.expect_on_frame().times(0);

        let receiver = Receiver::new(small_chunk_config(), Some(Arc::new(sink))).await.unwrap();

        // an assembling frame keeps the queue non-empty
        let header = init_chunk(0, 16, 2, 0, 8);
        receiver.core.route_datagram(&datagram(header, b"aaaaaaaa"), peer()).await;

        let stray = ChunkHeader {
            transmission_type: TransmissionType::Resend,
            ..init_chunk(99, 16, 2, 0, 8)
        };
        receiver.core.route_datagram(&datagram(stray, b"xxxxxxxx"), peer()).await;

        let assembling_queue = receiver.core.assembling_queue.lock().unwrap();
        assert_eq!(assembling_queue.len(), 1);
        assert!(assembling_queue.find(&99).is_none());
    }

    #[tokio::test]
    async fn test_route_filters_duplicate_chunks() {
        let receiver = Receiver::new(small_chunk_config(), None).await.unwrap();

        let header = init_chunk(3, 16, 2, 0, 8);
        receiver.core.route_datagram(&datagram(header, b"aaaaaaaa"), peer()).await;
        receiver.core.route_datagram(&datagram(header, b"zzzzzzzz"), peer()).await;

        let frame = receiver.core.assembling_queue.lock().unwrap().find(&3).cloned().unwrap();
        assert!(frame.is_chunk_added(0));
        assert!(!frame.is_chunk_added(1));
        assert_eq!(frame.status(), FrameStatus::Assembling);
    }

    #[tokio::test]
    async fn test_route_drops_malformed_headers() {
        let receiver = Receiver::new(small_chunk_config(), None).await.unwrap();

        // chunk index beyond the chunk count
        let header = init_chunk(1, 16, 2, 2, 8);
        receiver.core.route_datagram(&datagram(header, b"aaaaaaaa"), peer()).await;

        // chunk bigger than the payload budget
        let header = init_chunk(1, 16, 2, 0, 9);
        receiver.core.route_datagram(&datagram(header, b"aaaaaaaaa"), peer()).await;

        assert!(receiver.core.assembling_queue.lock().unwrap().is_empty());
        assert_eq!(receiver.core.data_pool.free_blocks(), 4);
    }

    #[tokio::test]
    async fn test_route_rejects_frames_beyond_max_data_size() {
        let receiver = Receiver::new(small_chunk_config(), None).await.unwrap();

        let header = init_chunk(1, 33, 5, 0, 8); // 33 bytes > max_data_size of 32
        receiver.core.route_datagram(&datagram(header, b"aaaaaaaa"), peer()).await;

        assert!(receiver.core.assembling_queue.lock().unwrap().is_empty());
        assert_eq!(receiver.core.data_pool.free_blocks(), 4);
    }

    #[tokio::test]
    async fn test_incomplete_frame_requests_resend_from_the_chunk_source() {
        let mut config = small_chunk_config();
        config.timeouts = FrameTimeouts {
            init_chunk: Duration::from_millis(10),
            frame_drop: Duration::from_millis(500),
            resend: Duration::from_millis(10),
        };
        let receiver = Receiver::new(config, None).await.unwrap();

        let chunk_source = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let from = chunk_source.local_addr().unwrap();

        let header = init_chunk(5, 16, 2, 0, 8);
        receiver.core.route_datagram(&datagram(header, b"aaaaaaaa"), from).await;

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), chunk_source.recv_from(&mut buf))
            .await
            .expect("no resend request within 5s")
            .unwrap();
        assert_eq!(len, ChunkHeader::SERIALIZED_LEN);

        let nak = ChunkHeader::deser(&mut &buf[..len]).unwrap();
        assert_eq!(nak.id, 5);
        assert_eq!(nak.chunk_index, 1);
        assert_eq!(nak.total_chunks, 2);
    }
}
