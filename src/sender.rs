use std::cmp::min;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use anyhow::bail;
use bytes::BufMut;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace};

use crate::chunk_header::{ChunkHeader, TransmissionType};
use crate::config::SenderConfig;
use crate::datagram_socket::DatagramSocket;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::sending_frame::SlotRing;

/// Sending endpoint: fragments frames into chunks, fires them at the fixed
///  peer, and answers the peer's retransmission requests from a bounded ring
///  of buffered frames.
///
/// `send` can be called concurrently with the NAK service loop; the two only
///  meet at the slot ring.
pub struct Sender {
    config: SenderConfig,
    socket: Arc<UdpSocket>,
    egress: Arc<dyn DatagramSocket>,
    peer_addr: SocketAddr,
    ring: SlotRing,
    next_id: AtomicU32,
    running: AtomicBool,
    shutdown: Notify,
}

impl Sender {
    /// Parse the peer address and bind an ephemeral local socket. With a
    ///  non-zero `max_data_size` every slot's chunk buffers are allocated
    ///  here, and the send path stays allocation-free.
    pub async fn new(config: SenderConfig) -> anyhow::Result<Sender> {
        config.validate()?;

        let peer_ip = config.peer_ip.parse::<IpAddr>()?;
        let peer_addr = SocketAddr::new(peer_ip, config.peer_port);

        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
        info!("bound send socket to {:?}, peer is {:?}", socket.local_addr(), peer_addr);

        let ring = SlotRing::new(
            config.buffer_size,
            if config.max_data_size > 0 { config.preallocated_chunks() } else { 0 },
            config.chunk_buf_size(),
        );

        Ok(Sender {
            config,
            egress: Arc::new(socket.clone()),
            socket,
            peer_addr,
            ring,
            next_id: AtomicU32::new(0),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Fragment `data` into chunks and send them, returning the assigned
    ///  frame id. Waits while all slots hold frames with outstanding I/O.
    ///
    /// Empty frames are rejected - there is no chunk to carry them.
    pub async fn send(&self, data: &[u8]) -> anyhow::Result<u32> {
        if data.is_empty() {
            bail!("empty frames are not supported");
        }

        let payload_size = self.config.payload_size();
        let total_chunks = data.len().div_ceil(payload_size);
        if total_chunks > u16::MAX.safe_cast() {
            bail!(
                "frame of {} bytes needs {} chunks, more than the protocol's limit of {}",
                data.len(),
                total_chunks,
                u16::MAX
            );
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut header = ChunkHeader {
            id,
            total_size: data.len().prechecked_cast(),
            total_chunks: total_chunks.prechecked_cast(),
            chunk_index: 0,
            chunk_size: 0,
            transmission_type: TransmissionType::Init,
        };

        let slot = self.ring.claim(id, header.total_chunks as u32).await;
        let mut state = slot.state.lock().await;
        state.ensure_chunks(total_chunks, self.config.chunk_buf_size());

        debug!("sending frame #{}: {} bytes in {} chunks", id, data.len(), total_chunks);

        for chunk_index in 0..total_chunks {
            let offset = chunk_index * payload_size;
            let chunk_payload = &data[offset..min(offset + payload_size, data.len())];

            header.chunk_index = chunk_index.prechecked_cast();
            header.chunk_size = chunk_payload.len().prechecked_cast();
            state.chunk_headers.push(header);

            let packet = &mut state.chunks[chunk_index];
            packet.clear();
            header.ser(packet);
            packet.put_slice(chunk_payload);

            self.egress.send_datagram(self.peer_addr, packet.as_ref()).await;
            self.ring.release_ref(&slot);
        }

        Ok(id)
    }

    /// Run the NAK service loop on the calling task: receive retransmission
    ///  requests from the peer and answer them from the slot ring. Returns on
    ///  [`Sender::stop`].
    pub async fn start(&self) {
        info!("starting NAK service loop");
        self.running.store(true, Ordering::Release);

        let mut recv_buf = vec![0u8; self.config.mtu];
        loop {
            // register for shutdown before re-checking the flag, so a stop
            //  between the check and the select cannot be missed
            let shutdown = self.shutdown.notified();
            tokio::pin!(shutdown);
            shutdown.as_mut().enable();
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            let (num_read, from) = select! {
                recv_result = self.socket.recv_from(&mut recv_buf) => {
                    match recv_result {
                        Ok(x) => x,
                        Err(e) => {
                            error!("socket error: {}", e);
                            continue;
                        }
                    }
                }
                _ = &mut shutdown => break,
            };

            // a resend request is exactly one header - anything else is not
            //  addressed to this side of the protocol
            if num_read != ChunkHeader::SERIALIZED_LEN {
                debug!("unexpected {} byte datagram from {:?} - ignoring", num_read, from);
                continue;
            }

            let mut parse_buf = &recv_buf[..num_read];
            match ChunkHeader::deser(&mut parse_buf) {
                Ok(header) => self.handle_packet(header).await,
                Err(_) => debug!("unparseable resend request from {:?} - ignoring", from),
            }
        }
    }

    /// Cancel the NAK service loop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown.notify_waiters();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.egress.local_addr()
    }

    async fn handle_packet(&self, request: ChunkHeader) {
        let Some(slot) = self.ring.find(request.id) else {
            debug!("resend request for frame #{} which is no longer buffered - ignoring", request.id);
            return;
        };

        {
            let mut state = slot.state.lock().await;
            let state = &mut *state;
            let chunk_index: usize = request.chunk_index.safe_cast();

            match state.chunk_headers.get(chunk_index) {
                // the request's size fields are not trustworthy; everything
                //  is rehydrated from the header recorded at first send
                Some(&stored) if stored.id == request.id => {
                    let resend_header = ChunkHeader {
                        transmission_type: TransmissionType::Resend,
                        ..stored
                    };

                    let packet = &mut state.chunks[chunk_index];
                    let mut prefix = &mut packet.as_mut()[..ChunkHeader::SERIALIZED_LEN];
                    resend_header.ser(&mut prefix);

                    trace!("resending chunk {} of frame #{}", chunk_index, request.id);
                    self.egress.send_datagram(self.peer_addr, packet.as_ref()).await;
                }
                _ => {
                    debug!("resend request for chunk {} of frame #{} with no buffered packet - ignoring",
                        chunk_index, request.id);
                }
            }
        }

        self.ring.release_ref(&slot);
    }
}
