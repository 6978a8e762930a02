use std::time::Duration;
use anyhow::bail;

use crate::chunk_header::ChunkHeader;

/// Bytes consumed by the IPv4 and UDP headers inside an Ethernet frame. The
/// usable chunk payload per datagram is derived by subtracting this and the
/// chunk header from the configured MTU.
pub const IP_UDP_OVERHEAD: usize = 20 + 8;

/// Configuration of a [`crate::sender::Sender`].
///
/// The MTU deserves a note: there is no reliable way to discover the true
/// path MTU, and choosing it too big causes datagrams to be dropped by the
/// network while choosing it too small wastes bandwidth. The responsibility
/// for picking a value that all routes support lies with the application;
/// 1500 is a safe default for full Ethernet frames without optional headers.
pub struct SenderConfig {
    pub peer_ip: String,
    pub peer_port: u16,

    /// Assumed maximum size of a UDP datagram on the wire, including IP and
    /// UDP headers.
    pub mtu: usize,

    /// Number of slots in the ring of in-flight frames. A frame's chunk
    /// buffers stay resident in their slot for retransmission until the slot
    /// is reused, and `send` waits while all slots are in flight, so this
    /// bounds both memory and sender-side back-pressure.
    pub buffer_size: usize,

    /// Largest expected frame payload in bytes. Used to preallocate each
    /// slot's chunk buffers; 0 skips preallocation and lets slots grow on
    /// first use.
    pub max_data_size: usize,
}

impl SenderConfig {
    pub fn new(peer_ip: impl Into<String>, peer_port: u16) -> SenderConfig {
        SenderConfig {
            peer_ip: peer_ip.into(),
            peer_port,
            mtu: 1500,
            buffer_size: 10,
            max_data_size: 0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu <= IP_UDP_OVERHEAD + ChunkHeader::SERIALIZED_LEN {
            bail!("MTU of {} leaves no room for chunk payload", self.mtu);
        }
        if self.buffer_size == 0 {
            bail!("buffer size must be at least 1");
        }
        if self.max_data_size > 0
            && self.max_data_size.div_ceil(self.payload_size()) > u16::MAX as usize
        {
            bail!(
                "max data size of {} requires more than {} chunks per frame",
                self.max_data_size,
                u16::MAX
            );
        }
        Ok(())
    }

    /// Chunk payload bytes per datagram: MTU minus IP, UDP and chunk headers.
    pub fn payload_size(&self) -> usize {
        self.mtu - IP_UDP_OVERHEAD - ChunkHeader::SERIALIZED_LEN
    }

    /// Capacity of one preallocated chunk buffer (header plus payload).
    pub fn chunk_buf_size(&self) -> usize {
        ChunkHeader::SERIALIZED_LEN + self.payload_size()
    }

    /// Chunks needed for a frame of `max_data_size` bytes, or 0 if no
    /// preallocation was requested.
    pub fn preallocated_chunks(&self) -> usize {
        self.max_data_size.div_ceil(self.payload_size())
    }
}

/// Timeouts driving a single frame's reassembly state machine.
#[derive(Clone, Copy, Debug)]
pub struct FrameTimeouts {
    /// Grace period after the last INIT chunk before opening the NAK loop -
    /// long enough to let a burst of chunks for one frame arrive.
    pub init_chunk: Duration,

    /// Cap on total reassembly latency: a frame still incomplete this long
    /// after the NAK loop opened is dropped.
    pub frame_drop: Duration,

    /// Pacing of NAK repetition, so a single lost NAK does not stall
    /// recovery.
    pub resend: Duration,
}

impl Default for FrameTimeouts {
    fn default() -> FrameTimeouts {
        FrameTimeouts {
            init_chunk: Duration::from_millis(20),
            frame_drop: Duration::from_millis(100),
            resend: Duration::from_millis(20),
        }
    }
}

/// Configuration of a [`crate::receiver::Receiver`].
pub struct ReceiverConfig {
    pub listen_port: u16,

    /// See [`SenderConfig::mtu`] - both endpoints must agree.
    pub mtu: usize,

    /// Number of frames that can be in reassembly concurrently. Sizes the
    /// assembled-frame pool and, together with `max_data_size`, the raw
    /// datagram pool.
    pub buffer_size: usize,

    /// Largest accepted frame payload in bytes. Sizes the assembled-frame
    /// blocks; frames announcing a bigger total size are discarded.
    pub max_data_size: usize,

    pub timeouts: FrameTimeouts,
}

impl ReceiverConfig {
    pub fn new(listen_port: u16, max_data_size: usize) -> ReceiverConfig {
        ReceiverConfig {
            listen_port,
            mtu: 1500,
            buffer_size: 10,
            max_data_size,
            timeouts: FrameTimeouts::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu <= IP_UDP_OVERHEAD + ChunkHeader::SERIALIZED_LEN {
            bail!("MTU of {} leaves no room for chunk payload", self.mtu);
        }
        if self.buffer_size == 0 {
            bail!("buffer size must be at least 1");
        }
        if self.max_data_size == 0 {
            bail!("max data size must be at least 1 to size the receive pools");
        }
        if self.chunks_per_frame() > u16::MAX as usize {
            bail!(
                "max data size of {} requires more than {} chunks per frame",
                self.max_data_size,
                u16::MAX
            );
        }
        Ok(())
    }

    /// Chunk payload bytes per datagram: MTU minus IP, UDP and chunk headers.
    pub fn payload_size(&self) -> usize {
        self.mtu - IP_UDP_OVERHEAD - ChunkHeader::SERIALIZED_LEN
    }

    /// Size of one raw datagram buffer: the full UDP payload.
    pub fn raw_block_size(&self) -> usize {
        self.mtu - IP_UDP_OVERHEAD
    }

    /// Worst-case chunk count of a single frame.
    pub fn chunks_per_frame(&self) -> usize {
        self.max_data_size.div_ceil(self.payload_size())
    }

    /// Raw datagram buffers needed to absorb `buffer_size` concurrent frames
    /// at their worst chunk count.
    pub fn raw_pool_blocks(&self) -> usize {
        self.chunks_per_frame() * self.buffer_size
    }
}
