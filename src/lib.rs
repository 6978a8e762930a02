//! Chunk-oriented reliable streaming of large frames over UDP.
//!
//! This crate moves opaque application payloads ("frames") of up to tens of
//!  megabytes from a sender to a receiver across plain UDP, recovering from
//!  per-datagram loss with receiver-driven NAK retransmission. It sits in the
//!  gap between raw datagrams and TCP: frames either arrive completely intact
//!  or are dropped as a whole after a bounded wait - there is no stream, no
//!  handshake and no cross-frame ordering.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *frames*, i.e. defined-length
//!   blobs of data as opposed to streams of bytes
//! * Frames larger than a datagram are chunked by this protocol rather than
//!   relying on IP-level fragmentation
//!   * configured MTU since discovery does not work reliably
//! * Minimise latency on reliable networks (e.g. inside a data center)
//!   * The default is to assume delivery unless a negative ack is sent
//!   * a short grace period lets a burst of chunks arrive before the first
//!     NAK opens
//! * Bounded memory on both sides, fixed at construction time
//!   * the sender buffers in-flight frames in a ring of preallocated slots,
//!     and blocks the application while all slots are busy
//!   * the receiver stages everything in fixed-size pools; when they run dry,
//!     fresh data is dropped rather than growing the heap
//! * Give up quickly: a frame that cannot be completed within the drop
//!   timeout is discarded and counted, and the protocol moves on to fresh
//!   data rather than maximising delivery reliability at the cost of latency
//! * Frames may complete out of submission order; delivery order is
//!   completion order
//!
//! Explicitly *not* goals: congestion control, pacing, forward error
//!  correction, encryption, authentication, or multiplexing several peers
//!  over one socket pair.
//!
//! ## Wire format
//!
//! Every datagram starts with the chunk header - all numbers in network byte
//!  order (BE):
//!
//! ```ascii
//!  0: frame id (u32): assigned monotonically by the sender
//!  4: total size (u32): payload bytes across all chunks of this frame
//!  8: total chunks (u16): number of chunks the frame is split into
//! 10: chunk index (u16): 0-based position of this chunk
//! 12: chunk size (u32): payload bytes in this chunk
//! 16: transmission type (u16): 0 INIT (original send), 1 RESEND
//! ```
//!
//! A datagram longer than the header carries the chunk's payload directly
//!  after it. A datagram of exactly header size is a *NAK*: the receiver
//!  sends it to request chunk `chunk index` of frame `frame id` again. Only
//!  id, chunk index and total chunks are meaningful in a NAK - the sender
//!  rehydrates the sizes from the headers it recorded at first transmission
//!  and answers with the buffered chunk, transmission type flipped to RESEND.
//!
//! The chunk payload per datagram is `MTU - 20 - 8 - 18` (IPv4 header, UDP
//!  header, chunk header); every chunk but the last carries exactly that
//!  much.
//!
//! ## Reassembly and loss recovery
//!
//! The receiver keeps per-frame state: a chunk-presence bitmap, the recorded
//!  headers, and a destination block in a preallocated pool that chunks are
//!  copied into at `chunk index * payload size`. Three timers drive recovery:
//!
//! * every INIT chunk of an incomplete frame (re-)arms a short *init chunk*
//!   grace timer; if it expires with gaps, the frame enters its NAK loop
//! * the *resend* timer paces that loop, re-requesting every missing chunk
//!   each round so a lost NAK delays recovery by one round at most
//! * the *frame drop* timer caps the total wait; on expiry the frame is
//!   discarded and counted
//!
//! ## Related:
//! * TCP: reliable and ordered, but a lost segment stalls everything behind
//!   it, and there is no frame boundary
//! * QUIC: connection based with an initial handshake, enforces encryption,
//!   stream-per-message - a much bigger machine than this protocol wants
//! * UDT: UDP based with negative acks, but stream oriented and with
//!   congestion control built in

pub mod buffers;
pub mod chunk_header;
pub mod config;
pub mod datagram_socket;
pub mod receiver;
pub mod receiving_frame;
pub mod safe_converter;
pub mod sender;
pub mod sending_frame;

pub use chunk_header::{ChunkHeader, TransmissionType};
pub use config::{FrameTimeouts, ReceiverConfig, SenderConfig};
pub use receiver::{AssembledFrame, FrameSink, Receiver};
pub use sender::Sender;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
