use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

/// Whether a chunk is part of the original transmission of its frame or a
/// retransmission in response to a NAK.
///
/// NAK datagrams themselves carry [`TransmissionType::Init`] - they are
/// distinguished from chunks by their length (header only, no payload).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmissionType {
    Init,
    Resend,
}

impl TransmissionType {
    fn as_u16(&self) -> u16 {
        match self {
            TransmissionType::Init => 0,
            TransmissionType::Resend => 1,
        }
    }

    fn try_from_u16(raw: u16) -> anyhow::Result<TransmissionType> {
        match raw {
            0 => Ok(TransmissionType::Init),
            1 => Ok(TransmissionType::Resend),
            _ => bail!("invalid transmission type {}", raw),
        }
    }
}

/// The header starting every datagram on the wire, fixed layout, all numbers
/// in network byte order (BE):
///
/// ```ascii
///  0: frame id (u32) - assigned monotonically by the sender
///  4: total size (u32) - payload bytes across all chunks of the frame
///  8: total chunks (u16) - number of chunks the frame is split into
/// 10: chunk index (u16) - 0-based position of this chunk within the frame
/// 12: chunk size (u32) - payload bytes in this chunk
/// 16: transmission type (u16) - 0 INIT, 1 RESEND
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub id: u32,
    pub total_size: u32,
    pub total_chunks: u16,
    pub chunk_index: u16,
    pub chunk_size: u32,
    pub transmission_type: TransmissionType,
}

impl ChunkHeader {
    pub const SERIALIZED_LEN: usize = 3 * size_of::<u32>() + 3 * size_of::<u16>();

    /// Header for a retransmission request. Only id, chunk index and chunk
    /// count are meaningful in a NAK; the sizes are filled from the sender's
    /// stored headers when the chunk is re-sent.
    pub fn nak(id: u32, chunk_index: u16, total_chunks: u16) -> ChunkHeader {
        ChunkHeader {
            id,
            total_size: 0,
            total_chunks,
            chunk_index,
            chunk_size: 0,
            transmission_type: TransmissionType::Init,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.id);
        buf.put_u32(self.total_size);
        buf.put_u16(self.total_chunks);
        buf.put_u16(self.chunk_index);
        buf.put_u32(self.chunk_size);
        buf.put_u16(self.transmission_type.as_u16());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ChunkHeader> {
        let id = buf.try_get_u32()?;
        let total_size = buf.try_get_u32()?;
        let total_chunks = buf.try_get_u16()?;
        let chunk_index = buf.try_get_u16()?;
        let chunk_size = buf.try_get_u32()?;
        let transmission_type = TransmissionType::try_from_u16(buf.try_get_u16()?)?;

        Ok(ChunkHeader {
            id,
            total_size,
            total_chunks,
            chunk_index,
            chunk_size,
            transmission_type,
        })
    }
}
