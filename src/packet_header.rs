use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

bitflags! {
    /// First byte of every datagram. Bits outside the defined set are
    ///  reserved: zero on send, ignored on receive unless strict checking is
    ///  configured.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u8 {
        /// Sender expects an acknowledgment and retransmits on timeout.
        const RELIABLE = 0x01;
        /// Payload uses zero-run compression.
        const ZERO_CODED = 0x02;
    }
}

/// Wire layout, before the template-directed payload:
///
/// ```ascii
/// 0: flags (u8)
/// 1: sequence (u32 LE), assigned by the sending circuit
/// 5: opcode, variable width:
///      opcode < 0xFF     -> 1 byte
///      opcode < 0x10000  -> 0xFF, then u16 BE
///      otherwise         -> 0xFF, 0xFF, then u32 LE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub sequence: u32,
    pub opcode: u32,
}

impl PacketHeader {
    /// Byte range of the sequence field, for patching after the circuit
    ///  assigns the actual number.
    pub const SEQUENCE_RANGE: std::ops::Range<usize> = 1..5;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.flags.bits());
        buf.put_u32_le(self.sequence);

        if self.opcode < 0xFF {
            buf.put_u8(self.opcode as u8);
        } else if self.opcode < 0x1_0000 {
            buf.put_u8(0xFF);
            buf.put_u16(self.opcode as u16);
        } else {
            buf.put_u8(0xFF);
            buf.put_u8(0xFF);
            buf.put_u32_le(self.opcode);
        }
    }

    pub fn deser(buf: &mut impl Buf, strict: bool) -> Result<PacketHeader, ProtocolError> {
        let raw_flags = buf
            .try_get_u8()
            .map_err(|_| ProtocolError::MalformedHeader("truncated flags"))?;
        let flags = match PacketFlags::from_bits(raw_flags) {
            Some(flags) => flags,
            None if strict => {
                return Err(ProtocolError::MalformedHeader("reserved flag bits set"))
            }
            None => PacketFlags::from_bits_truncate(raw_flags),
        };

        let sequence = buf
            .try_get_u32_le()
            .map_err(|_| ProtocolError::MalformedHeader("truncated sequence"))?;

        let first = buf
            .try_get_u8()
            .map_err(|_| ProtocolError::MalformedHeader("truncated opcode"))?;
        let opcode = if first != 0xFF {
            first as u32
        } else {
            let second = buf
                .try_get_u8()
                .map_err(|_| ProtocolError::MalformedHeader("truncated opcode"))?;
            if second != 0xFF {
                let low = buf
                    .try_get_u8()
                    .map_err(|_| ProtocolError::MalformedHeader("truncated opcode"))?;
                ((second as u32) << 8) | low as u32
            } else {
                buf.try_get_u32_le()
                    .map_err(|_| ProtocolError::MalformedHeader("truncated opcode"))?
            }
        };

        Ok(PacketHeader {
            flags,
            sequence,
            opcode,
        })
    }
}

/// Every datagram ends with the acknowledgment trailer: the sequence numbers
///  being acked (u32 LE each), then a single count byte. A datagram that acks
///  nothing ends with a lone `0x00`. The trailer is appended after
///  zero-encoding and stripped before zero-decoding, so it is never
///  compressed.
pub fn append_ack_trailer(buf: &mut BytesMut, acks: &[u32]) {
    debug_assert!(acks.len() <= 255);
    for &seq in acks {
        buf.put_u32_le(seq);
    }
    buf.put_u8(acks.len() as u8);
}

/// Splits a raw datagram into its body (header + payload) and the acked
///  sequence numbers carried in the trailer.
pub fn split_ack_trailer(datagram: &[u8]) -> Result<(&[u8], Vec<u32>), ProtocolError> {
    let (&count, rest) = datagram
        .split_last()
        .ok_or(ProtocolError::MalformedHeader("empty datagram"))?;

    let trailer_len = count as usize * 4;
    if rest.len() < trailer_len {
        return Err(ProtocolError::MalformedHeader("truncated ack trailer"));
    }

    let (body, trailer) = rest.split_at(rest.len() - trailer_len);
    let acks = trailer
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    Ok((body, acks))
}
