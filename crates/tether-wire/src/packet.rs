//! Transport packet framing.
//!
//! Wire layout, little-endian:
//!   0x00  4  service_id      (hash of service name; 0 reserved)
//!   0x04  4  task_id
//!   0x08  2  command
//!   0x0A  1  is_continuation (0 or 1)
//!   0x0B  1  version
//!   0x0C  4  body_len        (<= 0x3E000)
//!   0x10 16  reserved        (zero on send, ignored on recv)
//!   0x20  4  body_checksum   (CRC32 of body; 0 iff body_len == 0)
//!   0x24  4  header_checksum (CRC32 of preceding 0x24 bytes)

use strum::FromRepr;
use thiserror::Error;

pub const HEADER_SIZE: usize = 0x28;
pub const MAX_BODY_SIZE: usize = 0x3E000;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("header checksum mismatch")]
    HeaderChecksum,
    #[error("body checksum mismatch")]
    BodyChecksum,
    #[error("unknown command {0:#06x}")]
    UnknownCommand(u16),
    #[error("body length {0:#x} exceeds maximum")]
    BodyTooLarge(u32),
    #[error("control body malformed")]
    MalformedControl,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum Command {
    Syn = 1,
    SynAck = 2,
    Ack = 3,
    Data = 4,
    WindowUpdate = 5,
    Fin = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub service_id: u32,
    pub task_id: u32,
    pub command: Command,
    pub is_continuation: bool,
    pub version: u8,
    pub body_len: u32,
}

impl PacketHeader {
    /// Serialises the header for the given body, computing both checksums.
    pub fn encode(&self, body: &[u8]) -> [u8; HEADER_SIZE] {
        debug_assert_eq!(self.body_len as usize, body.len());
        debug_assert!(body.len() <= MAX_BODY_SIZE);

        let mut out = [0u8; HEADER_SIZE];
        out[0x00..0x04].copy_from_slice(&self.service_id.to_le_bytes());
        out[0x04..0x08].copy_from_slice(&self.task_id.to_le_bytes());
        out[0x08..0x0A].copy_from_slice(&(self.command as u16).to_le_bytes());
        out[0x0A] = self.is_continuation as u8;
        out[0x0B] = self.version;
        out[0x0C..0x10].copy_from_slice(&self.body_len.to_le_bytes());
        // 0x10..0x20 reserved, already zero

        let body_checksum = if body.is_empty() { 0 } else { crc32fast::hash(body) };
        out[0x20..0x24].copy_from_slice(&body_checksum.to_le_bytes());

        let header_checksum = crc32fast::hash(&out[..0x24]);
        out[0x24..0x28].copy_from_slice(&header_checksum.to_le_bytes());
        out
    }

    /// Parses and validates a header. The body checksum is kept for
    /// [`PacketHeader::validate_body`] once the body has been read.
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<(Self, u32), WireError> {
        let header_checksum = u32::from_le_bytes(bytes[0x24..0x28].try_into().unwrap());
        if crc32fast::hash(&bytes[..0x24]) != header_checksum {
            return Err(WireError::HeaderChecksum);
        }

        let raw_command = u16::from_le_bytes(bytes[0x08..0x0A].try_into().unwrap());
        let command = Command::from_repr(raw_command).ok_or(WireError::UnknownCommand(raw_command))?;

        let body_len = u32::from_le_bytes(bytes[0x0C..0x10].try_into().unwrap());
        if body_len as usize > MAX_BODY_SIZE {
            return Err(WireError::BodyTooLarge(body_len));
        }

        let header = Self {
            service_id: u32::from_le_bytes(bytes[0x00..0x04].try_into().unwrap()),
            task_id: u32::from_le_bytes(bytes[0x04..0x08].try_into().unwrap()),
            command,
            is_continuation: bytes[0x0A] != 0,
            version: bytes[0x0B],
            body_len,
        };
        let body_checksum = u32::from_le_bytes(bytes[0x20..0x24].try_into().unwrap());
        Ok((header, body_checksum))
    }

    pub fn validate_body(body_checksum: u32, body: &[u8]) -> Result<(), WireError> {
        let expected = if body.is_empty() { 0 } else { crc32fast::hash(body) };
        if body_checksum == expected { Ok(()) } else { Err(WireError::BodyChecksum) }
    }
}

/// Splits `body` into packets no larger than `max_body` bytes each, setting
/// `is_continuation` on every fragment but the last. An empty body yields a
/// single packet.
pub fn fragment(
    template: PacketHeader,
    body: &[u8],
    max_body: usize,
) -> impl Iterator<Item = (PacketHeader, &[u8])> {
    debug_assert!(max_body > 0 && max_body <= MAX_BODY_SIZE);
    let count = body.len().div_ceil(max_body).max(1);
    (0..count).map(move |i| {
        let chunk = &body[i * max_body..body.len().min((i + 1) * max_body)];
        let header = PacketHeader {
            body_len: chunk.len() as u32,
            is_continuation: i + 1 < count,
            ..template
        };
        (header, chunk)
    })
}

/// Body of a `Command::WindowUpdate` control packet, sent on channel 0 of a
/// module to restore send-window credit for one of its channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowUpdate {
    pub channel: u16,
    pub delta: u32,
}

impl WindowUpdate {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.channel.to_le_bytes());
        out[4..8].copy_from_slice(&self.delta.to_le_bytes());
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let body: &[u8; Self::SIZE] = body.try_into().map_err(|_| WireError::MalformedControl)?;
        Ok(Self {
            channel: u16::from_le_bytes(body[0..2].try_into().unwrap()),
            delta: u32::from_le_bytes(body[4..8].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn header(body: &[u8]) -> PacketHeader {
        PacketHeader {
            service_id: 0xDEAD_0001,
            task_id: 7,
            command: Command::Data,
            is_continuation: false,
            version: 1,
            body_len: body.len() as u32,
        }
    }

    #[test]
    fn checksum_roundtrip() {
        let body = b"hello target";
        let hdr = header(body);
        let bytes = hdr.encode(body);

        let (decoded, body_checksum) = PacketHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, hdr);
        PacketHeader::validate_body(body_checksum, body).unwrap();
    }

    #[test]
    fn empty_body_has_zero_checksum() {
        let hdr = header(&[]);
        let bytes = hdr.encode(&[]);
        assert_eq!(&bytes[0x20..0x24], &[0, 0, 0, 0]);
        let (_, body_checksum) = PacketHeader::decode(&bytes).unwrap();
        PacketHeader::validate_body(body_checksum, &[]).unwrap();
    }

    #[test]
    fn flipped_bit_is_detected() {
        let body = b"x";
        let mut bytes = header(body).encode(body);
        bytes[0x04] ^= 0x01;
        assert_eq!(PacketHeader::decode(&bytes), Err(WireError::HeaderChecksum));
    }

    #[test]
    fn corrupt_body_is_detected() {
        let body = b"payload";
        let bytes = header(body).encode(body);
        let (_, body_checksum) = PacketHeader::decode(&bytes).unwrap();
        assert_eq!(
            PacketHeader::validate_body(body_checksum, b"paYload"),
            Err(WireError::BodyChecksum)
        );
    }

    #[test]
    fn reserved_bytes_are_ignored() {
        // A peer may put data in the reserved region; it participates in the
        // checksum but must not affect decoding.
        let body = b"ok";
        let hdr = header(body);
        let mut bytes = hdr.encode(body);
        bytes[0x10] = 0xAB;
        bytes[0x1F] = 0xCD;
        let checksum = crc32fast::hash(&bytes[..0x24]);
        bytes[0x24..0x28].copy_from_slice(&checksum.to_le_bytes());

        let (decoded, _) = PacketHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn oversize_body_len_rejected() {
        let body = b"z";
        let mut bytes = header(body).encode(body);
        bytes[0x0C..0x10].copy_from_slice(&(MAX_BODY_SIZE as u32 + 1).to_le_bytes());
        let checksum = crc32fast::hash(&bytes[..0x24]);
        bytes[0x24..0x28].copy_from_slice(&checksum.to_le_bytes());
        assert!(matches!(PacketHeader::decode(&bytes), Err(WireError::BodyTooLarge(_))));
    }

    #[test]
    fn fragmentation_counts() {
        let body: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let max = 4096;
        let packets: Vec<_> = fragment(header(&body), &body, max).collect();

        assert_eq!(packets.len(), body.len().div_ceil(max));
        for (i, (hdr, chunk)) in packets.iter().enumerate() {
            assert_eq!(hdr.is_continuation, i + 1 < packets.len());
            assert_eq!(hdr.body_len as usize, chunk.len());
        }
        let reassembled: Vec<u8> = packets.iter().flat_map(|(_, c)| c.iter().copied()).collect();
        assert_eq!(reassembled, body);
    }

    #[test]
    fn fragment_empty_body() {
        let packets: Vec<_> = fragment(header(&[]), &[], 4096).collect();
        assert_eq!(packets.len(), 1);
        assert!(!packets[0].0.is_continuation);
        assert_eq!(packets[0].0.body_len, 0);
    }

    #[test]
    fn window_update_roundtrip() {
        let wu = WindowUpdate { channel: 3, delta: 0x1C000 };
        assert_eq!(WindowUpdate::decode(&wu.encode()).unwrap(), wu);
        assert_eq!(WindowUpdate::decode(&[0; 4]), Err(WireError::MalformedControl));
    }
}
