//! Request/reply prelude shared by the RPC services layered on the
//! transport.
//!
//! Wire layout, little-endian, 0x40 bytes:
//!   0x00  2  protocol  (= 1)
//!   0x02  2  version   (negotiated)
//!   0x04  2  category  (0 = Request, 1 = Response)
//!   0x06  2  type      (service-specific)
//!   0x08  8  body_size
//!   0x10 40  params[5]
//!   0x38  8  reserved

use strum::FromRepr;

pub const RPC_HEADER_SIZE: usize = 0x40;
pub const RPC_PROTOCOL: u16 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum PacketCategory {
    Request = 0,
    Response = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpcHeader {
    pub protocol: u16,
    pub version: u16,
    pub category: PacketCategory,
    pub packet_type: u16,
    pub body_size: u64,
    pub params: [u64; 5],
}

impl RpcHeader {
    pub fn request(version: u16, packet_type: u16, body_size: u64, params: [u64; 5]) -> Self {
        Self { protocol: RPC_PROTOCOL, version, category: PacketCategory::Request, packet_type, body_size, params }
    }

    pub fn response(version: u16, packet_type: u16, body_size: u64, params: [u64; 5]) -> Self {
        Self { protocol: RPC_PROTOCOL, version, category: PacketCategory::Response, packet_type, body_size, params }
    }

    pub fn encode(&self) -> [u8; RPC_HEADER_SIZE] {
        let mut out = [0u8; RPC_HEADER_SIZE];
        out[0x00..0x02].copy_from_slice(&self.protocol.to_le_bytes());
        out[0x02..0x04].copy_from_slice(&self.version.to_le_bytes());
        out[0x04..0x06].copy_from_slice(&(self.category as u16).to_le_bytes());
        out[0x06..0x08].copy_from_slice(&self.packet_type.to_le_bytes());
        out[0x08..0x10].copy_from_slice(&self.body_size.to_le_bytes());
        for (i, p) in self.params.iter().enumerate() {
            out[0x10 + i * 8..0x18 + i * 8].copy_from_slice(&p.to_le_bytes());
        }
        // 0x38..0x40 reserved, zero
        out
    }

    /// Parses a prelude. The category falls back to `Request` only if the
    /// raw value is 0; anything else unknown is surfaced as `None` so the
    /// caller can reject the response.
    pub fn decode(bytes: &[u8; RPC_HEADER_SIZE]) -> Option<Self> {
        let category =
            PacketCategory::from_repr(u16::from_le_bytes(bytes[0x04..0x06].try_into().unwrap()))?;
        let mut params = [0u64; 5];
        for (i, p) in params.iter_mut().enumerate() {
            *p = u64::from_le_bytes(bytes[0x10 + i * 8..0x18 + i * 8].try_into().unwrap());
        }
        Some(Self {
            protocol: u16::from_le_bytes(bytes[0x00..0x02].try_into().unwrap()),
            version: u16::from_le_bytes(bytes[0x02..0x04].try_into().unwrap()),
            category,
            packet_type: u16::from_le_bytes(bytes[0x06..0x08].try_into().unwrap()),
            body_size: u64::from_le_bytes(bytes[0x08..0x10].try_into().unwrap()),
            params,
        })
    }

    /// `params[i]` reinterpreted as a signed host result.
    pub fn param_i64(&self, i: usize) -> i64 {
        self.params[i] as i64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prelude_roundtrip() {
        let hdr = RpcHeader::request(1, 40, 0, [3, 0, 16, 0, 0]);
        let bytes = hdr.encode();
        assert_eq!(bytes.len(), RPC_HEADER_SIZE);
        assert_eq!(RpcHeader::decode(&bytes), Some(hdr));
    }

    #[test]
    fn negative_param_roundtrips() {
        let hdr = RpcHeader::response(1, 40, 0, [(-2i64) as u64, 0, 0, 0, 0]);
        let decoded = RpcHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded.param_i64(0), -2);
    }

    #[test]
    fn unknown_category_rejected() {
        let mut bytes = RpcHeader::request(1, 0, 0, [0; 5]).encode();
        bytes[0x04] = 9;
        assert_eq!(RpcHeader::decode(&bytes), None);
    }
}
