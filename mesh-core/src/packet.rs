//! Mesh packet envelope and the payload layouts the node understands.
//!
//! ```text
//! header (1) | transport codes (4, transport routes only) | path_len (1) | path | payload
//! ```

/// Largest packet on air.
pub const MAX_PACKET_SIZE: usize = 255;
/// Largest hop path.
pub const MAX_PATH_SIZE: usize = 64;
pub const PUB_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;
pub const PAYLOAD_VERSION_1: u8 = 0;

const ROUTE_MASK: u8 = 0x03;
const TYPE_SHIFT: u8 = 2;
const TYPE_MASK: u8 = 0x0F;
const VERSION_SHIFT: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RouteType {
    TransportFlood = 0,
    Flood = 1,
    Direct = 2,
    TransportDirect = 3,
}

impl RouteType {
    fn from_bits(bits: u8) -> Self {
        match bits & ROUTE_MASK {
            0 => Self::TransportFlood,
            1 => Self::Flood,
            2 => Self::Direct,
            _ => Self::TransportDirect,
        }
    }

    pub fn has_transport_codes(self) -> bool {
        matches!(self, Self::TransportFlood | Self::TransportDirect)
    }

    pub fn is_flood(self) -> bool {
        matches!(self, Self::TransportFlood | Self::Flood)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    Request = 0x00,
    Response = 0x01,
    TextMessage = 0x02,
    Ack = 0x03,
    Advert = 0x04,
    GroupText = 0x05,
    GroupData = 0x06,
    AnonRequest = 0x07,
    Path = 0x08,
    Trace = 0x09,
    Multipart = 0x0A,
    RawCustom = 0x0F,
}

impl TryFrom<u8> for PayloadType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::Request,
            0x01 => Self::Response,
            0x02 => Self::TextMessage,
            0x03 => Self::Ack,
            0x04 => Self::Advert,
            0x05 => Self::GroupText,
            0x06 => Self::GroupData,
            0x07 => Self::AnonRequest,
            0x08 => Self::Path,
            0x09 => Self::Trace,
            0x0A => Self::Multipart,
            0x0F => Self::RawCustom,
            other => return Err(PacketError::UnknownPayloadType(other)),
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet truncated")]
    Truncated,
    #[error("packet of {0} bytes exceeds MTU")]
    TooLarge(usize),
    #[error("path of {0} hops exceeds limit")]
    PathTooLong(usize),
    #[error("unknown payload type {0:#x}")]
    UnknownPayloadType(u8),
    #[error("text is not valid UTF-8")]
    InvalidText,
}

/// One mesh packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: u8,
    pub transport_codes: Option<[u16; 2]>,
    pub path: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(route: RouteType, payload_type: PayloadType, path: Vec<u8>, payload: Vec<u8>) -> Self {
        let header = (route as u8)
            | ((payload_type as u8 & TYPE_MASK) << TYPE_SHIFT)
            | (PAYLOAD_VERSION_1 << VERSION_SHIFT);
        let transport_codes = route.has_transport_codes().then_some([0, 0]);
        Self {
            header,
            transport_codes,
            path,
            payload,
        }
    }

    pub fn route_type(&self) -> RouteType {
        RouteType::from_bits(self.header)
    }

    pub fn payload_type(&self) -> Result<PayloadType, PacketError> {
        PayloadType::try_from((self.header >> TYPE_SHIFT) & TYPE_MASK)
    }

    pub fn version(&self) -> u8 {
        self.header >> VERSION_SHIFT
    }

    pub fn encoded_len(&self) -> usize {
        let codes = if self.transport_codes.is_some() { 4 } else { 0 };
        1 + codes + 1 + self.path.len() + self.payload.len()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PacketError> {
        if self.path.len() > MAX_PATH_SIZE {
            return Err(PacketError::PathTooLong(self.path.len()));
        }
        let len = self.encoded_len();
        if len > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(len));
        }
        let mut out = Vec::with_capacity(len);
        out.push(self.header);
        if let Some([a, b]) = self.transport_codes {
            out.extend_from_slice(&a.to_le_bytes());
            out.extend_from_slice(&b.to_le_bytes());
        }
        out.push(self.path.len() as u8);
        out.extend_from_slice(&self.path);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(bytes.len()));
        }
        let mut r = Reader::new(bytes);
        let header = r.u8()?;
        let transport_codes = if RouteType::from_bits(header).has_transport_codes() {
            Some([r.u16()?, r.u16()?])
        } else {
            None
        };
        let path_len = usize::from(r.u8()?);
        if path_len > MAX_PATH_SIZE {
            return Err(PacketError::PathTooLong(path_len));
        }
        let path = r.take(path_len)?.to_vec();
        let payload = r.rest().to_vec();
        Ok(Self {
            header,
            transport_codes,
            path,
            payload,
        })
    }
}

/// Structural check of a raw frame before it is put on air.
pub fn is_valid_packet_data(bytes: &[u8]) -> bool {
    Packet::from_bytes(bytes).is_ok()
}

/// Direct text message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub dest_hash: u8,
    pub src_hash: u8,
    pub timestamp: u32,
    pub attempt: u8,
    pub text: String,
}

impl TextMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(7 + self.text.len());
        out.push(self.dest_hash);
        out.push(self.src_hash);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.push(self.attempt & 0x03);
        out.extend_from_slice(self.text.as_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(payload);
        let dest_hash = r.u8()?;
        let src_hash = r.u8()?;
        let timestamp = r.u32()?;
        let attempt = r.u8()? & 0x03;
        let text = text_from(r.rest())?;
        Ok(Self {
            dest_hash,
            src_hash,
            timestamp,
            attempt,
            text,
        })
    }
}

/// Channel broadcast body. `text` carries the sender name as `"name: text"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupText {
    pub channel_hash: u8,
    pub timestamp: u32,
    pub flags: u8,
    pub text: String,
}

impl GroupText {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.text.len());
        out.push(self.channel_hash);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.push(self.flags);
        out.extend_from_slice(self.text.as_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(payload);
        let channel_hash = r.u8()?;
        let timestamp = r.u32()?;
        let flags = r.u8()?;
        let text = text_from(r.rest())?;
        Ok(Self {
            channel_hash,
            timestamp,
            flags,
            text,
        })
    }
}

/// Node advertisement: who we are, when, signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advert {
    pub public_key: [u8; PUB_KEY_SIZE],
    pub timestamp: u32,
    pub signature: [u8; SIGNATURE_SIZE],
    pub name: String,
}

impl Advert {
    /// Bytes covered by the signature.
    pub fn signed_bytes(public_key: &[u8; PUB_KEY_SIZE], timestamp: u32, name: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(PUB_KEY_SIZE + 4 + name.len());
        out.extend_from_slice(public_key);
        out.extend_from_slice(&timestamp.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PUB_KEY_SIZE + 4 + SIGNATURE_SIZE + self.name.len());
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(self.name.as_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(payload);
        let public_key = r.array::<PUB_KEY_SIZE>()?;
        let timestamp = r.u32()?;
        let signature = r.array::<SIGNATURE_SIZE>()?;
        let name = text_from(r.rest())?;
        Ok(Self {
            public_key,
            timestamp,
            signature,
            name,
        })
    }
}

/// Ack body: the 4-byte token.
pub fn encode_ack(token: u32) -> Vec<u8> {
    token.to_le_bytes().to_vec()
}

pub fn decode_ack(payload: &[u8]) -> Result<u32, PacketError> {
    Reader::new(payload).u32()
}

fn text_from(bytes: &[u8]) -> Result<String, PacketError> {
    std::str::from_utf8(bytes)
        .map(|s| s.trim_end_matches('\0').to_owned())
        .map_err(|_| PacketError::InvalidText)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        let end = self.pos.checked_add(n).ok_or(PacketError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(PacketError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, PacketError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, PacketError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bits() {
        let p = Packet::new(RouteType::Direct, PayloadType::Ack, vec![1, 2], vec![9; 4]);
        assert_eq!(p.header, 0b0000_1110);
        assert_eq!(p.route_type(), RouteType::Direct);
        assert_eq!(p.payload_type(), Ok(PayloadType::Ack));
        assert_eq!(p.version(), 0);
    }

    #[test]
    fn transport_codes_only_on_transport_routes() {
        let flood = Packet::new(RouteType::Flood, PayloadType::TextMessage, vec![], vec![1]);
        assert_eq!(flood.to_bytes().unwrap().len(), 3);
        let mut t = Packet::new(RouteType::TransportFlood, PayloadType::TextMessage, vec![], vec![1]);
        t.transport_codes = Some([0x1234, 0xABCD]);
        let bytes = t.to_bytes().unwrap();
        assert_eq!(&bytes[1..5], &[0x34, 0x12, 0xCD, 0xAB]);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), t);
    }

    #[test]
    fn rejects_bad_packets() {
        assert_eq!(Packet::from_bytes(&[]), Err(PacketError::Truncated));
        assert_eq!(Packet::from_bytes(&[0x05, 3, 1]), Err(PacketError::Truncated));
        assert_eq!(Packet::from_bytes(&[0x05, 65]), Err(PacketError::PathTooLong(65)));
        assert!(!is_valid_packet_data(&[0u8; 256]));
        assert!(is_valid_packet_data(&[0x05, 0, 0xAA]));

        let huge = Packet::new(RouteType::Flood, PayloadType::RawCustom, vec![], vec![0; 254]);
        assert_eq!(huge.to_bytes(), Err(PacketError::TooLarge(256)));
    }

    #[test]
    fn text_message_layout() {
        let msg = TextMessage {
            dest_hash: 0xAB,
            src_hash: 0xCD,
            timestamp: 1_700_000_000,
            attempt: 6,
            text: "hi".into(),
        };
        let bytes = msg.encode();
        assert_eq!(bytes[6], 2);
        let back = TextMessage::decode(&bytes).unwrap();
        assert_eq!(back.attempt, 2);
        assert_eq!(back.text, "hi");
        assert_eq!(TextMessage::decode(&bytes[..5]), Err(PacketError::Truncated));
    }

    #[test]
    fn group_text_and_ack() {
        let g = GroupText {
            channel_hash: 0x11,
            timestamp: 42,
            flags: 0,
            text: "bob: hello".into(),
        };
        assert_eq!(GroupText::decode(&g.encode()).unwrap(), g);
        assert_eq!(decode_ack(&encode_ack(0xDEADBEEF)), Ok(0xDEADBEEF));
        assert!(GroupText::decode(&[0x11, 0, 0, 0, 0, 0, 0xFF]).is_err());
    }

    #[test]
    fn advert_layout() {
        let a = Advert {
            public_key: [7; 32],
            timestamp: 1_700_000_123,
            signature: [9; 64],
            name: "relay".into(),
        };
        let bytes = a.encode();
        assert_eq!(bytes.len(), 32 + 4 + 64 + 5);
        assert_eq!(Advert::decode(&bytes).unwrap(), a);
    }
}
