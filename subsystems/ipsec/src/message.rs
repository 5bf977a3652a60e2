//! # Key Message Codec
//!
//! Bit-exact encoding of the control messages exchanged with key daemons.
//!
//! ```text
//!   ┌──────────────────────────────┐  0
//!   │ fixed header (52 bytes, LE)  │
//!   ├──────────────────────────────┤ 52
//!   │ source_addr  (sockaddr)      │
//!   │ dest_addr    (sockaddr)      │
//!   │ from_addr    (sockaddr)      │  absent address = one zero word
//!   │ key          [key_len]       │
//!   │ iv           [iv_len]        │  omitted when the length is zero
//!   │ secondary    [secondary_len] │
//!   └──────────────────────────────┘  every block padded to 4 bytes
//! ```

use alloc::vec::Vec;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{SaError, SaResult};
use crate::key::SaKey;
use crate::sa::{ReplayWindow, SaLifetime, SaMaterial, SaType, SecurityAssociation};

// =============================================================================
// LAYOUT
// =============================================================================

/// Only accepted protocol version
pub const KEY_MSG_VERSION: u8 = 1;

/// Fixed header size
pub const HEADER_LEN: usize = 52;

/// Block alignment
pub const BLOCK_ALIGN: usize = 4;

/// sockaddr family tag for IPv4
pub const AF_INET: u8 = 2;

/// sockaddr family tag for IPv6
pub const AF_INET6: u8 = 28;

/// Encoded IPv4 address block length
pub const SOCKADDR_IN_LEN: u8 = 16;

/// Encoded IPv6 address block length
pub const SOCKADDR_IN6_LEN: u8 = 28;

mod offset {
    pub const MSG_LEN: usize = 0;
    pub const VERSION: usize = 4;
    pub const MSG_TYPE: usize = 5;
    pub const PID: usize = 8;
    pub const SEQ: usize = 12;
    pub const ERRNO: usize = 16;
    pub const ASSOC_TYPE: usize = 20;
    pub const ASSOC_VERSION: usize = 21;
    pub const STATE: usize = 22;
    pub const LABEL: usize = 23;
    pub const SPI: usize = 24;
    pub const KEY_LEN: usize = 28;
    pub const SECONDARY_KEY_LEN: usize = 30;
    pub const IV_LEN: usize = 32;
    pub const ALGORITHM: usize = 34;
    pub const LIFETIME_KIND: usize = 36;
    pub const LIFETIME_1: usize = 40;
    pub const LIFETIME_2: usize = 44;
    pub const ANTIREPLAY: usize = 48;
}

static_assertions::const_assert_eq!(offset::ANTIREPLAY + 4, HEADER_LEN);
static_assertions::const_assert_eq!(HEADER_LEN % BLOCK_ALIGN, 0);

/// Round `len` up to the block alignment
const fn padded(len: usize) -> usize {
    (len + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

// =============================================================================
// MESSAGE TYPE
// =============================================================================

/// Control message type
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Install a complete association
    Add     = 1,
    /// Delete an association
    Delete  = 2,
    /// Complete or refresh an association
    Update  = 3,
    /// Read an association
    Get     = 4,
    /// Kernel → daemon: please negotiate an association
    Acquire = 5,
    /// Reserve an SPI
    GetSpi  = 6,
    /// Register for acquires of one type
    Register = 7,
    /// Export every association
    Dump    = 9,
    /// Delete all associations (of one type)
    Flush   = 10,
}

impl MessageType {
    /// Decode a wire type tag
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Add),
            2 => Some(Self::Delete),
            3 => Some(Self::Update),
            4 => Some(Self::Get),
            5 => Some(Self::Acquire),
            6 => Some(Self::GetSpi),
            7 => Some(Self::Register),
            9 => Some(Self::Dump),
            10 => Some(Self::Flush),
            _ => None,
        }
    }
}

// =============================================================================
// MESSAGE
// =============================================================================

/// A decoded control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMessage {
    /// Message type
    pub msg_type: MessageType,
    /// Sender process id
    pub pid: u32,
    /// Request sequence number
    pub seq: u32,
    /// 0 on success, BSD errno otherwise
    pub errno: u32,
    /// Association type tag (0 = unspecified)
    pub assoc_type: u8,
    /// Association version
    pub assoc_version: u8,
    /// Association state byte
    pub state: u8,
    /// Sensitivity label
    pub label: u8,
    /// Security parameter index
    pub spi: u32,
    /// Algorithm identifier
    pub algorithm: u16,
    /// Lifetime kind
    pub lifetime_kind: u32,
    /// First lifetime value (GETSPI: range low)
    pub lifetime_1: u32,
    /// Second lifetime value (GETSPI: range high)
    pub lifetime_2: u32,
    /// Non-zero when anti-replay is requested
    pub antireplay: u32,
    /// Source address
    pub src: Option<IpAddr>,
    /// Destination address
    pub dst: Option<IpAddr>,
    /// Address of the requester
    pub from: Option<IpAddr>,
    /// Primary key bytes
    pub key: Vec<u8>,
    /// Initialization vector
    pub iv: Vec<u8>,
    /// Secondary key bytes
    pub secondary_key: Vec<u8>,
}

impl KeyMessage {
    /// Create an empty message of one type
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            pid: 0,
            seq: 0,
            errno: 0,
            assoc_type: 0,
            assoc_version: 0,
            state: 0,
            label: 0,
            spi: 0,
            algorithm: 0,
            lifetime_kind: 0,
            lifetime_1: 0,
            lifetime_2: 0,
            antireplay: 0,
            src: None,
            dst: None,
            from: None,
            key: Vec::new(),
            iv: Vec::new(),
            secondary_key: Vec::new(),
        }
    }

    /// Describe a stored association
    pub fn from_record(msg_type: MessageType, sa: &SecurityAssociation) -> Self {
        Self {
            assoc_type: sa.sa_type() as u8,
            assoc_version: sa.version,
            state: sa.state() as u8,
            label: sa.label,
            spi: sa.spi(),
            algorithm: sa.material.algorithm,
            lifetime_kind: sa.lifetime.kind,
            lifetime_1: sa.lifetime.value_1,
            lifetime_2: sa.lifetime.value_2,
            antireplay: u32::from(sa.replay.enabled),
            src: Some(sa.key.src),
            dst: Some(sa.key.dst),
            key: sa.material.key.clone(),
            iv: sa.material.iv.clone(),
            secondary_key: sa.material.secondary_key.clone(),
            ..Self::new(msg_type)
        }
    }

    /// ACQUIRE notification for (type, src, dst)
    pub fn acquire(sa_type: SaType, src: Option<IpAddr>, dst: IpAddr, seq: u32) -> Self {
        Self {
            seq,
            assoc_type: sa_type as u8,
            src,
            dst: Some(dst),
            ..Self::new(MessageType::Acquire)
        }
    }

    /// Reply echoing this request's header with `errno`
    pub fn reply(&self, errno: u32) -> Self {
        Self {
            msg_type: self.msg_type,
            pid: self.pid,
            seq: self.seq,
            errno,
            assoc_type: self.assoc_type,
            assoc_version: self.assoc_version,
            spi: self.spi,
            src: self.src,
            dst: self.dst,
            ..Self::new(self.msg_type)
        }
    }

    /// Association type; `InvalidArgument` when missing or unknown
    pub fn sa_type(&self) -> SaResult<SaType> {
        SaType::from_u8(self.assoc_type).ok_or(SaError::InvalidArgument)
    }

    /// Both endpoint addresses, which must share a family
    pub fn endpoints(&self) -> SaResult<(IpAddr, IpAddr)> {
        match (self.src, self.dst) {
            (Some(src), Some(dst)) if src.is_ipv4() == dst.is_ipv4() => Ok((src, dst)),
            _ => Err(SaError::InvalidArgument),
        }
    }

    /// Identity named by this message
    pub fn sa_key(&self) -> SaResult<SaKey> {
        let (src, dst) = self.endpoints()?;
        Ok(SaKey::new(self.sa_type()?, src, dst, self.spi))
    }

    /// Association described by an ADD or UPDATE body
    ///
    /// AH and ESP carry their primary key in `key`; a body without one is
    /// `InvalidArgument`.
    pub fn to_record(&self) -> SaResult<SecurityAssociation> {
        let key = self.sa_key()?;
        if matches!(key.sa_type, SaType::Ah | SaType::Esp) && self.key.is_empty() {
            return Err(SaError::InvalidArgument);
        }
        let mut sa = SecurityAssociation::new(key.sa_type, key.src, key.dst, key.spi)
            .with_version(self.assoc_version)
            .with_material(SaMaterial {
                key: self.key.clone(),
                iv: self.iv.clone(),
                secondary_key: self.secondary_key.clone(),
                algorithm: self.algorithm,
            })
            .with_lifetime(SaLifetime {
                kind: self.lifetime_kind,
                value_1: self.lifetime_1,
                value_2: self.lifetime_2,
            });
        sa.label = self.label;
        sa.replay = ReplayWindow {
            enabled: self.antireplay != 0,
            ..ReplayWindow::default()
        };
        Ok(sa)
    }

    /// Total encoded size
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + addr_block_len(self.src.as_ref())
            + addr_block_len(self.dst.as_ref())
            + addr_block_len(self.from.as_ref())
            + padded(self.key.len())
            + padded(self.iv.len())
            + padded(self.secondary_key.len())
    }

    // =========================================================================
    // ENCODE
    // =========================================================================

    /// Serialize to wire bytes
    pub fn encode(&self) -> SaResult<Vec<u8>> {
        let key_len = wire_len(&self.key)?;
        let iv_len = wire_len(&self.iv)?;
        let secondary_len = wire_len(&self.secondary_key)?;
        let total = self.encoded_len();
        let msg_len = u32::try_from(total).map_err(|_| SaError::InvalidArgument)?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(total)
            .map_err(|_| SaError::OutOfResources)?;
        buf.resize(HEADER_LEN, 0);

        put_u32(&mut buf, offset::MSG_LEN, msg_len);
        buf[offset::VERSION] = KEY_MSG_VERSION;
        buf[offset::MSG_TYPE] = self.msg_type as u8;
        put_u32(&mut buf, offset::PID, self.pid);
        put_u32(&mut buf, offset::SEQ, self.seq);
        put_u32(&mut buf, offset::ERRNO, self.errno);
        buf[offset::ASSOC_TYPE] = self.assoc_type;
        buf[offset::ASSOC_VERSION] = self.assoc_version;
        buf[offset::STATE] = self.state;
        buf[offset::LABEL] = self.label;
        put_u32(&mut buf, offset::SPI, self.spi);
        put_u16(&mut buf, offset::KEY_LEN, key_len);
        put_u16(&mut buf, offset::SECONDARY_KEY_LEN, secondary_len);
        put_u16(&mut buf, offset::IV_LEN, iv_len);
        put_u16(&mut buf, offset::ALGORITHM, self.algorithm);
        put_u32(&mut buf, offset::LIFETIME_KIND, self.lifetime_kind);
        put_u32(&mut buf, offset::LIFETIME_1, self.lifetime_1);
        put_u32(&mut buf, offset::LIFETIME_2, self.lifetime_2);
        put_u32(&mut buf, offset::ANTIREPLAY, self.antireplay);

        for addr in [self.src, self.dst, self.from] {
            encode_addr(&mut buf, addr.as_ref());
        }
        for block in [&self.key, &self.iv, &self.secondary_key] {
            buf.extend_from_slice(block);
            buf.resize(padded(buf.len()), 0);
        }

        debug_assert_eq!(buf.len(), total);
        Ok(buf)
    }

    // =========================================================================
    // DECODE
    // =========================================================================

    /// Parse wire bytes
    pub fn decode(bytes: &[u8]) -> SaResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(SaError::InvalidArgument);
        }

        let mut header = Reader::new(bytes);
        let msg_len = header.u32_at(offset::MSG_LEN)? as usize;
        if msg_len != bytes.len() {
            return Err(SaError::InvalidArgument);
        }
        if bytes[offset::VERSION] != KEY_MSG_VERSION {
            return Err(SaError::Unsupported);
        }
        let msg_type = MessageType::from_u8(bytes[offset::MSG_TYPE]).ok_or(SaError::Unsupported)?;

        let key_len = header.u16_at(offset::KEY_LEN)? as usize;
        let secondary_len = header.u16_at(offset::SECONDARY_KEY_LEN)? as usize;
        let iv_len = header.u16_at(offset::IV_LEN)? as usize;

        let mut msg = Self {
            pid: header.u32_at(offset::PID)?,
            seq: header.u32_at(offset::SEQ)?,
            errno: header.u32_at(offset::ERRNO)?,
            assoc_type: bytes[offset::ASSOC_TYPE],
            assoc_version: bytes[offset::ASSOC_VERSION],
            state: bytes[offset::STATE],
            label: bytes[offset::LABEL],
            spi: header.u32_at(offset::SPI)?,
            algorithm: header.u16_at(offset::ALGORITHM)?,
            lifetime_kind: header.u32_at(offset::LIFETIME_KIND)?,
            lifetime_1: header.u32_at(offset::LIFETIME_1)?,
            lifetime_2: header.u32_at(offset::LIFETIME_2)?,
            antireplay: header.u32_at(offset::ANTIREPLAY)?,
            ..Self::new(msg_type)
        };

        header.pos = HEADER_LEN;
        msg.src = decode_addr(&mut header)?;
        msg.dst = decode_addr(&mut header)?;
        msg.from = decode_addr(&mut header)?;
        msg.key = header.block(key_len)?;
        msg.iv = header.block(iv_len)?;
        msg.secondary_key = header.block(secondary_len)?;

        if header.pos != bytes.len() {
            return Err(SaError::InvalidArgument);
        }
        Ok(msg)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn wire_len(block: &[u8]) -> SaResult<u16> {
    u16::try_from(block.len()).map_err(|_| SaError::InvalidArgument)
}

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn addr_block_len(addr: Option<&IpAddr>) -> usize {
    match addr {
        None => BLOCK_ALIGN,
        Some(IpAddr::V4(_)) => SOCKADDR_IN_LEN as usize,
        Some(IpAddr::V6(_)) => SOCKADDR_IN6_LEN as usize,
    }
}

fn encode_addr(buf: &mut Vec<u8>, addr: Option<&IpAddr>) {
    match addr {
        None => buf.extend_from_slice(&[0; BLOCK_ALIGN]),
        Some(IpAddr::V4(v4)) => {
            buf.extend_from_slice(&[SOCKADDR_IN_LEN, AF_INET, 0, 0]);
            buf.extend_from_slice(&v4.octets());
            buf.extend_from_slice(&[0; 8]);
        },
        Some(IpAddr::V6(v6)) => {
            buf.extend_from_slice(&[SOCKADDR_IN6_LEN, AF_INET6, 0, 0]);
            buf.extend_from_slice(&[0; 4]);
            buf.extend_from_slice(&v6.octets());
            buf.extend_from_slice(&[0; 4]);
        },
    }
}

/// Port, flowinfo, scope and padding are skipped: only the payload matters
fn decode_addr(reader: &mut Reader<'_>) -> SaResult<Option<IpAddr>> {
    let start = reader.pos;
    let head = reader.take(BLOCK_ALIGN)?;
    let (len, family) = (head[0], head[1]);

    let addr = match (len, family) {
        (0, _) => return Ok(None),
        (SOCKADDR_IN_LEN, AF_INET) => {
            let body = reader.take(SOCKADDR_IN_LEN as usize - BLOCK_ALIGN)?;
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&body[..4]);
            IpAddr::V4(Ipv4Addr::from(octets))
        },
        (SOCKADDR_IN6_LEN, AF_INET6) => {
            let body = reader.take(SOCKADDR_IN6_LEN as usize - BLOCK_ALIGN)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[4..20]);
            IpAddr::V6(Ipv6Addr::from(octets))
        },
        _ => return Err(SaError::InvalidArgument),
    };

    debug_assert_eq!(reader.pos - start, padded(len as usize));
    Ok(Some(addr))
}

/// Bounds-checked little-endian reader
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn slice(&self, at: usize, len: usize) -> SaResult<&'a [u8]> {
        let end = at.checked_add(len).ok_or(SaError::InvalidArgument)?;
        self.bytes.get(at..end).ok_or(SaError::InvalidArgument)
    }

    fn u16_at(&self, at: usize) -> SaResult<u16> {
        let raw = self.slice(at, 2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32_at(&self, at: usize) -> SaResult<u32> {
        let raw = self.slice(at, 4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn take(&mut self, len: usize) -> SaResult<&'a [u8]> {
        let raw = self.slice(self.pos, len)?;
        self.pos += len;
        Ok(raw)
    }

    /// Material block of `len` bytes plus padding; empty when `len` is zero
    fn block(&mut self, len: usize) -> SaResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let data = self.slice(self.pos, len)?.to_vec();
        self.take(padded(len))?;
        Ok(data)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sa::SaState;

    fn v4(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 1, 1, last))
    }

    fn add_message() -> KeyMessage {
        KeyMessage {
            pid: 77,
            seq: 5,
            assoc_type: SaType::Esp as u8,
            spi: 0x1234,
            src: Some(v4(1)),
            dst: Some(v4(2)),
            key: alloc::vec![0xAB; 5],
            iv: alloc::vec![1, 2, 3, 4, 5, 6, 7, 8],
            ..KeyMessage::new(MessageType::Add)
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = add_message().encode().unwrap();

        assert_eq!(&bytes[0..4], &(bytes.len() as u32).to_le_bytes());
        assert_eq!(bytes[4], KEY_MSG_VERSION);
        assert_eq!(bytes[5], MessageType::Add as u8);
        assert_eq!(&bytes[8..12], &77u32.to_le_bytes());
        assert_eq!(bytes[20], 3);
        assert_eq!(&bytes[24..28], &0x1234u32.to_le_bytes());
        assert_eq!(&bytes[28..30], &5u16.to_le_bytes());
        assert_eq!(&bytes[32..34], &8u16.to_le_bytes());
    }

    #[test]
    fn test_blocks_are_padded_and_ordered() {
        let bytes = add_message().encode().unwrap();

        // src (16) + dst (16) + absent from (4) + key 5→8 + iv 8
        assert_eq!(bytes.len(), HEADER_LEN + 16 + 16 + 4 + 8 + 8);
        assert_eq!(&bytes[52..56], &[16, AF_INET, 0, 0]);
        assert_eq!(&bytes[56..60], &[10, 1, 1, 1]);
        assert_eq!(&bytes[84..88], &[0, 0, 0, 0]);
        assert_eq!(&bytes[88..96], &[0xAB, 0xAB, 0xAB, 0xAB, 0xAB, 0, 0, 0]);
        assert_eq!(bytes.len() % BLOCK_ALIGN, 0);
    }

    #[test]
    fn test_decode_restores_message() {
        let mut msg = add_message();
        msg.dst = Some(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 9)));
        msg.src = Some(IpAddr::V6(Ipv6Addr::LOCALHOST));
        msg.secondary_key = alloc::vec![9; 20];

        let decoded = KeyMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_ignores_sockaddr_padding() {
        let mut bytes = add_message().encode().unwrap();
        // Port and zero padding of the source address
        bytes[54] = 0x1F;
        bytes[60] = 0xFF;

        let decoded = KeyMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.src, Some(v4(1)));
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        let bytes = add_message().encode().unwrap();
        assert_eq!(
            KeyMessage::decode(&bytes[..40]),
            Err(SaError::InvalidArgument)
        );
        assert_eq!(
            KeyMessage::decode(&bytes[..bytes.len() - 4]),
            Err(SaError::InvalidArgument)
        );

        let mut wrong_version = bytes.clone();
        wrong_version[4] = 2;
        assert_eq!(KeyMessage::decode(&wrong_version), Err(SaError::Unsupported));

        let mut wrong_type = bytes.clone();
        wrong_type[5] = 8;
        assert_eq!(KeyMessage::decode(&wrong_type), Err(SaError::Unsupported));

        let mut wrong_family = bytes;
        wrong_family[53] = 7;
        assert_eq!(
            KeyMessage::decode(&wrong_family),
            Err(SaError::InvalidArgument)
        );
    }

    #[test]
    fn test_record_conversion() {
        let sa = add_message().to_record().unwrap();
        assert_eq!(sa.spi(), 0x1234);
        assert_eq!(sa.material.iv.len(), 8);

        let back = KeyMessage::from_record(MessageType::Get, &sa);
        assert_eq!(back.state, SaState::Complete as u8);
        assert_eq!(back.key, add_message().key);

        let mut missing = add_message();
        missing.dst = None;
        assert_eq!(missing.to_record(), Err(SaError::InvalidArgument));

        let mut mixed = add_message();
        mixed.dst = Some(IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(mixed.sa_key(), Err(SaError::InvalidArgument));
    }

    #[test]
    fn test_keyless_ah_esp_rejected() {
        let mut keyless = add_message();
        keyless.key.clear();
        assert_eq!(keyless.to_record(), Err(SaError::InvalidArgument));

        keyless.assoc_type = SaType::Ah as u8;
        assert_eq!(keyless.to_record(), Err(SaError::InvalidArgument));

        // Types without mandatory material are not affected
        keyless.assoc_type = SaType::IpComp as u8;
        assert!(keyless.to_record().is_ok());
    }
}
