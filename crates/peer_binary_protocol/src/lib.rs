// BitTorrent peer protocol implementation: parsing, serialization etc.
//
// Pure framing, no I/O. The engine feeds it contiguous byte buffers read from
// the socket and writes out what it serializes.

use bitvec::{order::Msb0, slice::BitSlice};
use byteorder::{BE, ByteOrder};
use bytes::Bytes;
use peerswarm_core::hash_id::Id20;
use serde::{Deserialize, Serialize};

const INTEGER_LEN: usize = 4;
const MSGID_LEN: usize = 1;
pub const PREAMBLE_LEN: usize = INTEGER_LEN + MSGID_LEN;
// index and begin
const PIECE_HEADER_LEN: usize = INTEGER_LEN * 2;

/// Largest payload we accept in a single frame. Bitfields of huge torrents and
/// piece blocks fit comfortably.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;
pub const MAX_MSG_LEN: usize = PREAMBLE_LEN + MAX_PAYLOAD_LEN;

pub const PSTR_BT1: &str = "BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

const MSGID_CHOKE: u8 = 0;
const MSGID_UNCHOKE: u8 = 1;
const MSGID_INTERESTED: u8 = 2;
const MSGID_NOT_INTERESTED: u8 = 3;
const MSGID_HAVE: u8 = 4;
const MSGID_BITFIELD: u8 = 5;
const MSGID_REQUEST: u8 = 6;
const MSGID_PIECE: u8 = 7;
const MSGID_CANCEL: u8 = 8;
const MSGID_PORT: u8 = 9;

/// Allowed values of the length prefix (message id included) for one id.
#[derive(Clone, Copy)]
enum FrameLen {
    Exact(u32),
    AtLeast(u32),
}

impl FrameLen {
    fn for_msg_id(msg_id: u8) -> Option<(FrameLen, &'static str)> {
        let rule = match msg_id {
            MSGID_CHOKE => (FrameLen::Exact(1), "choke"),
            MSGID_UNCHOKE => (FrameLen::Exact(1), "unchoke"),
            MSGID_INTERESTED => (FrameLen::Exact(1), "interested"),
            MSGID_NOT_INTERESTED => (FrameLen::Exact(1), "not-interested"),
            MSGID_HAVE => (FrameLen::Exact(5), "have"),
            // At least one byte of bits.
            MSGID_BITFIELD => (FrameLen::AtLeast(2), "bitfield"),
            MSGID_REQUEST => (FrameLen::Exact(13), "request"),
            // Empty blocks are not a thing.
            MSGID_PIECE => (FrameLen::AtLeast(1 + PIECE_HEADER_LEN as u32 + 1), "piece"),
            MSGID_CANCEL => (FrameLen::Exact(13), "cancel"),
            MSGID_PORT => (FrameLen::Exact(3), "port"),
            _ => return None,
        };
        Some(rule)
    }

    fn check(self, len_prefix: u32, msg_id: u8) -> Result<(), MessageDeserializeError> {
        let (ok, expected) = match self {
            FrameLen::Exact(n) => (len_prefix == n, n),
            FrameLen::AtLeast(n) => (len_prefix >= n, n),
        };
        if ok {
            return Ok(());
        }
        Err(MessageDeserializeError::IncorrectLenPrefix {
            received: len_prefix,
            expected,
            msg_id,
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MessageDeserializeError {
    #[error("not enough data to deserialize {1}: expected at least {0} more bytes")]
    NotEnoughData(usize, &'static str),
    #[error("unsupported message id {0}")]
    UnsupportedMessageId(u8),
    #[error(
        "incorrect len prefix for message id {msg_id}, expected {expected}, received {received}"
    )]
    IncorrectLenPrefix {
        received: u32,
        expected: u32,
        msg_id: u8,
    },
    #[error("message too long: len prefix {0}, max {max}", max = MAX_MSG_LEN)]
    MessageTooLong(u32),
    #[error("pstr should be 19 bytes long, but received {0}")]
    BadPstrLen(u8),
    #[error("pstr doesn't match bittorrent V1")]
    BadPstr,
}

#[derive(thiserror::Error, Debug)]
pub enum SerializeError {
    #[error("payload of {name} too large: {len} bytes")]
    PayloadTooLarge { name: &'static str, len: usize },
}

#[derive(Clone, PartialEq, Eq)]
pub struct Piece {
    pub index: u32,
    pub begin: u32,
    pub block: Bytes,
}

impl std::fmt::Debug for Piece {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Piece")
            .field("index", &self.index)
            .field("begin", &self.begin)
            .field("len", &self.block.len())
            .finish()
    }
}

impl Piece {
    pub fn from_data(index: u32, begin: u32, block: impl Into<Bytes>) -> Piece {
        Piece {
            index,
            begin,
            block: block.into(),
        }
    }

    pub fn as_request(&self) -> Request {
        Request::new(self.index, self.begin, self.block.len() as u32)
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        put_u32(out, self.index);
        put_u32(out, self.begin);
        out.extend_from_slice(&self.block);
    }

    fn deserialize(buf: &[u8]) -> Piece {
        let index = BE::read_u32(&buf[0..4]);
        let begin = BE::read_u32(&buf[4..8]);
        let block = Bytes::copy_from_slice(&buf[8..]);
        Piece {
            index,
            begin,
            block,
        }
    }
}

/// A message as it appears on the wire after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request(Request),
    Piece(Piece),
    Cancel(Request),
    Port(u16),
}

pub type BitfieldBorrowed<'a> = &'a BitSlice<u8, Msb0>;

/// Bit i of byte i/8 is piece i, most significant bit first.
pub fn bitfield_bits(buf: &[u8]) -> BitfieldBorrowed<'_> {
    BitSlice::from_slice(buf)
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    BE::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not-interested",
            Message::Have(_) => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request(_) => "request",
            Message::Piece(_) => "piece",
            Message::Cancel(_) => "cancel",
            Message::Port(_) => "port",
        }
    }

    /// None for keep-alive, which is a bare zero length prefix.
    pub fn msg_id(&self) -> Option<u8> {
        let id = match self {
            Message::KeepAlive => return None,
            Message::Choke => MSGID_CHOKE,
            Message::Unchoke => MSGID_UNCHOKE,
            Message::Interested => MSGID_INTERESTED,
            Message::NotInterested => MSGID_NOT_INTERESTED,
            Message::Have(_) => MSGID_HAVE,
            Message::Bitfield(_) => MSGID_BITFIELD,
            Message::Request(_) => MSGID_REQUEST,
            Message::Piece(_) => MSGID_PIECE,
            Message::Cancel(_) => MSGID_CANCEL,
            Message::Port(_) => MSGID_PORT,
        };
        Some(id)
    }

    /// Append the framed message to "out". Returns the number of bytes written.
    pub fn serialize(&self, out: &mut Vec<u8>) -> Result<usize, SerializeError> {
        let start = out.len();
        let Some(msg_id) = self.msg_id() else {
            put_u32(out, 0);
            return Ok(INTEGER_LEN);
        };

        let large_payload = match self {
            Message::Bitfield(b) => b.len(),
            Message::Piece(p) => PIECE_HEADER_LEN + p.block.len(),
            _ => 0,
        };
        if large_payload > MAX_PAYLOAD_LEN {
            return Err(SerializeError::PayloadTooLarge {
                name: self.name(),
                len: large_payload,
            });
        }

        // Length prefix is patched in once the payload is written.
        put_u32(out, 0);
        out.push(msg_id);
        match self {
            Message::Have(index) => put_u32(out, *index),
            Message::Bitfield(b) => out.extend_from_slice(b),
            Message::Request(r) | Message::Cancel(r) => r.serialize(out),
            Message::Piece(p) => p.serialize(out),
            Message::Port(port) => out.extend_from_slice(&port.to_be_bytes()),
            _ => {}
        }
        let written = out.len() - start;
        BE::write_u32(
            &mut out[start..start + INTEGER_LEN],
            (written - INTEGER_LEN) as u32,
        );
        Ok(written)
    }

    /// Try to parse one framed message from the start of "buf".
    /// Returns the message and the number of bytes it occupied.
    ///
    /// The length prefix is validated as soon as the message id is known, so a
    /// malformed frame is rejected before its payload arrives.
    pub fn deserialize(buf: &[u8]) -> Result<(Message, usize), MessageDeserializeError> {
        let Some(prefix) = buf.get(..INTEGER_LEN) else {
            return Err(MessageDeserializeError::NotEnoughData(
                INTEGER_LEN - buf.len(),
                "message",
            ));
        };
        let len_prefix = BE::read_u32(prefix);
        if len_prefix == 0 {
            return Ok((Message::KeepAlive, INTEGER_LEN));
        }
        if len_prefix as usize > MAX_MSG_LEN - INTEGER_LEN {
            return Err(MessageDeserializeError::MessageTooLong(len_prefix));
        }
        let Some(&msg_id) = buf.get(INTEGER_LEN) else {
            return Err(MessageDeserializeError::NotEnoughData(1, "message"));
        };
        let (rule, name) = FrameLen::for_msg_id(msg_id)
            .ok_or(MessageDeserializeError::UnsupportedMessageId(msg_id))?;
        rule.check(len_prefix, msg_id)?;

        let frame_len = INTEGER_LEN + len_prefix as usize;
        let Some(frame) = buf.get(..frame_len) else {
            return Err(MessageDeserializeError::NotEnoughData(
                frame_len - buf.len(),
                name,
            ));
        };
        let payload = &frame[PREAMBLE_LEN..];

        let msg = match msg_id {
            MSGID_CHOKE => Message::Choke,
            MSGID_UNCHOKE => Message::Unchoke,
            MSGID_INTERESTED => Message::Interested,
            MSGID_NOT_INTERESTED => Message::NotInterested,
            MSGID_HAVE => Message::Have(BE::read_u32(payload)),
            MSGID_BITFIELD => Message::Bitfield(Bytes::copy_from_slice(payload)),
            MSGID_REQUEST => Message::Request(Request::deserialize(payload)),
            MSGID_CANCEL => Message::Cancel(Request::deserialize(payload)),
            MSGID_PIECE => Message::Piece(Piece::deserialize(payload)),
            MSGID_PORT => Message::Port(BE::read_u16(payload)),
            _ => return Err(MessageDeserializeError::UnsupportedMessageId(msg_id)),
        };
        Ok((msg, frame_len))
    }
}

/// Size of a serialized piece message carrying a block of "block_len" bytes.
pub const fn piece_message_len(block_len: usize) -> usize {
    PREAMBLE_LEN + PIECE_HEADER_LEN + block_len
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: Id20,
    pub peer_id: Id20,
}

impl Handshake {
    pub fn new(info_hash: Id20, peer_id: Id20) -> Handshake {
        debug_assert_eq!(PSTR_BT1.len(), 19);

        Handshake {
            // No extensions are advertised.
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(PSTR_BT1.len() as u8);
        out.extend_from_slice(PSTR_BT1.as_bytes());
        out.extend_from_slice(&self.reserved);
        out.extend_from_slice(&self.info_hash.0);
        out.extend_from_slice(&self.peer_id.0);
    }

    pub fn deserialize(b: &[u8]) -> Result<(Handshake, usize), MessageDeserializeError> {
        let pstr_len = *b
            .first()
            .ok_or(MessageDeserializeError::NotEnoughData(1, "handshake"))?;
        if pstr_len as usize != PSTR_BT1.len() {
            return Err(MessageDeserializeError::BadPstrLen(pstr_len));
        }
        // Messages may already follow the handshake in the buffer.
        let hbuf = b.get(..HANDSHAKE_LEN).ok_or_else(|| {
            MessageDeserializeError::NotEnoughData(HANDSHAKE_LEN - b.len(), "handshake")
        })?;
        if &hbuf[1..20] != PSTR_BT1.as_bytes() {
            return Err(MessageDeserializeError::BadPstr);
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&hbuf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&hbuf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&hbuf[48..68]);
        Ok((
            Handshake {
                reserved,
                info_hash: Id20::new(info_hash),
                peer_id: Id20::new(peer_id),
            },
            HANDSHAKE_LEN,
        ))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Request {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        put_u32(out, self.index);
        put_u32(out, self.begin);
        put_u32(out, self.length);
    }

    fn deserialize(b: &[u8]) -> Self {
        Self {
            index: BE::read_u32(&b[0..4]),
            begin: BE::read_u32(&b[4..8]),
            length: BE::read_u32(&b[8..12]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ser(msg: &Message) -> Vec<u8> {
        let mut out = Vec::new();
        let len = msg.serialize(&mut out).unwrap();
        assert_eq!(len, out.len());
        out
    }

    #[test]
    fn test_handshake_serialize() {
        let info_hash = Id20::new([
            1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
        ]);
        let peer_id = Id20::new([9u8; 20]);
        let mut buf = Vec::new();
        Handshake::new(info_hash, peer_id).serialize(&mut buf);
        assert_eq!(buf.len(), 20 + 20 + 8 + 19 + 1);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(&buf[28..48], &info_hash.0);

        let (h, size) = Handshake::deserialize(&buf).unwrap();
        assert_eq!(size, HANDSHAKE_LEN);
        assert_eq!(h.info_hash, info_hash);
        assert_eq!(h.peer_id, peer_id);
    }

    #[test]
    fn test_handshake_followed_by_message() {
        let mut buf = Vec::new();
        Handshake::new(Id20::new([3u8; 20]), Id20::new([4u8; 20])).serialize(&mut buf);
        Message::Bitfield(Bytes::from_static(&[0xff, 0x80]))
            .serialize(&mut buf)
            .unwrap();

        let (h, size) = Handshake::deserialize(&buf).unwrap();
        assert_eq!(size, HANDSHAKE_LEN);
        assert_eq!(h.peer_id, Id20::new([4u8; 20]));
        let (msg, _) = Message::deserialize(&buf[size..]).unwrap();
        assert_eq!(msg, Message::Bitfield(Bytes::from_static(&[0xff, 0x80])));
    }

    #[test]
    fn test_handshake_errors() {
        let mut buf = Vec::new();
        Handshake::new(Id20::default(), Id20::default()).serialize(&mut buf);

        assert!(matches!(
            Handshake::deserialize(&buf[..30]),
            Err(MessageDeserializeError::NotEnoughData(38, "handshake"))
        ));

        let mut bad_len = buf.clone();
        bad_len[0] = 18;
        assert!(matches!(
            Handshake::deserialize(&bad_len),
            Err(MessageDeserializeError::BadPstrLen(18))
        ));

        let mut bad_pstr = buf.clone();
        bad_pstr[1] = b'b';
        assert!(matches!(
            Handshake::deserialize(&bad_pstr),
            Err(MessageDeserializeError::BadPstr)
        ));
    }

    #[test]
    fn test_exact_wire_layout() {
        assert_eq!(ser(&Message::KeepAlive), vec![0, 0, 0, 0]);
        assert_eq!(ser(&Message::Choke), vec![0, 0, 0, 1, 0]);
        assert_eq!(ser(&Message::Have(258)), vec![0, 0, 0, 5, 4, 0, 0, 1, 2]);
        assert_eq!(
            ser(&Message::Request(Request::new(1, 16384, 16384))),
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
        assert_eq!(
            ser(&Message::Cancel(Request::new(1, 0, 1)))[4],
            MSGID_CANCEL
        );
        assert_eq!(ser(&Message::Port(6881)), vec![0, 0, 0, 3, 9, 0x1a, 0xe1]);
        assert_eq!(
            ser(&Message::Piece(Piece::from_data(2, 4, vec![7u8, 8]))),
            vec![0, 0, 0, 11, 7, 0, 0, 0, 2, 0, 0, 0, 4, 7, 8]
        );
    }

    #[test]
    fn test_roundtrip_all_variants() {
        let max_block = vec![0xabu8; MAX_PAYLOAD_LEN - 8];
        let max_bitfield = vec![0xffu8; MAX_PAYLOAD_LEN];
        let messages = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(u32::MAX),
            Message::Bitfield(Bytes::from_static(&[0b1010_0000])),
            Message::Bitfield(Bytes::from(max_bitfield)),
            Message::Request(Request::new(3, 16384, 16384)),
            Message::Piece(Piece::from_data(3, 16384, vec![1u8, 2, 3])),
            Message::Piece(Piece::from_data(0, 0, max_block)),
            Message::Cancel(Request::new(3, 0, 16384)),
            Message::Port(6881),
        ];
        for msg in messages {
            let buf = ser(&msg);
            let (back, size) = Message::deserialize(&buf).unwrap();
            assert_eq!(size, buf.len(), "{}", msg.name());
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn test_serialize_appends() {
        let mut out = Vec::new();
        Message::Interested.serialize(&mut out).unwrap();
        Message::Have(1).serialize(&mut out).unwrap();
        let (first, size) = Message::deserialize(&out).unwrap();
        assert_eq!(first, Message::Interested);
        let (second, _) = Message::deserialize(&out[size..]).unwrap();
        assert_eq!(second, Message::Have(1));
    }

    #[test]
    fn test_partial_data() {
        let buf = ser(&Message::Piece(Piece::from_data(0, 0, vec![0u8; 100])));
        assert!(matches!(
            Message::deserialize(&buf[..2]),
            Err(MessageDeserializeError::NotEnoughData(2, "message"))
        ));
        assert!(matches!(
            Message::deserialize(&buf[..4]),
            Err(MessageDeserializeError::NotEnoughData(1, "message"))
        ));
        assert!(matches!(
            Message::deserialize(&buf[..50]),
            Err(MessageDeserializeError::NotEnoughData(63, "piece"))
        ));
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            Message::deserialize(&[0, 0, 0, 2, MSGID_CHOKE, 0]),
            Err(MessageDeserializeError::IncorrectLenPrefix {
                received: 2,
                expected: 1,
                msg_id: 0
            })
        ));
        assert!(matches!(
            Message::deserialize(&[0, 0, 0, 1, 20]),
            Err(MessageDeserializeError::UnsupportedMessageId(20))
        ));
        assert!(matches!(
            Message::deserialize(&[0xff, 0xff, 0xff, 0xff, MSGID_PIECE]),
            Err(MessageDeserializeError::MessageTooLong(_))
        ));
        assert!(matches!(
            Message::deserialize(&[0, 0, 0, 9, MSGID_PIECE, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(MessageDeserializeError::IncorrectLenPrefix { .. })
        ));
    }

    #[test]
    fn test_serialize_too_large() {
        let msg = Message::Bitfield(Bytes::from(vec![0u8; MAX_PAYLOAD_LEN + 1]));
        let mut out = Vec::new();
        assert!(matches!(
            msg.serialize(&mut out),
            Err(SerializeError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_bitfield_msb_first() {
        let bits = bitfield_bits(&[0b1000_0001, 0b0100_0000]);
        assert!(bits[0]);
        assert!(!bits[1]);
        assert!(bits[7]);
        assert!(bits[9]);
        assert_eq!(bits.count_ones(), 3);
    }
}
