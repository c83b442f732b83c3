use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{block, Bitfield};
use super::PeerError;

// Cap on the 4-byte length prefix. Generous enough for any bitfield or
// block a sane peer sends, small enough to bound allocation.
const MAX_MESSAGE_LEN: usize = 0x100000;

#[cfg_attr(test, derive(Debug, Clone, PartialEq, Eq))]
pub enum Message {

    // A zero length message, advises peers not to close the connection.
    KeepAlive,

    // No further requests will be satisfied.
    Choke,

    // Requests will be served again.
    Unchoke,

    // The sender wants to request blocks.
    Interested,

    NotInterested,

    // The sender acquired the piece at idx.
    Have { idx: u32 },

    // Short form advertisement of all pieces the sender has, only valid
    // directly after the handshake.
    Bitfield(Bitfield),

    // request: <index><begin><length>, all big-endian.
    Request(block::BlockInfo),

    // piece: <index><begin><data>.
    Block(block::BlockData),

    // Withdraws an earlier request.
    Cancel(block::BlockInfo),

    // Tags we don't understand are consumed and ignored so that protocol
    // extensions don't kill the connection.
    Unknown { id: u8 },

}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            Message::KeepAlive => dst.put_u32(0),

            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(raw);
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // Only ever produced by the decoder.
            Message::Unknown { .. } => {},
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Can't read the length prefix yet.
        if src.remaining() < 4 {
            return Ok(None);
        }

        let mut peeker = std::io::Cursor::new(&src[..]);
        let msg_len = peeker.get_u32() as usize;

        if msg_len > MAX_MESSAGE_LEN {
            return Err(PeerError::MessageTooLong(msg_len));
        }
        if src.remaining() < 4 + msg_len {
            // Haven't received the whole message.
            return Ok(None);
        }
        src.advance(4);

        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = src.get_u8();
        let payload_len = msg_len - 1;

        let msg = match id {
            0 if payload_len == 0 => Message::Choke,
            1 if payload_len == 0 => Message::Unchoke,
            2 if payload_len == 0 => Message::Interested,
            3 if payload_len == 0 => Message::NotInterested,
            4 if payload_len == 4 => Message::Have { idx: src.get_u32() },
            5 => {
                let mut bitfield = vec![0; payload_len];
                src.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            },
            6 if payload_len == 12 => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Request(block::BlockInfo { piece_idx, offset, len })
            },
            7 if payload_len >= 8 => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let mut data = vec![0; payload_len - 8];
                src.copy_to_slice(&mut data);
                Message::Block(block::BlockData { piece_idx, offset, data })
            },
            8 if payload_len == 12 => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Cancel(block::BlockInfo { piece_idx, offset, len })
            },
            0..=8 => {
                // Known tag with the wrong payload size.
                tracing::error!("message id {} with invalid length {}", id, msg_len);
                return Err(PeerError::InvalidMessage);
            },
            id => {
                tracing::debug!("ignoring unknown message id: {}", id);
                src.advance(payload_len);
                Message::Unknown { id }
            },
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request {{ piece: {}, offset: {}, len: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Block(block) => write!(f, "block {{ piece: {}, offset: {}, len: {} }}",
                block.piece_idx,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel {{ piece: {}, offset: {}, len: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Unknown { id } => write!(f, "unknown message id {}", id),
        }
    }
}
