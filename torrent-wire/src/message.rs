use std::io;

use bytes::{Buf, BufMut, BytesMut};
use log::trace;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    bitfield::{Bitfield, BitfieldError},
    error::ErrorKind,
};

pub(crate) type Result<T> = std::result::Result<T, MessageError>;

/// A zero length prefix, sent to keep an idle connection open.
pub const KEEP_ALIVE: [u8; 4] = [0; 4];

// Default cap on the length prefix of an incoming frame. Larger frames are
// refused before anything is allocated for them; the largest legitimate ones
// are bitfields of huge torrents and piece messages with oversized blocks.
pub const MAX_MESSAGE_LENGTH: usize = 1 << 21;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("expected a {expected:?} message, got {actual:?}")]
    UnexpectedKind {
        expected: MessageId,
        actual: MessageKind,
    },

    #[error("{id:?} payload has {actual} bytes, expected {expected}")]
    InvalidPayloadLength {
        id: MessageId,
        expected: usize,
        actual: usize,
    },

    #[error("expected piece {expected}, got piece {actual}")]
    PieceIndexMismatch { expected: u32, actual: u32 },

    #[error("block of {length} bytes at {begin} overflows a piece of {piece_length} bytes")]
    BlockOutOfBounds {
        begin: usize,
        length: usize,
        piece_length: usize,
    },

    #[error("invalid bitfield")]
    Bitfield(#[from] BitfieldError),
}

impl MessageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MessageError::Bitfield(e) => e.kind(),
            _ => ErrorKind::Validation,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => Err(value),
        }
    }
}

/// The id byte of a message. Ids this crate does not know about are carried
/// through untouched so that extension messages survive a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Known(MessageId),
    Unknown(u8),
}

impl From<u8> for MessageKind {
    fn from(value: u8) -> Self {
        match MessageId::try_from(value) {
            Ok(id) => MessageKind::Known(id),
            Err(raw) => MessageKind::Unknown(raw),
        }
    }
}

impl From<MessageId> for MessageKind {
    fn from(id: MessageId) -> Self {
        MessageKind::Known(id)
    }
}

impl MessageKind {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageKind::Known(id) => id as u8,
            MessageKind::Unknown(raw) => raw,
        }
    }
}

/// A block of a piece, as carried by `request` and `cancel` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

// All messages is length-prefixed messages
// <length prefix><message ID><payload>, the length prefix is a four bytes big-endian
// integer counting the id byte and the payload.
// https://www.bittorrent.org/beps/bep_0003.html#peer-protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

/// One unit read off a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    KeepAlive,
    Message(Message),
}

impl Message {
    pub fn new(kind: impl Into<MessageKind>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn choke() -> Self {
        Self::new(MessageId::Choke, Vec::new())
    }

    pub fn unchoke() -> Self {
        Self::new(MessageId::Unchoke, Vec::new())
    }

    pub fn interested() -> Self {
        Self::new(MessageId::Interested, Vec::new())
    }

    pub fn not_interested() -> Self {
        Self::new(MessageId::NotInterested, Vec::new())
    }

    pub fn have(piece_index: u32) -> Self {
        Self::new(MessageId::Have, piece_index.to_be_bytes().to_vec())
    }

    pub fn bitfield(bitfield: &Bitfield) -> Self {
        Self::new(MessageId::Bitfield, bitfield.as_bytes().to_vec())
    }

    pub fn request(block: BlockInfo) -> Self {
        Self::new(MessageId::Request, block_payload(block))
    }

    pub fn cancel(block: BlockInfo) -> Self {
        Self::new(MessageId::Cancel, block_payload(block))
    }

    pub fn piece(piece_index: u32, begin: u32, block: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(8 + block.len());
        payload.put_u32(piece_index);
        payload.put_u32(begin);
        payload.extend_from_slice(block);
        Self::new(MessageId::Piece, payload)
    }

    pub fn id(&self) -> Option<MessageId> {
        match self.kind {
            MessageKind::Known(id) => Some(id),
            MessageKind::Unknown(_) => None,
        }
    }

    // the id byte plus the payload
    pub fn message_length(&self) -> usize {
        1 + self.payload.len()
    }

    // Keep-alives are not messages, write KEEP_ALIVE for those.
    pub fn serialize(&self) -> Vec<u8> {
        debug_assert!(u32::try_from(self.message_length()).is_ok());
        let mut buf = Vec::with_capacity(4 + self.message_length());
        buf.put_u32(self.message_length() as u32);
        buf.put_u8(self.kind.as_u8());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn parse_have(&self) -> Result<u32> {
        self.expect_payload(MessageId::Have, 4)?;
        Ok((&self.payload[..]).get_u32())
    }

    pub fn parse_request(&self) -> Result<BlockInfo> {
        self.expect_payload(MessageId::Request, 12)?;
        Ok(parse_block(&self.payload))
    }

    pub fn parse_cancel(&self) -> Result<BlockInfo> {
        self.expect_payload(MessageId::Cancel, 12)?;
        Ok(parse_block(&self.payload))
    }

    pub fn parse_bitfield(&self, piece_count: usize) -> Result<Bitfield> {
        self.expect_kind(MessageId::Bitfield)?;
        Ok(Bitfield::from_payload(self.payload.clone(), piece_count)?)
    }

    /// Copies the block of a `piece` message into `buf`, the buffer of the
    /// piece being downloaded, and returns the number of bytes copied.
    pub fn parse_piece(&self, expected_index: u32, buf: &mut [u8]) -> Result<usize> {
        self.expect_kind(MessageId::Piece)?;
        if self.payload.len() < 8 {
            return Err(MessageError::InvalidPayloadLength {
                id: MessageId::Piece,
                expected: 8,
                actual: self.payload.len(),
            });
        }

        let mut header = &self.payload[..8];
        let piece_index = header.get_u32();
        if piece_index != expected_index {
            return Err(MessageError::PieceIndexMismatch {
                expected: expected_index,
                actual: piece_index,
            });
        }

        let begin = header.get_u32() as usize;
        let data = &self.payload[8..];
        if begin >= buf.len() || data.len() > buf.len() - begin {
            return Err(MessageError::BlockOutOfBounds {
                begin,
                length: data.len(),
                piece_length: buf.len(),
            });
        }
        buf[begin..begin + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn expect_kind(&self, id: MessageId) -> Result<()> {
        if self.kind != MessageKind::Known(id) {
            return Err(MessageError::UnexpectedKind {
                expected: id,
                actual: self.kind,
            });
        }
        Ok(())
    }

    fn expect_payload(&self, id: MessageId, payload_length: usize) -> Result<()> {
        self.expect_kind(id)?;
        if self.payload.len() != payload_length {
            return Err(MessageError::InvalidPayloadLength {
                id,
                expected: payload_length,
                actual: self.payload.len(),
            });
        }
        Ok(())
    }
}

fn block_payload(block: BlockInfo) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(12);
    buffer.put_u32(block.piece_index);
    buffer.put_u32(block.begin);
    buffer.put_u32(block.length);
    buffer
}

fn parse_block(mut payload: &[u8]) -> BlockInfo {
    BlockInfo {
        piece_index: payload.get_u32(),
        begin: payload.get_u32(),
        length: payload.get_u32(),
    }
}

fn check_length(length: usize, max_length: usize) -> io::Result<()> {
    if length > max_length {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message length {length} exceeds {max_length}"),
        ));
    }
    Ok(())
}

/// Reads one frame, consuming exactly the length prefix and the bytes it
/// announces. A zero length prefix yields [`Frame::KeepAlive`]; a stream
/// that ends anywhere inside a frame is an `UnexpectedEof` error.
///
/// A length prefix above [`MAX_MESSAGE_LENGTH`] is refused with
/// `InvalidData` without reading the frame body; [`read_message_with_limit`]
/// takes another cap.
pub async fn read_message<R>(stream: &mut R) -> io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    read_message_with_limit(stream, MAX_MESSAGE_LENGTH).await
}

pub async fn read_message_with_limit<R>(stream: &mut R, max_length: usize) -> io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let length = stream.read_u32().await? as usize;
    if length == 0 {
        trace!("received keep-alive");
        return Ok(Frame::KeepAlive);
    }
    check_length(length, max_length)?;

    // id and payload are read in one go and split locally.
    let mut buf = vec![0u8; length];
    stream.read_exact(&mut buf).await?;
    let payload = buf.split_off(1);
    let message = Message {
        kind: MessageKind::from(buf[0]),
        payload,
    };
    trace!(
        "received {:?} with {} payload bytes",
        message.kind,
        message.payload.len()
    );
    Ok(Frame::Message(message))
}

pub async fn write_message<W>(stream: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    trace!(
        "sending {:?} with {} payload bytes",
        message.kind,
        message.payload.len()
    );
    stream.write_all(&message.serialize()).await?;
    stream.flush().await
}

pub async fn write_keep_alive<W>(stream: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    trace!("sending keep-alive");
    stream.write_all(&KEEP_ALIVE).await?;
    stream.flush().await
}

pub struct MessageCodec {
    max_length: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_MESSAGE_LENGTH)
    }

    // Caps frames in both directions; never above u32::MAX, the widest
    // length prefix there is.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: max_length.min(u32::MAX as usize),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Frame> for MessageCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        item: Frame,
        dst: &mut BytesMut,
    ) -> std::result::Result<(), Self::Error> {
        match item {
            Frame::KeepAlive => dst.extend_from_slice(&KEEP_ALIVE),
            Frame::Message(message) => {
                check_length(message.message_length(), self.max_length)?;
                dst.reserve(4 + message.message_length());
                dst.put_u32(message.message_length() as u32);
                dst.put_u8(message.kind.as_u8());
                dst.extend_from_slice(&message.payload);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Error = io::Error;
    type Item = Frame;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None); // Not enough data for a length prefix
        }

        // length include the message ID and payload
        let length = (&src[..4]).get_u32() as usize;
        check_length(length, self.max_length)?;
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None); // Not enough data for the full message
        }
        src.advance(4);

        if length == 0 {
            return Ok(Some(Frame::KeepAlive));
        }
        let kind = MessageKind::from(src.get_u8());
        let payload = src.split_to(length - 1).to_vec();
        Ok(Some(Frame::Message(Message { kind, payload })))
    }
}
