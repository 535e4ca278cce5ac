//! Byte-exact codecs for the BitTorrent peer wire protocol and its tracker.
//!
//! https://www.bittorrent.org/beps/bep_0003.html

pub mod bitfield;
pub mod error;
pub mod handshake;
mod hash;
pub mod message;
pub mod metainfo;
pub mod peer;
pub mod tracker;
pub mod types;

pub use bitfield::{Bitfield, BitfieldError};
pub use error::ErrorKind;
pub use handshake::{
    Handshake, HandshakeCodec, HandshakeError, PROTOCOL_STRING, exchange_handshake,
    read_handshake, write_handshake,
};
pub use message::{
    BlockInfo, Frame, KEEP_ALIVE, MAX_MESSAGE_LENGTH, Message, MessageCodec, MessageError,
    MessageId, MessageKind, read_message, read_message_with_limit, write_keep_alive,
    write_message,
};
pub use metainfo::{MetaInfo, MetaInfoError};
pub use peer::{PeerAddress, PeerListError, decode_compact};
pub use tracker::{AnnounceParams, Tracker, TrackerError, TrackerEvent};
pub use types::{BLOCK_SIZE, DEFAULT_PORT, PeerId, Sha1Hash};
