use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use bytes::Buf;
use thiserror::Error;

use crate::error::ErrorKind;

pub(crate) type Result<T> = std::result::Result<T, PeerListError>;

// in compact format, each peer is represented by 6 bytes:
// 4 bytes for the IPv4 address and 2 bytes for the port number
// https://www.bittorrent.org/beps/bep_0023.html
pub const COMPACT_PEER_LEN: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerListError {
    #[error("invalid compact peer list length {0}")]
    InvalidLength(usize),
}

impl PeerListError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl From<PeerAddress> for SocketAddrV4 {
    fn from(peer: PeerAddress) -> Self {
        SocketAddrV4::new(peer.ip, peer.port)
    }
}

impl From<PeerAddress> for SocketAddr {
    fn from(peer: PeerAddress) -> Self {
        SocketAddr::V4(peer.into())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Decodes a compact peer list in input order, duplicates included.
pub fn decode_compact(bytes: &[u8]) -> Result<Vec<PeerAddress>> {
    if bytes.len() % COMPACT_PEER_LEN != 0 {
        return Err(PeerListError::InvalidLength(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|mut chunk| {
            let ip = Ipv4Addr::from(chunk.get_u32());
            let port = chunk.get_u16();
            PeerAddress::new(ip, port)
        })
        .collect())
}
