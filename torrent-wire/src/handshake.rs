use std::io;

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::ErrorKind,
    types::{PeerId, Sha1Hash},
};

pub(crate) type Result<T> = std::result::Result<T, HandshakeError>;

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

const RESERVED: [u8; 8] = [0; 8];

// reserved bytes + info hash + peer id
const FIXED_LENGTH: usize = 8 + 20 + 20;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake transport failed")]
    Io(#[from] io::Error),

    #[error("protocol string of {0} bytes does not fit in a handshake")]
    ProtocolTooLong(usize),

    #[error("peer speaks {:?}", String::from_utf8_lossy(.0))]
    UnexpectedProtocol(Vec<u8>),

    #[error("peer handshake is for another torrent")]
    InfoHashMismatch {
        expected: Sha1Hash,
        actual: Sha1Hash,
    },
}

impl HandshakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandshakeError::Io(_) => ErrorKind::Io,
            HandshakeError::ProtocolTooLong(_) => ErrorKind::Validation,
            HandshakeError::UnexpectedProtocol(_) | HandshakeError::InfoHashMismatch { .. } => {
                ErrorKind::ProtocolMismatch
            }
        }
    }
}

// <pstrlen><pstr><reserved><info_hash><peer_id>
// https://www.bittorrent.org/beps/bep_0003.html#peer-protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pstr: Vec<u8>,
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self {
            pstr: PROTOCOL_STRING.to_vec(),
            info_hash,
            peer_id,
        }
    }

    pub fn with_protocol(
        pstr: impl Into<Vec<u8>>,
        info_hash: Sha1Hash,
        peer_id: PeerId,
    ) -> Result<Self> {
        let pstr = pstr.into();
        if pstr.len() > u8::MAX as usize {
            return Err(HandshakeError::ProtocolTooLong(pstr.len()));
        }
        Ok(Self {
            pstr,
            info_hash,
            peer_id,
        })
    }

    pub fn protocol(&self) -> &[u8] {
        &self.pstr
    }

    pub fn wire_length(&self) -> usize {
        1 + self.pstr.len() + FIXED_LENGTH
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_length());
        self.put(&mut buf);
        buf
    }

    /// Checks a received handshake against the torrent we are serving. Either
    /// mismatch means the peer should be dropped, not that the transport failed.
    pub fn verify(&self, expected_info_hash: &Sha1Hash) -> Result<()> {
        if self.pstr != PROTOCOL_STRING {
            warn!(
                "peer announced protocol {:?}",
                String::from_utf8_lossy(&self.pstr)
            );
            return Err(HandshakeError::UnexpectedProtocol(self.pstr.clone()));
        }
        if &self.info_hash != expected_info_hash {
            warn!("peer handshake carries a foreign info hash");
            return Err(HandshakeError::InfoHashMismatch {
                expected: *expected_info_hash,
                actual: self.info_hash,
            });
        }
        Ok(())
    }

    fn put<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(self.pstr.len() as u8);
        dst.put_slice(&self.pstr);
        dst.put_slice(&RESERVED);
        dst.put_slice(&self.info_hash);
        dst.put_slice(&self.peer_id);
    }

    // `block` holds everything after the length byte.
    fn from_block(block: &[u8], pstr_len: usize) -> Self {
        let mut rest = &block[pstr_len..];
        rest.advance(RESERVED.len()); // reserved bytes are ignored on receive
        let mut info_hash: Sha1Hash = [0; 20];
        rest.copy_to_slice(&mut info_hash);
        let mut peer_id: PeerId = [0; 20];
        rest.copy_to_slice(&mut peer_id);
        Self {
            pstr: block[..pstr_len].to_vec(),
            info_hash,
            peer_id,
        }
    }
}

/// Reads the length byte, then the rest of the handshake in a single read.
pub async fn read_handshake<R>(stream: &mut R) -> io::Result<Handshake>
where
    R: AsyncRead + Unpin,
{
    let pstr_len = stream.read_u8().await? as usize;
    let mut block = vec![0u8; pstr_len + FIXED_LENGTH];
    stream.read_exact(&mut block).await?;
    Ok(Handshake::from_block(&block, pstr_len))
}

pub async fn write_handshake<W>(stream: &mut W, handshake: &Handshake) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&handshake.serialize()).await?;
    stream.flush().await
}

/// Sends our handshake, reads the peer's and checks it is for the same torrent.
pub async fn exchange_handshake<S>(stream: &mut S, ours: &Handshake) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_handshake(stream, ours).await?;
    let theirs = read_handshake(stream).await?;
    theirs.verify(&ours.info_hash)?;
    debug!(
        "handshake complete with peer {:?}",
        String::from_utf8_lossy(&theirs.peer_id)
    );
    Ok(theirs)
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        item: Handshake,
        dst: &mut BytesMut,
    ) -> std::result::Result<(), Self::Error> {
        dst.reserve(item.wire_length());
        item.put(dst);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Error = io::Error;
    type Item = Handshake;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        let Some(&pstr_len) = src.first() else {
            return Ok(None);
        };
        let pstr_len = pstr_len as usize;
        if src.len() < 1 + pstr_len + FIXED_LENGTH {
            return Ok(None); // Not enough data for a full handshake
        }

        src.advance(1);
        let block = src.split_to(pstr_len + FIXED_LENGTH);
        Ok(Some(Handshake::from_block(&block, pstr_len)))
    }
}
