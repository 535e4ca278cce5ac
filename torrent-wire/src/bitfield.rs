use bitvec::{order::Msb0, vec::BitVec};
use thiserror::Error;

use crate::error::ErrorKind;

pub(crate) type Result<T> = std::result::Result<T, BitfieldError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitfieldError {
    #[error("piece index {index} is outside a bitfield of {len} bytes")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("bitfield has {actual} bytes, expected {expected} for {piece_count} pieces")]
    InvalidLength {
        actual: usize,
        expected: usize,
        piece_count: usize,
    },

    #[error("bitfield marks pieces beyond the last piece {piece_count}")]
    SparePieceSet { piece_count: usize },
}

impl BitfieldError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

// Represents which pieces exists for a peer.
// Each bit represents a piece, where 1 means the piece exists and 0 means it does not.
// Using Msb0 order so piece `i` lives in bit `7 - i % 8` of byte `i / 8`,
// which is the layout of the `bitfield` message.
// https://www.bittorrent.org/beps/bep_0003.html#peer-messages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitVec<u8, Msb0>,
}

impl Bitfield {
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, piece_count.div_ceil(8) * 8),
        }
    }

    // Raw bytes as they arrive in a `bitfield` message, unchecked.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bits: BitVec::from_vec(bytes),
        }
    }

    // A `bitfield` payload must be exactly ceil(piece_count / 8) bytes and the
    // padding bits after the last piece must be clear.
    pub fn from_payload(bytes: Vec<u8>, piece_count: usize) -> Result<Self> {
        let expected = piece_count.div_ceil(8);
        if bytes.len() != expected {
            return Err(BitfieldError::InvalidLength {
                actual: bytes.len(),
                expected,
                piece_count,
            });
        }

        let bitfield = Self::from_bytes(bytes);
        if bitfield.bits[piece_count..].any() {
            return Err(BitfieldError::SparePieceSet { piece_count });
        }
        Ok(bitfield)
    }

    pub fn has_piece(&self, index: usize) -> Result<bool> {
        self.check_index(index)?;
        Ok(self.bits[index])
    }

    pub fn set_piece(&mut self, index: usize) -> Result<()> {
        self.check_index(index)?;
        self.bits.set(index, true);
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn len_bytes(&self) -> usize {
        self.bits.as_raw_slice().len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index / 8 >= self.len_bytes() {
            return Err(BitfieldError::IndexOutOfRange {
                index,
                len: self.len_bytes(),
            });
        }
        Ok(())
    }
}
