pub type Sha1Hash = [u8; 20];

pub type PeerId = [u8; 20];

// Port a client listens on unless told otherwise, the first of the
// 6881-6889 range suggested by the protocol document.
pub const DEFAULT_PORT: u16 = 6881;

// Block size 16KB is recommend by document
// https://www.bittorrent.org/beps/bep_0003.html#peer-messages
pub const BLOCK_SIZE: u32 = 16 * 1024;
