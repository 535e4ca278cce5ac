use std::{fmt, ops::Range};

use log::debug;
use thiserror::Error;
use url::Url;

use crate::{
    error::ErrorKind,
    hash::calculate_sha1_hash,
    tracker::AnnounceParams,
    types::{PeerId, Sha1Hash},
};

pub(crate) type Result<T> = std::result::Result<T, MetaInfoError>;

const PIECE_HASH_LEN: usize = 20;

#[derive(Error, Debug)]
pub enum MetaInfoError {
    #[error("Failed to parse .torrent file")]
    Bencode(#[from] serde_bencode::Error),

    #[error("Failed to parse URL")]
    InvalidAnnounce(#[from] url::ParseError),

    #[error("info dictionary has neither `length` nor `files`")]
    MissingLength,

    #[error("pieces string of {0} bytes is not a multiple of 20")]
    InvalidPieces(usize),

    #[error("piece length must be positive")]
    InvalidPieceLength,

    #[error("total length of the files overflows")]
    LengthOverflow,

    #[error("torrent has no piece {0}")]
    InvalidPieceIndex(usize),

    #[error("piece {0} does not match its hash")]
    PieceHashMismatch(usize),
}

impl MetaInfoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetaInfoError::Bencode(_)
            | MetaInfoError::InvalidAnnounce(_)
            | MetaInfoError::MissingLength => ErrorKind::Parse,
            MetaInfoError::InvalidPieces(_)
            | MetaInfoError::InvalidPieceLength
            | MetaInfoError::LengthOverflow
            | MetaInfoError::InvalidPieceIndex(_)
            | MetaInfoError::PieceHashMismatch(_) => ErrorKind::Validation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub length: u64,
    pub path: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MetaInfo {
    pub announce: Url,
    pub info_hash: Sha1Hash,
    pub piece_hashes: Vec<Sha1Hash>,
    pub piece_length: u64,
    /// Total length of all files, in bytes.
    pub length: u64,
    pub name: String,
    pub files: Vec<FileInfo>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
}

impl MetaInfo {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        raw::MetaInfo::from_bytes(bytes)?.to_metainfo()
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    // Byte range of the piece within the concatenated files, the last piece
    // is cut short at the end of the data.
    pub fn piece_bounds(&self, index: usize) -> Option<Range<u64>> {
        if index >= self.num_pieces() {
            return None;
        }
        let begin = (index as u64).checked_mul(self.piece_length)?;
        if begin >= self.length {
            return None;
        }
        let end = begin
            .checked_add(self.piece_length)
            .map_or(self.length, |end| end.min(self.length));
        Some(begin..end)
    }

    pub fn piece_size(&self, index: usize) -> Option<u64> {
        self.piece_bounds(index).map(|range| range.end - range.start)
    }

    pub fn verify_piece(&self, index: usize, data: &[u8]) -> Result<()> {
        let expected = self
            .piece_hashes
            .get(index)
            .ok_or(MetaInfoError::InvalidPieceIndex(index))?;
        if &calculate_sha1_hash(data) != expected {
            return Err(MetaInfoError::PieceHashMismatch(index));
        }
        Ok(())
    }

    // Nothing uploaded or downloaded yet, everything left.
    pub fn tracker_url(&self, peer_id: PeerId, port: u16) -> Url {
        AnnounceParams::new(self.info_hash, peer_id, port, self.length).to_url(&self.announce)
    }
}

pub mod raw {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Serialize};
    use serde_bencode::value::Value;

    use super::*;

    // implementation of https://bittorrent.org/beps/bep_0003.html#metainfo-files
    #[derive(Debug, Serialize, Deserialize)]
    pub struct MetaInfo {
        pub announce: String,
        pub info: Info,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub comment: Option<String>,
        #[serde(
            rename = "created by",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        pub created_by: Option<String>,
        #[serde(
            rename = "creation date",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        pub creation_date: Option<i64>,
    }

    #[derive(Serialize, Deserialize, Clone)]
    pub struct Info {
        pub name: String,
        // How many bytes each piece is.
        #[serde(rename = "piece length")]
        pub piece_length: u64,
        // The SHA1 hash of each piece, concatenated together.
        #[serde(with = "serde_bytes")]
        pub pieces: Vec<u8>,
        // If this is a single file torrent, this is the length of the file, in bytes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub length: Option<u64>,
        // If this is a multi-file torrent, this is a list of files.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub files: Option<Vec<File>>,
        // Keys we do not use still take part in the info hash.
        #[serde(flatten)]
        pub extra: BTreeMap<String, Value>,
    }

    #[derive(Debug, Serialize, Deserialize, Clone)]
    pub struct File {
        // The length of the file, in bytes.
        pub length: u64,
        pub path: Vec<String>,
        #[serde(flatten)]
        pub extra: BTreeMap<String, Value>,
    }

    impl MetaInfo {
        pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
            Ok(serde_bencode::from_bytes(bytes)?)
        }

        /// Bencodes the info dictionary again, keys in sorted order as the
        /// format requires, and hashes it.
        pub fn calculate_info_hash(&self) -> Result<Sha1Hash> {
            let info = serde_bencode::to_bytes(&self.info)?;
            Ok(calculate_sha1_hash(&info))
        }

        pub fn to_metainfo(self) -> Result<super::MetaInfo> {
            let info_hash = self.calculate_info_hash()?;
            let announce = Url::parse(&self.announce)?;

            if self.info.pieces.len() % PIECE_HASH_LEN != 0 {
                return Err(MetaInfoError::InvalidPieces(self.info.pieces.len()));
            }
            if self.info.piece_length == 0 {
                return Err(MetaInfoError::InvalidPieceLength);
            }
            let piece_hashes: Vec<Sha1Hash> = self
                .info
                .pieces
                .chunks_exact(PIECE_HASH_LEN)
                .map(|chunk| {
                    let mut hash: Sha1Hash = [0; 20];
                    hash.copy_from_slice(chunk);
                    hash
                })
                .collect();

            let files = match (self.info.length, self.info.files) {
                (Some(length), _) => vec![FileInfo {
                    length,
                    path: vec![self.info.name.clone()],
                }],
                (None, Some(files)) => files
                    .into_iter()
                    .map(|file| FileInfo {
                        length: file.length,
                        path: file.path,
                    })
                    .collect(),
                (None, None) => return Err(MetaInfoError::MissingLength),
            };
            let length = files
                .iter()
                .try_fold(0u64, |total, file| total.checked_add(file.length))
                .ok_or(MetaInfoError::LengthOverflow)?;

            debug!(
                "parsed torrent {:?}: {} bytes in {} files",
                self.info.name,
                length,
                files.len()
            );
            Ok(super::MetaInfo {
                announce,
                info_hash,
                piece_hashes,
                piece_length: self.info.piece_length,
                length,
                name: self.info.name,
                files,
                comment: self.comment,
                created_by: self.created_by,
                creation_date: self.creation_date,
            })
        }
    }

    impl fmt::Debug for Info {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Info")
                .field("name", &self.name)
                .field("piece_length", &self.piece_length)
                .field("pieces", &"<pieces...>")
                .field("length", &self.length)
                .field("files", &self.files)
                .field("extra", &self.extra)
                .finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use percent_encoding::percent_decode_str;

    const ANNOUNCE: &str = "http://tracker.example.com:6969/announce";

    fn single_file_info(pieces: &[u8]) -> Vec<u8> {
        let mut info = b"d6:lengthi40000e4:name8:file.bin12:piece lengthi32768e6:pieces".to_vec();
        info.extend_from_slice(format!("{}:", pieces.len()).as_bytes());
        info.extend_from_slice(pieces);
        info.extend_from_slice(b"7:privatei1ee");
        info
    }

    fn torrent(info: &[u8]) -> Vec<u8> {
        let mut bytes = format!("d8:announce{}:{}7:comment4:test4:info", ANNOUNCE.len(), ANNOUNCE)
            .into_bytes();
        bytes.extend_from_slice(info);
        bytes.push(b'e');
        bytes
    }

    fn forty_piece_bytes() -> Vec<u8> {
        (0..40u8).collect()
    }

    #[test]
    fn test_open_reads_fields() {
        let raw = raw::MetaInfo::from_bytes(&torrent(&single_file_info(&forty_piece_bytes())))
            .unwrap();
        assert_eq!(raw.announce, ANNOUNCE);
        assert_eq!(raw.comment.as_deref(), Some("test"));
        assert_eq!(raw.info.name, "file.bin");
        assert_eq!(raw.info.piece_length, 32768);
        assert_eq!(raw.info.length, Some(40000));
        assert_eq!(raw.info.pieces, forty_piece_bytes());
    }

    #[test]
    fn test_to_metainfo_splits_pieces_and_hashes_info() {
        let info = single_file_info(&forty_piece_bytes());
        let metainfo = MetaInfo::from_bytes(&torrent(&info)).unwrap();

        assert_eq!(metainfo.announce.as_str(), ANNOUNCE);
        assert_eq!(metainfo.num_pieces(), 2);
        assert_eq!(metainfo.piece_hashes[0].to_vec(), (0..20u8).collect::<Vec<_>>());
        assert_eq!(metainfo.piece_hashes[1].to_vec(), (20..40u8).collect::<Vec<_>>());
        assert_eq!(metainfo.piece_length, 32768);
        assert_eq!(metainfo.length, 40000);
        assert_eq!(metainfo.name, "file.bin");
        // `private` is not modelled but must still be hashed.
        assert_eq!(metainfo.info_hash, calculate_sha1_hash(&info));
    }

    #[test]
    fn test_multi_file_torrent() {
        let info = b"d5:filesld6:lengthi10e4:pathl1:aeed6:lengthi5e6:md5sum2:xx4:pathl1:b1:ceee4:name3:dir12:piece lengthi16e6:pieces20:aaaaaaaaaaaaaaaaaaaae";
        let metainfo = MetaInfo::from_bytes(&torrent(info)).unwrap();

        assert_eq!(metainfo.length, 15);
        assert_eq!(
            metainfo.files,
            vec![
                FileInfo {
                    length: 10,
                    path: vec!["a".to_string()]
                },
                FileInfo {
                    length: 5,
                    path: vec!["b".to_string(), "c".to_string()]
                },
            ]
        );
        assert_eq!(metainfo.info_hash, calculate_sha1_hash(info));
    }

    #[test]
    fn test_malformed_input_is_parse_error() {
        let err = MetaInfo::from_bytes(b"d8:announce").unwrap_err();
        assert!(matches!(err, MetaInfoError::Bencode(_)));
        assert_eq!(err.kind(), ErrorKind::Parse);

        // no `info` key at all
        let err = MetaInfo::from_bytes(b"d8:announce3:urle").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);

        let info = b"d4:name1:a12:piece lengthi16e6:pieces20:aaaaaaaaaaaaaaaaaaaae";
        let err = MetaInfo::from_bytes(&torrent(info)).unwrap_err();
        assert!(matches!(err, MetaInfoError::MissingLength));
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn test_pieces_not_multiple_of_20() {
        let info = single_file_info(&[7u8; 39]);
        let err = MetaInfo::from_bytes(&torrent(&info)).unwrap_err();
        assert!(matches!(err, MetaInfoError::InvalidPieces(39)));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_piece_bounds() {
        let metainfo = MetaInfo::from_bytes(&torrent(&single_file_info(&forty_piece_bytes())))
            .unwrap();
        assert_eq!(metainfo.piece_bounds(0), Some(0..32768));
        assert_eq!(metainfo.piece_bounds(1), Some(32768..40000));
        assert_eq!(metainfo.piece_size(1), Some(7232));
        assert_eq!(metainfo.piece_bounds(2), None);
    }

    #[test]
    fn test_file_lengths_overflow() {
        let info = b"d5:filesld6:lengthi9223372036854775807e4:pathl1:aeed6:lengthi9223372036854775807e4:pathl1:beed6:lengthi9223372036854775807e4:pathl1:ceee4:name3:dir12:piece lengthi16e6:pieces20:aaaaaaaaaaaaaaaaaaaae";
        let err = MetaInfo::from_bytes(&torrent(info)).unwrap_err();
        assert!(matches!(err, MetaInfoError::LengthOverflow));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_piece_bounds_near_u64_max() {
        let mut metainfo = MetaInfo::from_bytes(&torrent(&single_file_info(&forty_piece_bytes())))
            .unwrap();
        metainfo.length = u64::MAX;

        metainfo.piece_length = u64::MAX - 1;
        assert_eq!(metainfo.piece_bounds(0), Some(0..u64::MAX - 1));
        assert_eq!(metainfo.piece_bounds(1), Some(u64::MAX - 1..u64::MAX));

        metainfo.piece_length = 1 << 63;
        metainfo.piece_hashes.push([0; 20]);
        assert_eq!(metainfo.piece_bounds(1), Some(1 << 63..u64::MAX));
        assert_eq!(metainfo.piece_bounds(2), None);
    }

    #[test]
    fn test_verify_piece() {
        let data = b"piece data";
        let mut pieces = calculate_sha1_hash(data).to_vec();
        pieces.extend_from_slice(&[0u8; 20]);
        let metainfo = MetaInfo::from_bytes(&torrent(&single_file_info(&pieces))).unwrap();

        assert!(metainfo.verify_piece(0, data).is_ok());
        assert!(matches!(
            metainfo.verify_piece(1, data),
            Err(MetaInfoError::PieceHashMismatch(1))
        ));
        assert!(matches!(
            metainfo.verify_piece(2, data),
            Err(MetaInfoError::InvalidPieceIndex(2))
        ));
    }

    fn query_value<'a>(url: &'a Url, key: &str) -> Option<&'a str> {
        url.query()?
            .split('&')
            .find_map(|pair| pair.strip_prefix(key)?.strip_prefix('='))
    }

    #[test]
    fn test_tracker_url() {
        let mut metainfo =
            MetaInfo::from_bytes(&torrent(&single_file_info(&forty_piece_bytes()))).unwrap();
        let info_hash: Sha1Hash = std::array::from_fn(|i| (i * 13 + 0x7b) as u8);
        metainfo.info_hash = info_hash;
        let peer_id: PeerId = *b"-TW0100-\x00\xff%&= +?#abc";

        let url = metainfo.tracker_url(peer_id, 6881);
        assert_eq!(url.host_str(), Some("tracker.example.com"));
        assert_eq!(url.path(), "/announce");

        let decode = |key: &str| {
            let value = query_value(&url, key).unwrap();
            percent_decode_str(value).collect::<Vec<u8>>()
        };
        assert_eq!(decode("info_hash"), info_hash.to_vec());
        assert_eq!(decode("peer_id"), peer_id.to_vec());
        assert_eq!(query_value(&url, "port"), Some("6881"));
        assert_eq!(query_value(&url, "uploaded"), Some("0"));
        assert_eq!(query_value(&url, "downloaded"), Some("0"));
        assert_eq!(query_value(&url, "left"), Some("40000"));
        assert!(url.query().unwrap().split('&').any(|pair| pair == "compact=1"));
    }
}
