/// Coarse classification shared by the error enums of every module.
///
/// An `Io` failure ends one peer connection and nothing else. A `Parse`
/// failure aborts loading a torrent before any network activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A read or write on a stream failed or came up short.
    Io,
    /// Malformed bencoding or a missing required field.
    Parse,
    /// Well-formed data that makes no sense, like a peer list of 7 bytes.
    Validation,
    /// The peer completed a handshake for another protocol or torrent.
    ProtocolMismatch,
}
