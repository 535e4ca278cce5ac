use std::net::IpAddr;

use log::{debug, warn};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_encode};
use reqwest::Client;
use thiserror::Error;
use url::Url;

use crate::{
    error::ErrorKind,
    peer::{PeerAddress, PeerListError, decode_compact},
    types::{PeerId, Sha1Hash},
};

pub(crate) type Result<T> = std::result::Result<T, TrackerError>;

// Everything except the RFC 3986 unreserved characters is escaped, which keeps
// raw hash bytes intact through the tracker's query decoding.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'.');

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Http request failed")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse tracker response")]
    Bencode(#[from] serde_bencode::Error),

    #[error("tracker response has no `{0}`")]
    MissingField(&'static str),

    #[error("tracker refused the announce: {0}")]
    Failure(String),

    #[error("invalid peer list")]
    PeerList(#[from] PeerListError),
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::Http(_) => ErrorKind::Io,
            TrackerError::Bencode(_) | TrackerError::MissingField(_) => ErrorKind::Parse,
            TrackerError::Failure(_) => ErrorKind::Validation,
            TrackerError::PeerList(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    fn as_str(self) -> &'static str {
        match self {
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }
}

// https://bittorrent.org/beps/bep_0003.html#trackers
#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    // If true, the peers are returned in compact format
    // https://www.bittorrent.org/beps/bep_0023.html
    pub compact: bool,
    pub event: Option<TrackerEvent>,
}

impl AnnounceParams {
    /// Parameters of a download that has not transferred anything yet.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId, port: u16, left: u64) -> Self {
        Self {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left,
            compact: true,
            event: None,
        }
    }

    /// Appends the announce query to `announce`, after any query it already has.
    pub fn to_url(&self, announce: &Url) -> Url {
        let mut query = announce
            .query()
            .map(|query| format!("{query}&"))
            .unwrap_or_default();

        query.push_str(&format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&compact={}&left={}",
            percent_encode(&self.info_hash, URL_ENCODE_RESERVED),
            percent_encode(&self.peer_id, URL_ENCODE_RESERVED),
            self.port,
            self.uploaded,
            self.downloaded,
            self.compact as u8,
            self.left,
        ));
        if let Some(event) = self.event {
            query.push_str(&format!("&event={}", event.as_str()));
        }

        let mut url = announce.clone();
        url.set_query(Some(&query));
        url
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Seconds to wait before the next regular announce.
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    pub warning: Option<String>,
    pub peers: Vec<PeerAddress>,
}

mod raw {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct Response {
        #[serde(rename = "failure reason", default)]
        pub failure_reason: Option<String>,
        #[serde(rename = "warning message", default)]
        pub warning_message: Option<String>,
        #[serde(default)]
        pub interval: Option<u64>,
        #[serde(rename = "min interval", default)]
        pub min_interval: Option<u64>,
        #[serde(default)]
        pub complete: Option<u64>,
        #[serde(default)]
        pub incomplete: Option<u64>,
        #[serde(default)]
        pub peers: Option<Peers>,
    }

    #[derive(Debug, Deserialize)]
    pub struct PeerItem {
        pub ip: String,
        pub port: u16,
    }

    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    pub enum Peers {
        List(Vec<PeerItem>),
        #[serde(with = "serde_bytes")]
        Compact(Vec<u8>),
    }
}

impl Response {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: raw::Response = serde_bencode::from_bytes(bytes)?;
        if let Some(reason) = raw.failure_reason {
            warn!("tracker failure: {reason}");
            return Err(TrackerError::Failure(reason));
        }
        if let Some(warning) = &raw.warning_message {
            warn!("tracker warning: {warning}");
        }

        let interval = raw.interval.ok_or(TrackerError::MissingField("interval"))?;
        let peers = match raw.peers.ok_or(TrackerError::MissingField("peers"))? {
            raw::Peers::Compact(bytes) => decode_compact(&bytes)?,
            raw::Peers::List(items) => items
                .into_iter()
                .filter_map(|item| match item.ip.parse::<IpAddr>() {
                    Ok(IpAddr::V4(ip)) => Some(PeerAddress::new(ip, item.port)),
                    _ => {
                        debug!("skipping non-IPv4 peer {}", item.ip);
                        None
                    }
                })
                .collect(),
        };

        Ok(Self {
            interval,
            min_interval: raw.min_interval,
            complete: raw.complete,
            incomplete: raw.incomplete,
            warning: raw.warning_message,
            peers,
        })
    }
}

// Use to request peers from the tracker from the metainfo announce
pub struct Tracker {
    client: Client,
    url: Url,
}

impl Tracker {
    pub fn new(url: Url) -> Self {
        Self::with_client(Client::new(), url)
    }

    /// Timeouts and proxies are configured on the client by the caller.
    pub fn with_client(client: Client, url: Url) -> Self {
        Self { client, url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn announce(&self, params: &AnnounceParams) -> Result<Response> {
        debug!("announcing to {} ({} bytes left)", self.url, params.left);
        let body = self
            .client
            .get(params.to_url(&self.url))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let response = Response::from_bytes(&body)?;
        debug!(
            "tracker returned {} peers, next announce in {}s",
            response.peers.len(),
            response.interval
        );
        Ok(response)
    }
}
