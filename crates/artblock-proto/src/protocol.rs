use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Requests sent to the daemon.  Controllers (popup-style UIs, `abctl`) use
/// the blacklist actions; player clients use `RegisterPlayer` / `UpdatePlayer`
/// to announce themselves and then answer `GetCurrentArtist` / `SkipTrack`
/// requests the daemon forwards to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Action {
    /// Is this artist on an enabled blacklist?
    CheckArtist { artist: String },
    /// Add the artist to the local blacklist and report it to the backend.
    BlockArtist { artist: String },
    /// Fetch the community blacklist from the backend right now.
    SyncCommunity,
    GetSettings,
    SetSettings {
        community_enabled: bool,
        local_enabled: bool,
    },
    /// Forwarded to the selected player; answered with `Reply::NowPlaying`.
    GetCurrentArtist,
    /// Forwarded to the selected player; answered with `Reply::Ack`.
    SkipTrack,
    /// Announce this connection as a player tab showing `url` in `window`.
    RegisterPlayer { url: String, window: u64 },
    /// Refresh the volatile state of a registered player.  `url` is sent when
    /// the tab navigated since registration.
    UpdatePlayer {
        audible: bool,
        active: bool,
        window_focused: bool,
        #[serde(default)]
        url: Option<String>,
    },
}

/// Which list produced a positive membership check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListSource {
    Local,
    Community,
}

/// Machine-readable error category carried by `Reply::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    /// No player tab is available to handle a forwarded request.
    NotConnected,
    /// The request carried an action this daemon does not understand.
    UnknownAction,
    Internal,
}

/// Replies sent back for each request, matched to it by frame id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Reply {
    Check {
        blocked: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ListSource>,
    },
    Ack {
        success: bool,
    },
    Sync {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<u64>,
    },
    Settings {
        community_enabled: bool,
        local_enabled: bool,
        #[serde(default)]
        last_sync: Option<i64>,
        local_blacklist: Vec<String>,
        community_blacklist: Vec<String>,
    },
    /// `artist` is `null` when no supported player tab is open or nothing is
    /// playing.
    NowPlaying {
        #[serde(default)]
        artist: Option<String>,
        #[serde(default)]
        track: Option<String>,
    },
    Registered {
        player: u64,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Events pushed by the daemon without a matching request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Event {
    /// Sent immediately on connect: daemon version + state summary.
    Hello {
        protocol_version: u32,
        state: StateSummary,
    },
    /// Sent to every connected client after a mutation changed the store.
    StateUpdated { state: StateSummary },
}

/// Counts-only snapshot of the blacklist store, cheap enough to push to every
/// client on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSummary {
    pub local_count: usize,
    pub community_count: usize,
    pub community_enabled: bool,
    pub local_enabled: bool,
    /// Unix epoch milliseconds of the last successful community sync.
    #[serde(default)]
    pub last_sync: Option<i64>,
}

/// A request on the wire: correlation id plus the action, flattened into one
/// JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    #[serde(flatten)]
    pub action: Action,
}

/// A reply on the wire, carrying the id of the request it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: u64,
    #[serde(flatten)]
    pub reply: Reply,
}

/// Wrapper for outbound socket traffic.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
    Request(RequestFrame),
    Reply(ReplyFrame),
    Event(Event),
}

impl Outgoing {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }
}

/// An inbound frame, classified by its tag key.  A well-formed JSON object
/// that fits none of the known shapes becomes `Unknown` so the receiver can
/// answer it with an `unknownAction` error instead of dropping the
/// connection.
#[derive(Debug, Clone)]
pub enum Incoming {
    Request(RequestFrame),
    Reply(ReplyFrame),
    Event(Event),
    Unknown { id: Option<u64> },
}

impl Incoming {
    /// Decode one length-prefixed frame from the front of `data`.  Returns the
    /// frame and the number of bytes consumed.  `FrameError::Incomplete` means
    /// wait for more bytes; `FrameError::Malformed` means the peer is not
    /// speaking this protocol.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < 4 {
            return Err(FrameError::Incomplete);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            return Err(FrameError::Incomplete);
        }
        let value: Value = serde_json::from_slice(&data[4..4 + len])?;
        Ok((Self::classify(value), 4 + len))
    }

    fn classify(value: Value) -> Self {
        let id = value.get("id").and_then(Value::as_u64);
        if value.get("action").is_some() {
            match serde_json::from_value::<RequestFrame>(value) {
                Ok(frame) => Incoming::Request(frame),
                Err(_) => Incoming::Unknown { id },
            }
        } else if value.get("reply").is_some() {
            match serde_json::from_value::<ReplyFrame>(value) {
                Ok(frame) => Incoming::Reply(frame),
                Err(_) => Incoming::Unknown { id },
            }
        } else if value.get("event").is_some() {
            match serde_json::from_value::<Event>(value) {
                Ok(event) => Incoming::Event(event),
                Err(_) => Incoming::Unknown { id },
            }
        } else {
            Incoming::Unknown { id }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("insufficient data for a complete frame")]
    Incomplete,
    #[error("malformed frame payload: {0}")]
    Malformed(#[from] serde_json::Error),
}
