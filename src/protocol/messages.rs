//! JSON frames received from a node over the WebSocket.
//!
//! Every frame carries an `op` field. `event` frames additionally carry a
//! `type` field that selects the payload. Both are parsed into exhaustive
//! enums, so that adding an op or event type fails to build until it is
//! handled everywhere.
//!
//! Payloads accept both the current (v4) and the previous (v3) field names
//! and spellings where they differ.

use std::{fmt, str::FromStr};

use serde::Deserialize;
use serde_with::{serde_as, DeserializeFromStr, DisplayFromStr, PickFirst};

use crate::error::Error;

/// Top-level operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Ready,
    PlayerUpdate,
    Stats,
    Event,
}

impl Op {
    const READY: &'static str = "ready";
    const PLAYER_UPDATE: &'static str = "playerUpdate";
    const STATS: &'static str = "stats";
    const EVENT: &'static str = "event";
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "{}", Self::READY),
            Self::PlayerUpdate => write!(f, "{}", Self::PLAYER_UPDATE),
            Self::Stats => write!(f, "{}", Self::STATS),
            Self::Event => write!(f, "{}", Self::EVENT),
        }
    }
}

impl FromStr for Op {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            Self::READY => Ok(Self::Ready),
            Self::PLAYER_UPDATE => Ok(Self::PlayerUpdate),
            Self::STATS => Ok(Self::Stats),
            Self::EVENT => Ok(Self::Event),
            _ => Err(Error::unimplemented(format!("op {s}"))),
        }
    }
}

/// Event types carried by `event` frames.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    TrackStart,
    TrackEnd,
    TrackException,
    TrackStuck,
    WebSocketClosed,
    SegmentsLoaded,
    SegmentSkipped,
}

impl EventType {
    const TRACK_START: &'static str = "TrackStartEvent";
    const TRACK_END: &'static str = "TrackEndEvent";
    const TRACK_EXCEPTION: &'static str = "TrackExceptionEvent";
    const TRACK_STUCK: &'static str = "TrackStuckEvent";
    const WEBSOCKET_CLOSED: &'static str = "WebSocketClosedEvent";
    const SEGMENTS_LOADED: &'static str = "SegmentsLoaded";
    const SEGMENT_SKIPPED: &'static str = "SegmentSkipped";
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TrackStart => Self::TRACK_START,
            Self::TrackEnd => Self::TRACK_END,
            Self::TrackException => Self::TRACK_EXCEPTION,
            Self::TrackStuck => Self::TRACK_STUCK,
            Self::WebSocketClosed => Self::WEBSOCKET_CLOSED,
            Self::SegmentsLoaded => Self::SEGMENTS_LOADED,
            Self::SegmentSkipped => Self::SEGMENT_SKIPPED,
        };
        f.write_str(name)
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The SponsorBlock plugin has sent its event types with and without
        // the `Event` suffix.
        let sponsorblock = s.strip_suffix("Event").unwrap_or(s);

        match (s, sponsorblock) {
            (Self::TRACK_START, _) => Ok(Self::TrackStart),
            (Self::TRACK_END, _) => Ok(Self::TrackEnd),
            (Self::TRACK_EXCEPTION, _) => Ok(Self::TrackException),
            (Self::TRACK_STUCK, _) => Ok(Self::TrackStuck),
            (Self::WEBSOCKET_CLOSED, _) => Ok(Self::WebSocketClosed),
            (_, Self::SEGMENTS_LOADED) => Ok(Self::SegmentsLoaded),
            (_, Self::SEGMENT_SKIPPED) => Ok(Self::SegmentSkipped),
            _ => Err(Error::unimplemented(format!("event type {s}"))),
        }
    }
}

/// The fields every frame is dispatched on.
#[derive(Clone, Debug, Deserialize)]
pub struct Header {
    pub op: String,

    #[serde(rename = "type")]
    pub event_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    #[serde(default)]
    pub resumed: bool,
    pub session_id: String,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    #[serde_as(as = "DisplayFromStr")]
    pub guild_id: u64,
    pub state: PlayerState,
}

/// Player state as seen by the node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlayerState {
    /// Node time in milliseconds since the epoch.
    pub time: u64,

    /// Playback position in milliseconds.
    pub position: u64,

    /// Whether the node is connected to the voice gateway.
    pub connected: bool,

    /// Voice gateway round trip in milliseconds, or -1 when not connected.
    pub ping: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Stats {
    pub players: u32,
    pub playing_players: u32,

    /// Milliseconds since the node started.
    pub uptime: u64,
    pub memory: Memory,
    pub cpu: Cpu,
    pub frame_stats: Option<FrameStats>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Memory {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Cpu {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

/// Audio frames over the last minute.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

/// A track embedded in an event.
///
/// v4 nodes send the full track object, v3 nodes only the encoded string.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TrackPayload {
    Encoded(String),
    Object { encoded: String },
}

impl TrackPayload {
    #[must_use]
    pub fn encoded(&self) -> &str {
        match self {
            Self::Encoded(encoded) | Self::Object { encoded } => encoded,
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStart {
    #[serde_as(as = "DisplayFromStr")]
    pub guild_id: u64,
    #[serde(alias = "encodedTrack")]
    pub track: TrackPayload,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, DeserializeFromStr)]
pub enum EndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl EndReason {
    /// Whether the player may continue with the next track.
    #[must_use]
    pub fn may_start_next(self) -> bool {
        matches!(self, Self::Finished | Self::LoadFailed)
    }
}

impl FromStr for EndReason {
    type Err = Error;

    /// Parses both the v4 (`loadFailed`) and v3 (`LOAD_FAILED`) spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|chr| *chr != '_')
            .map(|chr| chr.to_ascii_lowercase())
            .collect();

        match normalized.as_str() {
            "finished" => Ok(Self::Finished),
            "loadfailed" => Ok(Self::LoadFailed),
            "stopped" => Ok(Self::Stopped),
            "replaced" => Ok(Self::Replaced),
            "cleanup" => Ok(Self::Cleanup),
            _ => Err(Error::invalid_argument(format!("end reason {s}"))),
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEnd {
    #[serde_as(as = "DisplayFromStr")]
    pub guild_id: u64,
    #[serde(alias = "encodedTrack")]
    pub track: TrackPayload,
    pub reason: EndReason,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, DeserializeFromStr)]
pub enum Severity {
    Common,
    Suspicious,
    Fault,
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "common" => Ok(Self::Common),
            "suspicious" => Ok(Self::Suspicious),
            "fault" => Ok(Self::Fault),
            _ => Err(Error::invalid_argument(format!("severity {s}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Exception {
    pub message: Option<String>,
    pub severity: Severity,
    #[serde(default)]
    pub cause: String,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    #[serde_as(as = "DisplayFromStr")]
    pub guild_id: u64,
    #[serde(alias = "encodedTrack")]
    pub track: TrackPayload,
    pub exception: Exception,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStuck {
    #[serde_as(as = "DisplayFromStr")]
    pub guild_id: u64,
    #[serde(alias = "encodedTrack")]
    pub track: TrackPayload,
    pub threshold_ms: u64,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketClosed {
    #[serde_as(as = "DisplayFromStr")]
    pub guild_id: u64,
    pub code: u16,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub by_remote: bool,
}

/// A sponsored or otherwise skippable part of a track.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Segment {
    pub category: String,

    /// Start in milliseconds.
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub start: u64,

    /// End in milliseconds.
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub end: u64,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentsLoaded {
    #[serde_as(as = "DisplayFromStr")]
    pub guild_id: u64,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSkipped {
    #[serde_as(as = "DisplayFromStr")]
    pub guild_id: u64,
    pub segment: Segment,
}
