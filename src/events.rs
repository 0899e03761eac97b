//! Events emitted while nodes play tracks.
//!
//! The dispatcher turns the frames of a node into these events and hands
//! them to an [`EventSink`]. Tracks in events are decoded, and matched to
//! the track the player is currently playing when possible.
//!
//! # Example
//!
//! ```rust
//! use lavaclient::events::Event;
//!
//! fn handle_event(event: &Event) {
//!     match event {
//!         Event::TrackStart { track, .. } => println!("now playing {track}"),
//!         Event::TrackStuck { threshold, .. } => println!("stuck for {threshold:?}"),
//!         // ... handle other events ...
//!         _ => {}
//!     }
//! }
//! ```

use std::{fmt, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    protocol::messages::{EndReason, Exception, Segment},
    query::Source,
    track::Track,
};

/// Events of a node and the players on it.
///
/// Every event names the node it came from. Player events also carry the
/// guild of the player.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// The node accepted the connection and assigned a session.
    NodeReady {
        node: String,
        session_id: String,
        resumed: bool,
    },

    /// A track started playing.
    ///
    /// `source` is the source of the query the track was loaded from.
    TrackStart {
        node: String,
        guild_id: u64,
        track: Track,
        source: Source,
    },

    TrackEnd {
        node: String,
        guild_id: u64,
        track: Track,
        reason: EndReason,
    },

    /// Playing a track failed.
    TrackException {
        node: String,
        guild_id: u64,
        track: Track,
        exception: Exception,
    },

    /// A track did not provide audio for longer than `threshold`.
    TrackStuck {
        node: String,
        guild_id: u64,
        track: Track,
        threshold: Duration,
    },

    /// The voice connection of a player was closed.
    WebSocketClosed {
        node: String,
        guild_id: u64,
        code: u16,
        reason: String,
        by_remote: bool,
    },

    /// Skippable segments of the current track were loaded.
    SegmentsLoaded {
        node: String,
        guild_id: u64,
        segments: Vec<Segment>,
    },

    SegmentSkipped {
        node: String,
        guild_id: u64,
        segment: Segment,
    },
}

impl Event {
    /// Identifier of the node the event came from.
    #[must_use]
    pub fn node(&self) -> &str {
        match self {
            Self::NodeReady { node, .. }
            | Self::TrackStart { node, .. }
            | Self::TrackEnd { node, .. }
            | Self::TrackException { node, .. }
            | Self::TrackStuck { node, .. }
            | Self::WebSocketClosed { node, .. }
            | Self::SegmentsLoaded { node, .. }
            | Self::SegmentSkipped { node, .. } => node,
        }
    }

    /// Guild of the player the event is about, if any.
    #[must_use]
    pub fn guild_id(&self) -> Option<u64> {
        match self {
            Self::NodeReady { .. } => None,
            Self::TrackStart { guild_id, .. }
            | Self::TrackEnd { guild_id, .. }
            | Self::TrackException { guild_id, .. }
            | Self::TrackStuck { guild_id, .. }
            | Self::WebSocketClosed { guild_id, .. }
            | Self::SegmentsLoaded { guild_id, .. }
            | Self::SegmentSkipped { guild_id, .. } => Some(*guild_id),
        }
    }

    /// The track the event is about, if any.
    #[must_use]
    pub fn track(&self) -> Option<&Track> {
        match self {
            Self::TrackStart { track, .. }
            | Self::TrackEnd { track, .. }
            | Self::TrackException { track, .. }
            | Self::TrackStuck { track, .. } => Some(track),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeReady {
                node,
                session_id,
                resumed,
            } => write!(
                f,
                "node {node} ready with session {session_id} (resumed: {resumed})"
            ),
            Self::TrackStart {
                guild_id,
                track,
                source,
                ..
            } => write!(f, "guild {guild_id} started {track} from {source}"),
            Self::TrackEnd {
                guild_id,
                track,
                reason,
                ..
            } => write!(f, "guild {guild_id} ended {track}: {reason:?}"),
            Self::TrackException {
                guild_id,
                track,
                exception,
                ..
            } => write!(
                f,
                "guild {guild_id} failed {track}: {}",
                exception.message.as_deref().unwrap_or(&exception.cause)
            ),
            Self::TrackStuck {
                guild_id,
                track,
                threshold,
                ..
            } => write!(f, "guild {guild_id} stuck on {track} for {threshold:?}"),
            Self::WebSocketClosed {
                guild_id,
                code,
                reason,
                ..
            } => write!(f, "guild {guild_id} voice closed with code {code}: {reason}"),
            Self::SegmentsLoaded {
                guild_id, segments, ..
            } => write!(f, "guild {guild_id} loaded {} segments", segments.len()),
            Self::SegmentSkipped {
                guild_id, segment, ..
            } => write!(f, "guild {guild_id} skipped {} segment", segment.category),
        }
    }
}

/// Receives the events of nodes.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

#[async_trait]
impl EventSink for mpsc::UnboundedSender<Event> {
    async fn emit(&self, event: Event) {
        if let Err(e) = self.send(event) {
            debug!("dropping event: receiver closed: {}", e.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channels_receive_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.emit(Event::WebSocketClosed {
            node: "main".to_owned(),
            guild_id: 42,
            code: 4006,
            reason: "Session is no longer valid.".to_owned(),
            by_remote: true,
        })
        .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.node(), "main");
        assert_eq!(event.guild_id(), Some(42));
        assert!(event.track().is_none());
        assert_eq!(
            event.to_string(),
            "guild 42 voice closed with code 4006: Session is no longer valid."
        );
    }

    #[tokio::test]
    async fn closed_channels_drop_events() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        tx.emit(Event::NodeReady {
            node: "main".to_owned(),
            session_id: "abc".to_owned(),
            resumed: false,
        })
        .await;
    }
}
