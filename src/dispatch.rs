//! Dispatching of frames received from a node.
//!
//! Every text frame is parsed on its `op` first:
//!
//! * `ready` stores the session, marks the node ready and configures
//!   resuming once per node
//! * `stats` stores the load of the node
//! * `playerUpdate` forwards the player state, or probes the player when the
//!   node lost its voice connection
//! * `event` turns track and voice events into [`Event`]s
//!
//! Unknown ops and event types are logged and dropped, so that newer nodes
//! and plugins do not break older clients.
//!
//! # Probes
//!
//! A node may report a player as disconnected from voice while the player
//! believes it is playing. When that happens to a player that has been
//! connected for longer than [`DispatchConfig::reconnect_grace`], a probe is
//! scheduled for its guild. The probe waits, asks the node for the player
//! again and reconnects it when the node still reports it disconnected.
//! Scheduling a probe replaces the one already pending for that guild.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::task::JoinHandle;

use crate::{
    error::Result,
    events::{Event, EventSink},
    http::NodeApi,
    manager::{Player, PlayerManager},
    node::{Node, Session},
    protocol::{
        self,
        messages::{
            EventType, Header, Op, PlayerUpdate, Ready, SegmentSkipped, SegmentsLoaded,
            TrackEnd, TrackException, TrackStart, TrackStuck, WebSocketClosed,
        },
    },
    query::{Classifier, Query, Source},
    track::Track,
};

/// Timing of the dispatcher.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DispatchConfig {
    /// How long a player must have been connected before it is probed.
    pub reconnect_grace: Duration,

    /// How long a probe waits before asking the node.
    pub probe_delay: Duration,

    /// How long to wait before looking up a player for an event again.
    pub player_lookup_retry: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            reconnect_grace: Duration::from_secs(5 * 60),
            probe_delay: Duration::from_secs(5),
            player_lookup_retry: Duration::from_secs(3),
        }
    }
}

/// A scheduled probe. `id` tells a replaced probe from its replacement.
struct Probe {
    id: u64,
    task: JoinHandle<()>,
}

/// Dispatches the frames of a single node.
#[derive(Clone)]
pub struct Dispatcher {
    node: Arc<Node>,
    api: Arc<dyn NodeApi>,
    players: Arc<dyn PlayerManager>,
    sink: Arc<dyn EventSink>,
    classifier: Arc<Classifier>,
    config: DispatchConfig,

    probes: Arc<Mutex<HashMap<u64, Probe>>>,
    next_probe: Arc<AtomicU64>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        node: Arc<Node>,
        api: Arc<dyn NodeApi>,
        players: Arc<dyn PlayerManager>,
        sink: Arc<dyn EventSink>,
        classifier: Arc<Classifier>,
    ) -> Self {
        Self {
            node,
            api,
            players,
            sink,
            classifier,
            config: DispatchConfig::default(),
            probes: Arc::new(Mutex::new(HashMap::new())),
            next_probe: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Handles a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error when the frame or its payload cannot be parsed, or
    /// a player fails to apply a state update.
    pub async fn handle(&self, frame: &str) -> Result<()> {
        let header: Header = protocol::json(frame, "frame")?;
        let op = match header.op.parse::<Op>() {
            Ok(op) => op,
            Err(e) => {
                warn!("{}: ignoring {e}", self.node.identifier());
                return Ok(());
            }
        };

        match op {
            Op::Ready => self.handle_ready(frame).await,
            Op::Stats => {
                self.node.set_stats(protocol::json(frame, "stats")?);
                Ok(())
            }
            Op::PlayerUpdate => self.handle_player_update(frame).await,
            Op::Event => {
                let Some(event_type) = header.event_type else {
                    warn!("{}: ignoring event without type", self.node.identifier());
                    return Ok(());
                };

                match event_type.parse::<EventType>() {
                    Ok(event_type) => self.handle_event(event_type, frame).await,
                    Err(e) => {
                        warn!("{}: ignoring {e}", self.node.identifier());
                        Ok(())
                    }
                }
            }
        }
    }

    async fn handle_ready(&self, frame: &str) -> Result<()> {
        let ready: Ready = protocol::json(frame, "ready")?;
        self.node.set_session(Session {
            id: ready.session_id.clone(),
            resumed: ready.resumed,
        });
        self.node.set_ready(true);

        info!(
            "{}: ready with session {} (resumed: {})",
            self.node.identifier(),
            ready.session_id,
            ready.resumed
        );

        self.sink
            .emit(Event::NodeReady {
                node: self.node.identifier().to_owned(),
                session_id: ready.session_id.clone(),
                resumed: ready.resumed,
            })
            .await;

        self.configure_resume(&ready.session_id).await;
        Ok(())
    }

    async fn configure_resume(&self, session_id: &str) {
        let Some(update) = self.node.claim_resume() else {
            return;
        };

        let Some(api) = self.node.api_version() else {
            self.node.release_resume();
            return;
        };

        match self.api.patch_session(api, session_id, &update).await {
            Ok(()) => debug!(
                "{}: resuming configured for {} seconds",
                self.node.identifier(),
                update.timeout
            ),
            Err(e) => {
                self.node.release_resume();
                warn!("{}: failed to configure resuming: {e}", self.node.identifier());
            }
        }
    }

    async fn handle_player_update(&self, frame: &str) -> Result<()> {
        let update: PlayerUpdate = protocol::json(frame, "player update")?;
        let Some(player) = self.players.get(update.guild_id).await else {
            trace!(
                "{}: no player for guild {}",
                self.node.identifier(),
                update.guild_id
            );
            return Ok(());
        };

        if !update.state.connected && self.is_stale(player.as_ref()) {
            debug!(
                "{}: guild {} lost its voice connection",
                self.node.identifier(),
                update.guild_id
            );
            self.schedule_probe(update.guild_id);
            return Ok(());
        }

        player.update_state(update.state).await
    }

    /// Whether a player that the node reports disconnected from voice should
    /// have been connected.
    fn is_stale(&self, player: &dyn Player) -> bool {
        player.is_playing()
            && self.node.is_ready()
            && player.connected_at().elapsed() > self.config.reconnect_grace
    }

    /// Schedules a probe of `guild_id`, replacing the pending one.
    ///
    /// A probe removes itself once it has run.
    pub fn schedule_probe(&self, guild_id: u64) {
        let id = self.next_probe.fetch_add(1, Ordering::Relaxed);

        // Held until the probe is stored, so that it cannot remove itself
        // before it was inserted.
        let mut probes = self.probes.lock().unwrap_or_else(PoisonError::into_inner);

        let this = self.clone();
        let task = tokio::spawn(async move {
            this.probe(guild_id).await;
            this.forget_probe(guild_id, id);
        });

        if let Some(previous) = probes.insert(guild_id, Probe { id, task }) {
            previous.task.abort();
        }
    }

    fn forget_probe(&self, guild_id: u64, id: u64) {
        let mut probes = self.probes.lock().unwrap_or_else(PoisonError::into_inner);
        if probes.get(&guild_id).is_some_and(|probe| probe.id == id) {
            probes.remove(&guild_id);
        }
    }

    async fn probe(&self, guild_id: u64) {
        tokio::time::sleep(self.config.probe_delay).await;

        let (Some(api), Some(session)) = (self.node.api_version(), self.node.session_id()) else {
            return;
        };

        let connected = match self.api.session_player(api, &session, guild_id).await {
            Ok(player) => player.voice.connected,
            Err(e) => {
                debug!("{}: probing guild {guild_id} failed: {e}", self.node.identifier());
                return;
            }
        };

        let Some(player) = self.players.get(guild_id).await else {
            return;
        };

        if !connected && self.is_stale(player.as_ref()) {
            info!("{}: reconnecting guild {guild_id}", self.node.identifier());
            if let Err(e) = player.reconnect().await {
                warn!("{}: reconnecting guild {guild_id} failed: {e}", self.node.identifier());
            }
        }
    }

    /// Number of probes that have not run yet.
    #[must_use]
    pub fn pending_probes(&self) -> usize {
        self.probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Aborts all pending probes.
    pub fn cancel_probes(&self) {
        let mut probes = self.probes.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, probe) in probes.drain() {
            probe.task.abort();
        }
    }

    async fn handle_event(&self, event_type: EventType, frame: &str) -> Result<()> {
        let guild_id = match event_type {
            EventType::TrackStart => protocol::json::<TrackStart>(frame, "track start")?.guild_id,
            EventType::TrackEnd => protocol::json::<TrackEnd>(frame, "track end")?.guild_id,
            EventType::TrackException => {
                protocol::json::<TrackException>(frame, "track exception")?.guild_id
            }
            EventType::TrackStuck => protocol::json::<TrackStuck>(frame, "track stuck")?.guild_id,
            EventType::WebSocketClosed => {
                protocol::json::<WebSocketClosed>(frame, "websocket closed")?.guild_id
            }
            EventType::SegmentsLoaded => {
                protocol::json::<SegmentsLoaded>(frame, "segments loaded")?.guild_id
            }
            EventType::SegmentSkipped => {
                protocol::json::<SegmentSkipped>(frame, "segment skipped")?.guild_id
            }
        };

        if let Some(player) = self.players.get(guild_id).await {
            return self.deliver(player, event_type, frame).await;
        }

        // The player may not be registered yet, so look again later without
        // holding up the frames that follow.
        let this = self.clone();
        let frame = frame.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(this.config.player_lookup_retry).await;
            let Some(player) = this.players.get(guild_id).await else {
                debug!(
                    "{}: dropping {event_type} for guild {guild_id} without player",
                    this.node.identifier()
                );
                return;
            };

            if let Err(e) = this.deliver(player, event_type, &frame).await {
                warn!("{}: {event_type} for guild {guild_id}: {e}", this.node.identifier());
            }
        });

        Ok(())
    }

    async fn deliver(
        &self,
        player: Arc<dyn Player>,
        event_type: EventType,
        frame: &str,
    ) -> Result<()> {
        let node = self.node.identifier().to_owned();
        let event = match event_type {
            EventType::TrackStart => {
                let start: TrackStart = protocol::json(frame, "track start")?;
                let Some(track) = self.resolve_track(player.as_ref(), start.track.encoded()).await
                else {
                    return Ok(());
                };
                let source = track.query().map_or_else(
                    || Source::from_source_name(&track.info().source_name),
                    Query::source,
                );
                Event::TrackStart {
                    node,
                    guild_id: start.guild_id,
                    track,
                    source,
                }
            }
            EventType::TrackEnd => {
                let end: TrackEnd = protocol::json(frame, "track end")?;
                let Some(track) = self.resolve_track(player.as_ref(), end.track.encoded()).await
                else {
                    return Ok(());
                };
                let event = Event::TrackEnd {
                    node,
                    guild_id: end.guild_id,
                    track,
                    reason: end.reason,
                };
                player.handle_event(&event).await?;
                event
            }
            EventType::TrackException => {
                let exception: TrackException = protocol::json(frame, "track exception")?;
                if player.node_identifier() != node {
                    debug!(
                        "{node}: ignoring exception for guild {} on node {}",
                        exception.guild_id,
                        player.node_identifier()
                    );
                    return Ok(());
                }

                let Some(track) = self
                    .resolve_track(player.as_ref(), exception.track.encoded())
                    .await
                else {
                    return Ok(());
                };
                let event = Event::TrackException {
                    guild_id: exception.guild_id,
                    track,
                    exception: exception.exception,
                    node,
                };
                player.handle_event(&event).await?;
                event
            }
            EventType::TrackStuck => {
                let stuck: TrackStuck = protocol::json(frame, "track stuck")?;
                let Some(track) = self.resolve_track(player.as_ref(), stuck.track.encoded()).await
                else {
                    return Ok(());
                };
                let event = Event::TrackStuck {
                    node,
                    guild_id: stuck.guild_id,
                    track,
                    threshold: Duration::from_millis(stuck.threshold_ms),
                };
                player.handle_event(&event).await?;
                event
            }
            EventType::WebSocketClosed => {
                let closed: WebSocketClosed = protocol::json(frame, "websocket closed")?;
                Event::WebSocketClosed {
                    node,
                    guild_id: closed.guild_id,
                    code: closed.code,
                    reason: closed.reason,
                    by_remote: closed.by_remote,
                }
            }
            EventType::SegmentsLoaded => {
                let loaded: SegmentsLoaded = protocol::json(frame, "segments loaded")?;
                Event::SegmentsLoaded {
                    node,
                    guild_id: loaded.guild_id,
                    segments: loaded.segments,
                }
            }
            EventType::SegmentSkipped => {
                let skipped: SegmentSkipped = protocol::json(frame, "segment skipped")?;
                Event::SegmentSkipped {
                    node,
                    guild_id: skipped.guild_id,
                    segment: skipped.segment,
                }
            }
        };

        self.sink.emit(event).await;
        Ok(())
    }

    /// The player's current track when it is the one encoded, or else the
    /// decoded track.
    ///
    /// Returns `None` when the track cannot be decoded. The event it came
    /// with is dropped, and the connection stays up.
    async fn resolve_track(&self, player: &dyn Player, encoded: &str) -> Option<Track> {
        if let Some(current) = player
            .current_track()
            .filter(|current| current.is_encoded_as(encoded))
        {
            return Some(current);
        }

        match Track::from_encoded(encoded, &self.classifier).await {
            Ok(track) => Some(track),
            Err(e) => {
                debug!(
                    "{}: dropping event for guild {} with undecodable track: {e}",
                    self.node.identifier(),
                    player.guild_id()
                );
                None
            }
        }
    }
}
