//! In-memory collaborators for driving connections and dispatchers.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::mpsc, time::Instant};

use lavaclient::{
    config::{ClientConfig, NodeConfig, SearchSource},
    connection::{Connection, Services},
    error::{Error, Result},
    events::Event,
    http::{NodeApi, NodeInfo, SessionPlayer, SessionUpdate, VoiceState},
    manager::{NodeManager, Player, PlayerManager},
    node::Node,
    protocol::messages::PlayerState,
    query::{Classifier, ClassifierConfig},
    region::{Region, RegionLocator},
    track::Track,
    transport::{
        Frame, HandshakeError, HandshakeRequest, Socket, SocketReader, SocketWriter, Transport,
    },
};

/// A real YouTube track as encoded by a node.
pub const RICK: &str = "QAAAjQIAJVJpY2sgQXN0bGV5IC0gTmV2ZXIgR29ubmEgR2l2ZSBZb3UgVXAADlJpY2tBc3RsZXlWRVZPAAAAAAADPCAAC2RRdzR3OVdnWGNRAAEAK2h0dHBzOi8vd3d3LnlvdXR1YmUuY29tL3dhdGNoP3Y9ZFF3NHc5V2dYY1EAB3lvdXR1YmUAAAAAAAAAAA==";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sent {
    Text(String),
    Ping,
    Close(u16, String),
}

enum Outcome {
    Accept(mpsc::UnboundedReceiver<Frame>),
    Reject(u16),
    Unreachable,
}

/// Transport that plays back scripted handshake outcomes.
///
/// Handshakes beyond the script fail as unreachable.
#[derive(Default)]
pub struct FakeTransport {
    script: Mutex<VecDeque<Outcome>>,
    requests: Mutex<Vec<HandshakeRequest>>,
    sent: Arc<Mutex<Vec<Sent>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTransport {
    /// Scripts an accepted handshake. Frames sent on the returned channel
    /// are read by the connection; dropping it ends the stream.
    pub fn accept(&self) -> mpsc::UnboundedSender<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().unwrap().push_back(Outcome::Accept(rx));
        tx
    }

    pub fn reject(&self, status: u16) {
        self.script.lock().unwrap().push_back(Outcome::Reject(status));
    }

    pub fn unreachable(&self) {
        self.script.lock().unwrap().push_back(Outcome::Unreachable);
    }

    pub fn attempts(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<HandshakeRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|sent| match sent {
                Sent::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        request: &HandshakeRequest,
    ) -> std::result::Result<Socket, HandshakeError> {
        self.requests.lock().unwrap().push(request.clone());

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let outcome = self.script.lock().unwrap().pop_front();
        match outcome {
            Some(Outcome::Accept(frames)) => {
                let writer: Box<dyn SocketWriter> = Box::new(FakeWriter {
                    sent: Arc::clone(&self.sent),
                });
                let reader: Box<dyn SocketReader> = Box::new(FakeReader { frames });
                Ok((writer, reader))
            }
            Some(Outcome::Reject(status)) => Err(HandshakeError::Status(status)),
            Some(Outcome::Unreachable) | None => Err(HandshakeError::Connector(
                Error::unavailable("connection refused"),
            )),
        }
    }
}

struct FakeWriter {
    sent: Arc<Mutex<Vec<Sent>>>,
}

#[async_trait]
impl SocketWriter for FakeWriter {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sent.lock().unwrap().push(Sent::Text(text));
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        self.sent.lock().unwrap().push(Sent::Ping);
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push(Sent::Close(code, reason.to_owned()));
        Ok(())
    }
}

struct FakeReader {
    frames: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl SocketReader for FakeReader {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.frames.recv().await.map(Ok)
    }
}

/// REST API of a node that answers from memory.
pub struct FakeApi {
    pub version: Mutex<String>,
    pub info: Mutex<NodeInfo>,
    pub voice_connected: Mutex<Option<bool>>,
    pub fail_patch: Mutex<bool>,
    pub patches: Mutex<Vec<(String, SessionUpdate)>>,
    pub version_calls: AtomicUsize,
    pub player_calls: AtomicUsize,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self {
            version: Mutex::new("4.0.8".to_owned()),
            info: Mutex::new(NodeInfo {
                source_managers: vec!["youtube".to_owned(), "soundcloud".to_owned()],
                ..NodeInfo::default()
            }),
            voice_connected: Mutex::new(Some(false)),
            fail_patch: Mutex::new(false),
            patches: Mutex::new(Vec::new()),
            version_calls: AtomicUsize::new(0),
            player_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeApi {
    pub fn patches(&self) -> Vec<(String, SessionUpdate)> {
        self.patches.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeApi for FakeApi {
    async fn version(&self) -> Result<String> {
        self.version_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.version.lock().unwrap().clone())
    }

    async fn info(&self, _api: u64) -> Result<NodeInfo> {
        Ok(self.info.lock().unwrap().clone())
    }

    async fn patch_session(&self, _api: u64, session: &str, update: &SessionUpdate) -> Result<()> {
        if *self.fail_patch.lock().unwrap() {
            return Err(Error::unavailable("node restarting"));
        }

        self.patches
            .lock()
            .unwrap()
            .push((session.to_owned(), update.clone()));
        Ok(())
    }

    async fn session_player(&self, _api: u64, _session: &str, guild_id: u64) -> Result<SessionPlayer> {
        self.player_calls.fetch_add(1, Ordering::SeqCst);
        match *self.voice_connected.lock().unwrap() {
            Some(connected) => Ok(SessionPlayer {
                voice: VoiceState { connected },
            }),
            None => Err(Error::not_found(format!("no player for guild {guild_id}"))),
        }
    }
}

#[derive(Default)]
pub struct FakeManager {
    pub connected: AtomicUsize,
    pub disconnected: Mutex<Vec<(u16, String)>>,
}

impl FakeManager {
    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn disconnected(&self) -> Vec<(u16, String)> {
        self.disconnected.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeManager for FakeManager {
    async fn node_connected(&self, _node: &Arc<Node>) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    async fn node_disconnected(&self, _node: &Arc<Node>, code: u16, reason: &str) {
        self.disconnected
            .lock()
            .unwrap()
            .push((code, reason.to_owned()));
    }
}

pub struct FakePlayer {
    pub guild_id: u64,
    pub node: String,
    pub playing: bool,
    pub connected_at: Instant,
    pub current: Option<Track>,
    pub states: Mutex<Vec<PlayerState>>,
    pub events: Mutex<Vec<Event>>,
    pub reconnects: AtomicUsize,
}

impl FakePlayer {
    pub fn new(guild_id: u64, node: &str) -> Self {
        Self {
            guild_id,
            node: node.to_owned(),
            playing: true,
            connected_at: Instant::now(),
            current: None,
            states: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            reconnects: AtomicUsize::new(0),
        }
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Player for FakePlayer {
    fn guild_id(&self) -> u64 {
        self.guild_id
    }

    fn node_identifier(&self) -> String {
        self.node.clone()
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn connected_at(&self) -> Instant {
        self.connected_at
    }

    fn current_track(&self) -> Option<Track> {
        self.current.clone()
    }

    async fn update_state(&self, state: PlayerState) -> Result<()> {
        self.states.lock().unwrap().push(state);
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePlayers {
    players: Mutex<HashMap<u64, Arc<FakePlayer>>>,
}

impl FakePlayers {
    pub fn insert(&self, player: FakePlayer) -> Arc<FakePlayer> {
        let player = Arc::new(player);
        self.players
            .lock()
            .unwrap()
            .insert(player.guild_id, Arc::clone(&player));
        player
    }
}

#[async_trait]
impl PlayerManager for FakePlayers {
    async fn get(&self, guild_id: u64) -> Option<Arc<dyn Player>> {
        let player = self.players.lock().unwrap().get(&guild_id).cloned()?;
        Some(player as Arc<dyn Player>)
    }
}

pub struct FakeLocator(pub Option<Region>);

#[async_trait]
impl RegionLocator for FakeLocator {
    async fn locate(&self, host: &str) -> Result<Region> {
        self.0
            .clone()
            .ok_or_else(|| Error::unavailable(format!("cannot locate {host}")))
    }
}

/// Everything a test needs to drive a connection.
pub struct Harness {
    pub node: Arc<Node>,
    pub transport: Arc<FakeTransport>,
    pub api: Arc<FakeApi>,
    pub manager: Arc<FakeManager>,
    pub players: Arc<FakePlayers>,
    pub events: mpsc::UnboundedReceiver<Event>,
    pub services: Services,
}

impl Harness {
    pub fn new(config: NodeConfig) -> Self {
        let node = Arc::new(Node::new(config, None));
        let transport = Arc::new(FakeTransport::default());
        let api = Arc::new(FakeApi::default());
        let manager = Arc::new(FakeManager::default());
        let players = Arc::new(FakePlayers::default());
        let (events_tx, events) = mpsc::unbounded_channel();

        let services = Services {
            transport: transport.clone(),
            api: api.clone(),
            manager: manager.clone(),
            players: players.clone(),
            sink: Arc::new(events_tx),
            locator: Arc::new(FakeLocator(Some(Region {
                name: "europe".to_owned(),
                latitude: 50.1,
                longitude: 8.7,
            }))),
            classifier: Arc::new(Classifier::with_fs(ClassifierConfig::default())),
        };

        Self {
            node,
            transport,
            api,
            manager,
            players,
            events,
            services,
        }
    }

    pub fn connection(&self) -> Arc<Connection> {
        Arc::new(Connection::new(
            Arc::clone(&self.node),
            &client_config(),
            self.services.clone(),
        ))
    }
}

pub fn node_config() -> NodeConfig {
    let mut config = NodeConfig::new("main", "localhost", 2333, "youshallnotpass");
    config.resume_key = Some("resume-key".to_owned());
    config
}

pub fn client_config() -> ClientConfig {
    ClientConfig {
        user_id: 42,
        client_name: "lavaclient-tests/1.0".to_owned(),
        local_root: None,
        fallback_search: SearchSource::default(),
    }
}

pub fn ready_frame(session_id: &str) -> Frame {
    Frame::Text(format!(
        r#"{{"op":"ready","resumed":false,"sessionId":"{session_id}"}}"#
    ))
}

/// Polls `condition` until it holds, failing after a minute of test time.
pub async fn until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
