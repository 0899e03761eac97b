//! Nodes and what is known about them.
//!
//! A [`Node`] is shared between its connection, the dispatcher of its
//! frames and the registry that routes players to it. The connection owns
//! the connection state; everything else here is written by whoever learns
//! it first and read by everyone.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::sync::watch;

use crate::{
    config::NodeConfig,
    error::{Error, Result},
    http::{NodeInfo, SessionUpdate},
    protocol::messages::Stats,
    query::Query,
    region::Region,
};

/// Node API versions this client speaks.
pub const SUPPORTED_API_VERSIONS: [u64; 2] = [3, 4];

/// Extracts the API version from the version string a node reports.
///
/// # Errors
///
/// Returns `InvalidArgument` when `version` is not a semantic version and
/// `Unimplemented` when its major version is not supported.
pub fn api_version(version: &str) -> Result<u64> {
    let version = semver::Version::parse(version.trim())?;
    if SUPPORTED_API_VERSIONS.contains(&version.major) {
        Ok(version.major)
    } else {
        Err(Error::unimplemented(format!(
            "node version {version} is not supported"
        )))
    }
}

/// A session the node assigned on `ready`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Session {
    pub id: String,
    pub resumed: bool,
}

#[derive(Debug)]
pub struct Node {
    config: NodeConfig,

    /// Region from the configuration, if the node's location is known.
    known_region: Option<Region>,

    region: Mutex<Region>,

    /// Zero until the node reported its version.
    api_version: AtomicU64,

    ready: watch::Sender<bool>,
    session: Mutex<Option<Session>>,
    features: Mutex<NodeInfo>,
    stats: Mutex<Option<Stats>>,

    resume_configured: AtomicBool,
}

impl Node {
    #[must_use]
    pub fn new(config: NodeConfig, known_region: Option<Region>) -> Self {
        let region = known_region.clone().unwrap_or_else(Region::unknown);
        Self {
            config,
            known_region,
            region: Mutex::new(region),
            api_version: AtomicU64::new(0),
            ready: watch::Sender::new(false),
            session: Mutex::new(None),
            features: Mutex::new(NodeInfo::default()),
            stats: Mutex::new(None),
            resume_configured: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub fn known_region(&self) -> Option<&Region> {
        self.known_region.as_ref()
    }

    #[must_use]
    pub fn region(&self) -> Region {
        self.region
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_region(&self, region: Region) {
        *self.region.lock().unwrap_or_else(PoisonError::into_inner) = region;
    }

    /// The API version the node reported, if it did.
    #[must_use]
    pub fn api_version(&self) -> Option<u64> {
        match self.api_version.load(Ordering::Acquire) {
            0 => None,
            version => Some(version),
        }
    }

    pub fn set_api_version(&self, version: u64) {
        self.api_version.store(version, Ordering::Release);
    }

    /// Where to open the WebSocket for the given API version.
    #[must_use]
    pub fn websocket_url(&self, api: u64) -> String {
        let scheme = if self.config.ssl { "wss" } else { "ws" };
        let path = if api >= 4 {
            format!("/v{api}/websocket")
        } else {
            String::new()
        };

        format!("{scheme}://{}:{}{path}", self.config.host, self.config.port)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }

    /// Waits until the node has sent `ready`.
    ///
    /// # Errors
    ///
    /// Returns `DeadlineExceeded` when the node is not ready within
    /// `timeout`.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let mut ready = self.ready.subscribe();
        let waited = tokio::time::timeout(timeout, ready.wait_for(|ready| *ready))
            .await
            .map(|result| result.map(|_| ()));

        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::cancelled(e)),
            Err(e) => Err(Error::deadline_exceeded(format!(
                "node {} not ready: {e}",
                self.identifier()
            ))),
        }
    }

    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session().map(|session| session.id)
    }

    pub fn set_session(&self, session: Session) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    /// Forgets the session and readiness after a disconnect.
    pub fn clear_session(&self) {
        self.set_ready(false);
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    #[must_use]
    pub fn features(&self) -> NodeInfo {
        self.features
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_features(&self, features: NodeInfo) {
        *self.features.lock().unwrap_or_else(PoisonError::into_inner) = features;
    }

    /// Whether the node reported a source manager by this name.
    #[must_use]
    pub fn supports(&self, capability: &str) -> bool {
        self.features
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .source_managers
            .iter()
            .any(|manager| manager.eq_ignore_ascii_case(capability))
    }

    #[must_use]
    pub fn supports_query(&self, query: &Query) -> bool {
        self.supports(query.required_capability())
    }

    #[must_use]
    pub fn stats(&self) -> Option<Stats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_stats(&self, stats: Stats) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = Some(stats);
    }

    /// Load of the node; lower is better.
    ///
    /// Playing players count one each. CPU load and dropped or missing audio
    /// frames add exponentially. Nodes without stats are not penalized.
    #[must_use]
    pub fn penalty(&self) -> f64 {
        let Some(stats) = self.stats() else {
            return 0.0;
        };

        let players = f64::from(stats.playing_players);
        let cpu = 1.05_f64.powf(100.0 * stats.cpu.system_load) * 10.0 - 10.0;
        let frames = stats.frame_stats.map_or(0.0, |frames| {
            #[expect(clippy::cast_precision_loss)]
            let (deficit, nulled) = (frames.deficit as f64, frames.nulled as f64);
            let deficit = 1.03_f64.powf(500.0 * deficit / 3000.0) * 600.0 - 600.0;
            let nulled = (1.03_f64.powf(500.0 * nulled / 3000.0) * 300.0 - 300.0) * 2.0;
            deficit + nulled
        });

        players + cpu + frames
    }

    /// Returns the session update to send, the first time resuming is due.
    ///
    /// Resuming is due when the node has a resume key and a positive resume
    /// timeout. Until [`release_resume`](Self::release_resume) is called,
    /// later calls return `None`.
    #[must_use]
    pub fn claim_resume(&self) -> Option<SessionUpdate> {
        let key = self.config.resume_key()?;
        let timeout = self.config.resume_timeout.as_secs();
        if timeout == 0 {
            return None;
        }

        self.resume_configured
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        Some(SessionUpdate {
            resuming_key: key.to_owned(),
            timeout,
        })
    }

    /// Allows resuming to be configured again, after it failed.
    pub fn release_resume(&self) {
        self.resume_configured.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_resume_configured(&self) -> bool {
        self.resume_configured.load(Ordering::Acquire)
    }
}
