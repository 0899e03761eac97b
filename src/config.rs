//! Configuration for lavaclient.
//!
//! Configuration is read from a TOML file:
//!
//! ```toml
//! [client]
//! user_id = 1234567890
//! local_root = "/srv/music"
//! fallback_search = "ytm"
//!
//! [[nodes]]
//! identifier = "main"
//! host = "lavalink.example.com"
//! port = 443
//! password = "youshallnotpass"
//! ssl = true
//!
//! [known_nodes.main]
//! region = "us_central"
//! latitude = 41.878
//! longitude = -93.098
//! ```
//!
//! Every component takes the part of the configuration it needs through its
//! constructor; nothing is read from the environment.

use std::{collections::HashMap, fmt, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DeserializeFromStr, DurationSeconds};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    query::{ClassifierConfig, Source},
};

/// Maximum size of a configuration file.
const MAX_FILE_SIZE: u64 = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Config {
    pub client: ClientConfig,

    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Regions of nodes whose location is known up front.
    #[serde(default)]
    pub known_nodes: HashMap<String, KnownNode>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ClientConfig {
    /// Identity of the bot the nodes play for.
    pub user_id: u64,

    /// Sent to nodes as `Client-Name`.
    #[serde(default = "ClientConfig::default_client_name")]
    pub client_name: String,

    pub local_root: Option<PathBuf>,

    #[serde(default)]
    pub fallback_search: SearchSource,
}

impl ClientConfig {
    fn default_client_name() -> String {
        format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }

    #[must_use]
    pub fn classifier(&self) -> ClassifierConfig {
        ClassifierConfig {
            local_root: self.local_root.clone(),
            fallback_search: self.fallback_search.0,
        }
    }
}

/// Search source given by its search prefix, like `ytm` or `sc`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, DeserializeFromStr)]
pub struct SearchSource(pub Source);

impl Default for SearchSource {
    fn default() -> Self {
        Self(Source::YouTubeMusic)
    }
}

impl std::str::FromStr for SearchSource {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let source = match s {
            "ytm" => Source::YouTubeMusic,
            "yt" => Source::YouTube,
            "sp" => Source::Spotify,
            "sc" => Source::SoundCloud,
            "am" => Source::AppleMusic,
            "dz" => Source::Deezer,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "unknown search source {s} (expected ytm, yt, sp, sc, am or dz)"
                )))
            }
        };

        Ok(Self(source))
    }
}

#[serde_as]
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct NodeConfig {
    pub identifier: String,
    pub host: String,
    pub port: u16,
    pub password: String,

    #[serde(default)]
    pub ssl: bool,

    #[serde(default = "NodeConfig::default_resume")]
    pub resume: bool,

    /// Generated when resuming and absent.
    pub resume_key: Option<String>,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "NodeConfig::default_resume_timeout")]
    pub resume_timeout: Duration,

    #[serde(default)]
    pub reconnect_attempts: ReconnectAttempts,

    /// Interval between WebSocket pings, at least one second.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "NodeConfig::default_heartbeat")]
    pub heartbeat: Duration,

    /// Time allowed for the WebSocket handshake.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "NodeConfig::default_timeout")]
    pub timeout: Duration,
}

impl NodeConfig {
    const DEFAULT_RESUME_TIMEOUT: Duration = Duration::from_secs(600);
    const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    /// Creates a node configuration with default connection parameters.
    #[must_use]
    pub fn new(identifier: &str, host: &str, port: u16, password: &str) -> Self {
        Self {
            identifier: identifier.to_owned(),
            host: host.to_owned(),
            port,
            password: password.to_owned(),
            ssl: false,
            resume: Self::default_resume(),
            resume_key: None,
            resume_timeout: Self::DEFAULT_RESUME_TIMEOUT,
            reconnect_attempts: ReconnectAttempts::default(),
            heartbeat: Self::DEFAULT_HEARTBEAT,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    fn default_resume() -> bool {
        true
    }

    fn default_resume_timeout() -> Duration {
        Self::DEFAULT_RESUME_TIMEOUT
    }

    fn default_heartbeat() -> Duration {
        Self::DEFAULT_HEARTBEAT
    }

    fn default_timeout() -> Duration {
        Self::DEFAULT_TIMEOUT
    }

    /// The key to resume sessions with, if resuming.
    #[must_use]
    pub fn resume_key(&self) -> Option<&str> {
        if self.resume {
            self.resume_key.as_deref()
        } else {
            None
        }
    }

    /// Base URL of the node's REST API.
    #[must_use]
    pub fn http_base(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Hides the password.
impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("identifier", &self.identifier)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"***")
            .field("ssl", &self.ssl)
            .field("resume", &self.resume)
            .field("resume_key", &self.resume_key)
            .field("resume_timeout", &self.resume_timeout)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("heartbeat", &self.heartbeat)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// How often to try connecting before giving up.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ReconnectAttempts {
    #[default]
    Infinite,
    Limited(u32),
}

impl ReconnectAttempts {
    /// Whether another attempt is allowed after `attempts` have been made.
    #[must_use]
    pub fn allows(self, attempts: u32) -> bool {
        match self {
            Self::Infinite => true,
            Self::Limited(max) => attempts < max,
        }
    }
}

impl fmt::Display for ReconnectAttempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infinite => f.write_str("inf"),
            Self::Limited(max) => write!(f, "{max}"),
        }
    }
}

/// Negative numbers mean infinite.
impl<'de> Deserialize<'de> for ReconnectAttempts {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let attempts = i64::deserialize(deserializer)?;
        Ok(u32::try_from(attempts).map_or(Self::Infinite, Self::Limited))
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct KnownNode {
    pub region: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Config {
    /// Reads and validates a configuration file.
    ///
    /// Resume keys are generated for nodes that resume without one.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read, is too large, is not
    /// valid TOML or does not validate.
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();

        let attributes = tokio::fs::metadata(path).await?;
        if attributes.len() > MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is larger than {MAX_FILE_SIZE} bytes",
                path.display()
            )));
        }

        let contents = tokio::fs::read_to_string(path).await?;
        contents.parse()
    }

    /// Checks the configuration for values no node would accept.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on empty identifiers or hosts, port 0, a zero
    /// heartbeat or a client name that cannot be sent as a header, and
    /// `AlreadyExists` on duplicate node identifiers.
    pub fn validate(&self) -> Result<()> {
        let name = &self.client.client_name;
        if name.is_empty() || name.contains(|chr: char| chr == ';' || chr.is_control()) {
            return Err(Error::invalid_argument(format!(
                "client name invalid (\"{name}\")"
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if node.identifier.is_empty() || node.host.is_empty() {
                return Err(Error::invalid_argument(format!(
                    "node identifier and host must be set ({node:?})"
                )));
            }

            if node.port == 0 {
                return Err(Error::invalid_argument(format!(
                    "node {} has port 0",
                    node.identifier
                )));
            }

            if node.heartbeat.is_zero() {
                return Err(Error::invalid_argument(format!(
                    "node {} has no heartbeat interval",
                    node.identifier
                )));
            }

            if !seen.insert(node.identifier.as_str()) {
                return Err(Error::already_exists(format!(
                    "node {} configured twice",
                    node.identifier
                )));
            }
        }

        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut config: Self = toml::from_str(s)?;
        config.validate()?;

        for node in &mut config.nodes {
            if node.resume && node.resume_key.is_none() {
                let key = Uuid::new_v4().to_string();
                trace!("node {} resume key: {key}", node.identifier);
                node.resume_key = Some(key);
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const MINIMAL: &str = r#"
        [client]
        user_id = 42

        [[nodes]]
        identifier = "main"
        host = "localhost"
        port = 2333
        password = "youshallnotpass"
    "#;

    #[test]
    fn defaults_are_applied() {
        let config: Config = MINIMAL.parse().unwrap();
        assert_eq!(config.client.user_id, 42);
        assert!(config.client.client_name.starts_with("lavaclient/"));
        assert_eq!(config.client.fallback_search.0, Source::YouTubeMusic);

        let node = &config.nodes[0];
        assert!(!node.ssl);
        assert!(node.resume);
        assert!(node.resume_key().is_some());
        assert_eq!(node.resume_timeout, Duration::from_secs(600));
        assert_eq!(node.reconnect_attempts, ReconnectAttempts::Infinite);
        assert_eq!(node.heartbeat, Duration::from_secs(60));
        assert_eq!(node.http_base(), "http://localhost:2333");
    }

    #[test]
    fn explicit_values_are_kept() {
        let config: Config = r#"
            [client]
            user_id = 1
            client_name = "bot/2.0"
            fallback_search = "sc"

            [[nodes]]
            identifier = "eu"
            host = "eu.example.com"
            port = 443
            password = "secret"
            ssl = true
            resume = false
            reconnect_attempts = 5
            heartbeat = 30

            [known_nodes.eu]
            region = "europe"
            latitude = 50.1
            longitude = 8.6
        "#
        .parse()
        .unwrap();

        let node = &config.nodes[0];
        assert_eq!(node.reconnect_attempts, ReconnectAttempts::Limited(5));
        assert_eq!(node.resume_key(), None);
        assert_eq!(node.http_base(), "https://eu.example.com:443");
        assert_eq!(config.client.fallback_search.0, Source::SoundCloud);
        assert_eq!(config.known_nodes["eu"].region, "europe");
    }

    #[test]
    fn negative_attempts_are_infinite() {
        let config: Config = MINIMAL
            .replace("port = 2333", "port = 2333\nreconnect_attempts = -1")
            .parse()
            .unwrap();
        assert_eq!(config.nodes[0].reconnect_attempts, ReconnectAttempts::Infinite);
        assert!(ReconnectAttempts::Limited(2).allows(1));
        assert!(!ReconnectAttempts::Limited(2).allows(2));
    }

    #[test]
    fn duplicate_nodes_are_rejected() {
        let twice = format!("{MINIMAL}\n{}", &MINIMAL[MINIMAL.find("[[nodes]]").unwrap()..]);
        let err = twice.parse::<Config>().unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
    }

    #[test]
    fn port_zero_is_rejected() {
        let err = MINIMAL
            .replace("2333", "0")
            .parse::<Config>()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn password_is_not_logged() {
        let node = NodeConfig::new("main", "localhost", 2333, "hunter2");
        assert!(!format!("{node:?}").contains("hunter2"));
    }
}
