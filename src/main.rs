use std::{error::Error, process, sync::Arc};

use async_trait::async_trait;
use clap::{command, Parser, Subcommand, ValueHint};
use log::{debug, error, info, LevelFilter};
use tokio::sync::mpsc;

use lavaclient::{
    config::Config,
    connection::{Connection, Services},
    events::Event,
    http,
    manager::{NodeRegistry, Player, PlayerManager},
    node::Node,
    protocol::codec,
    query::{Classifier, ClassifierConfig},
    region::{IpApiLocator, Region},
    transport::WebSocketTransport,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, global = true, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, global = true, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// Connect to the configured nodes and log their events
    Connect {
        /// Configuration file
        ///
        /// Ensure that this file is kept secure and not shared publicly, as
        /// it contains the passwords of your nodes.
        #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("lavaclient.toml"))]
        config_file: String,
    },

    /// Decode a base64 encoded track and print it as JSON
    Decode {
        /// Encoded track
        track: String,
    },

    /// Classify a search string, link or local path
    Classify {
        /// Query to classify
        query: String,

        /// Root folder for local files
        #[arg(short, long, value_name = "DIR", value_hint = ValueHint::DirPath)]
        local_root: Option<std::path::PathBuf>,
    },
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Players are managed by applications, not by this binary.
struct NoPlayers;

#[async_trait]
impl PlayerManager for NoPlayers {
    async fn get(&self, _guild_id: u64) -> Option<Arc<dyn Player>> {
        None
    }
}

/// Connects every configured node and logs events until interrupted.
async fn connect(config_file: &str) -> Result<(), Box<dyn Error>> {
    let config = Config::from_file(config_file).await?;
    if config.nodes.is_empty() {
        return Err(format!("no nodes configured in {config_file}").into());
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
    let registry = Arc::new(NodeRegistry::new());
    let classifier = Arc::new(Classifier::with_fs(config.client.classifier()));
    let locator = Arc::new(IpApiLocator::new()?);
    let events_tx = Arc::new(events_tx);

    let mut connections = Vec::with_capacity(config.nodes.len());
    for node_config in &config.nodes {
        let known = config.known_nodes.get(&node_config.identifier).map(Region::from);
        let node = Arc::new(Node::new(node_config.clone(), known));

        let services = Services {
            transport: Arc::new(WebSocketTransport),
            api: Arc::new(http::Client::new(node_config)?),
            manager: registry.clone(),
            players: Arc::new(NoPlayers),
            sink: events_tx.clone(),
            locator: locator.clone(),
            classifier: classifier.clone(),
        };

        let connection = Arc::new(Connection::new(node, &config.client, services));
        connection.start();
        connections.push(connection);
    }

    loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down gracefully");
                for connection in &connections {
                    connection.shutdown().await;
                }
                break Ok(());
            }

            Some(event) = events_rx.recv() => {
                info!("{}: {event}", event.node());
            }
        }
    }
}

fn decode(track: &str) -> Result<(), Box<dyn Error>> {
    let decoded = codec::decode(track)?;
    if !decoded.complete {
        info!("track was only partially decoded");
    }
    debug!("format version {}", decoded.version);

    println!("{}", serde_json::to_string_pretty(&decoded.info)?);
    Ok(())
}

async fn classify(query: &str, local_root: Option<std::path::PathBuf>) {
    let config = ClassifierConfig {
        local_root,
        ..ClassifierConfig::default()
    };

    let query = Classifier::with_fs(config).classify(query).await;
    println!("{query}");
    println!("  source:     {}", query.source());
    println!("  type:       {:?}", query.kind());
    println!("  search:     {}", query.is_search());
    println!("  start time: {:?}", query.start_time());
    println!("  index:      {}", query.index());
    println!("  recursive:  {}", query.is_recursive());
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and runs the subcommand.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    let result = match args.command {
        Command::Connect { config_file } => connect(&config_file).await,
        Command::Decode { track } => decode(&track),
        Command::Classify { query, local_root } => {
            classify(&query, local_root).await;
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{e}");
        process::exit(1);
    }
}
