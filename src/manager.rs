//! Collaborators of a node connection.
//!
//! The connection and its dispatcher do not own players or decide where they
//! live. They report to a [`NodeManager`] and look players up through a
//! [`PlayerManager`]. [`NodeRegistry`] is a node manager that keeps track of
//! connected nodes and routes new players to the least loaded one.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    error::Result, events::Event, node::Node, protocol::messages::PlayerState, query::Query,
    track::Track,
};

/// Receives the connection lifecycle of nodes.
#[async_trait]
pub trait NodeManager: Send + Sync {
    /// Called after the handshake of `node` succeeded.
    async fn node_connected(&self, node: &Arc<Node>);

    /// Called after `node` lost its connection, or was shut down.
    async fn node_disconnected(&self, node: &Arc<Node>, code: u16, reason: &str);
}

/// A player on a guild.
#[async_trait]
pub trait Player: Send + Sync {
    fn guild_id(&self) -> u64;

    /// Identifier of the node the player lives on.
    fn node_identifier(&self) -> String;

    fn is_playing(&self) -> bool;

    /// When the player connected to its voice channel.
    fn connected_at(&self) -> Instant;

    fn current_track(&self) -> Option<Track>;

    /// Applies a state update from the node.
    async fn update_state(&self, state: PlayerState) -> Result<()>;

    /// Reconnects the player to voice after the node lost it.
    async fn reconnect(&self) -> Result<()>;

    /// Lets the player react to the end of, or a problem with, a track.
    async fn handle_event(&self, event: &Event) -> Result<()>;
}

/// Finds players by guild.
#[async_trait]
pub trait PlayerManager: Send + Sync {
    async fn get(&self, guild_id: u64) -> Option<Arc<dyn Player>>;
}

/// Connected nodes, by identifier.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: Mutex<HashMap<String, Arc<Node>>>,
}

impl NodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: Arc<Node>) {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.identifier().to_owned(), node);
    }

    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<Arc<Node>> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identifier)
            .cloned()
    }

    pub fn remove(&self, identifier: &str) -> Option<Arc<Node>> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identifier)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the ready node with the lowest penalty.
    ///
    /// With a `query`, only nodes that can load it are considered. With a
    /// `region`, nodes in that region are preferred over the others.
    #[must_use]
    pub fn best_node(&self, query: Option<&Query>, region: Option<&str>) -> Option<Arc<Node>> {
        let nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        let candidates: Vec<_> = nodes
            .values()
            .filter(|node| node.is_ready())
            .filter(|node| query.is_none_or(|query| node.supports_query(query)))
            .collect();

        region
            .and_then(|region| {
                least_loaded(
                    candidates
                        .iter()
                        .copied()
                        .filter(|node| node.region().name == region),
                )
            })
            .or_else(|| least_loaded(candidates.iter().copied()))
    }
}

fn least_loaded<'a>(nodes: impl Iterator<Item = &'a Arc<Node>>) -> Option<Arc<Node>> {
    nodes
        .min_by(|a, b| a.penalty().total_cmp(&b.penalty()))
        .cloned()
}

#[async_trait]
impl NodeManager for NodeRegistry {
    async fn node_connected(&self, node: &Arc<Node>) {
        info!("node {} connected", node.identifier());
        self.register(Arc::clone(node));
    }

    async fn node_disconnected(&self, node: &Arc<Node>, code: u16, reason: &str) {
        // Disconnected nodes are not ready, so they are not picked until
        // they connect again.
        info!(
            "node {} disconnected with code {code}: {reason}",
            node.identifier()
        );
    }
}
