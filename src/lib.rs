//! Client for the realtime protocol of Lavalink nodes.
//!
//! * [`connection`] keeps a WebSocket to a node open, reconnecting with
//!   [`backoff`] and resuming sessions
//! * [`dispatch`] turns the frames of a node into [`events`]
//! * [`track`] and [`protocol::codec`] decode the binary track format
//! * [`query`] classifies search strings, links and local paths
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod backoff;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod http;
pub mod manager;
pub mod node;
pub mod protocol;
pub mod query;
pub mod region;
pub mod track;
pub mod transport;
