//! Wire formats spoken by Lavalink nodes.
//!
//! # Submodules
//!
//! * [`codec`] - Binary track format (base64 over a Java `DataOutput` layout)
//! * [`messages`] - JSON frames received over the WebSocket
//!
//! # Shared Functionality
//!
//! [`json`] parses a JSON body and logs what it parsed, so that protocol
//! changes on the node side show up in trace logs.
//!
//! ```
//! use lavaclient::protocol;
//!
//! let version: NodeInfo = protocol::json(&body, "info")?;
//! ```

pub mod codec;
pub mod messages;

use crate::error::Result;
use serde::Deserialize;
use std::fmt::Debug;

/// Parses and logs a JSON body received from a node.
///
/// # Arguments
///
/// * `body` - Text to parse
/// * `origin` - Description of the endpoint or op for logging
///
/// # Errors
///
/// Returns error if the body is not valid JSON or does not match `T`.
///
/// # Logging
///
/// * Success: Logs parsed structure at TRACE level
/// * Parse Error: Logs raw JSON at TRACE level if valid JSON
/// * Invalid JSON: Logs error and raw text at ERROR level
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{origin}: {result:#?}");
            Ok(result)
        }
        Err(e) => {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
                trace!("{origin}: {json:#?}");
            } else {
                error!("{origin}: failed parsing response ({e:?})");
                trace!("{body}");
            }
            Err(e.into())
        }
    }
}
