/*!
 * @file config.rs
 * @brief Mock server options
 */

use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    /// Upper bound on a single wire message, in bytes. Messages declaring a
    /// size above this (or at or below the 4-byte length prefix) are
    /// rejected as frame errors.
    pub max_message_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}
