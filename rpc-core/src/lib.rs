use serde::{Deserialize, Serialize};
pub mod config;
pub mod frame;

/// How a client holds connections to downstream instances.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// dial per call, close after use
    #[default]
    Ephemeral,
    /// per-endpoint ring of idle connections
    Persistent,
}
