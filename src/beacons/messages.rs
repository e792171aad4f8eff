//! Logical message contract on the duplex beacon channel.
//!
//! Messages travel as one JSON object per line. The transport framing
//! beyond that is not part of the contract.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages a beacon sends to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Credential handshake; must be the first message on a connection.
    Auth {
        beacon_id: Uuid,
        token: String,
        #[serde(default)]
        hostname: Option<String>,
        #[serde(default)]
        os_info: Option<String>,
    },
    Heartbeat,
    CommandResult {
        command_id: Uuid,
        exit_code: i32,
        stdout: String,
        stderr: String,
        duration_ms: i64,
        #[serde(default)]
        working_dir: Option<String>,
    },
}

/// Messages the control plane sends to a beacon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    AuthOk,
    Command { command_id: Uuid, script: String },
}
