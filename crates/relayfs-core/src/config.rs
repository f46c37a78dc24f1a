// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Protocol session configuration

use serde::{Deserialize, Serialize};

/// Tunables for one protocol session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Default caller wait before giving up, in seconds; 0 waits forever.
    pub op_timeout_secs: u64,
    /// Bulk-buffer slots the daemon is expected to map.
    pub slot_count: u32,
    /// Initial client debug mask (adjustable through the control plane).
    pub debug_mask: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig { op_timeout_secs: 30, slot_count: 16, debug_mask: 0 }
    }
}

impl ProtocolConfig {
    pub fn op_timeout(&self) -> Option<std::time::Duration> {
        (self.op_timeout_secs > 0).then(|| std::time::Duration::from_secs(self.op_timeout_secs))
    }
}
