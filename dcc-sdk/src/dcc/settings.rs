//! Tunables for the DCC subsystem.
//!
//! Loaded from the `[dcc]` table of the client config file; every field has
//! a default so an empty table is valid.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Outbound file blocks are read and written in units of this many bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 2048;
/// Inbound file data is read up to this many bytes at a time.
pub const DEFAULT_RECEIVE_BLOCK_SIZE: usize = 65536;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DccSettings {
    /// Send `DCC REJECT` to the peer when an unanswered offer is discarded.
    pub auto_send_rejects: bool,
    /// Maximum unacknowledged outbound packets per transfer.
    pub sliding_window: usize,
    pub block_size: usize,
    pub receive_block_size: usize,
    /// Seconds an offer may sit without activity. 0 disables.
    pub idle_timeout_secs: u64,
    /// Seconds an outbound connect may take. 0 disables.
    pub connect_timeout_secs: u64,
    /// Directory incoming files are saved to (`./` when unset).
    pub store_path: Option<PathBuf>,
    /// Address advertised in offers instead of the local one (NAT gateway).
    pub gateway_addr: Option<IpAddr>,
    /// Honour the mIRC `RESUME`/`ACCEPT` extension.
    pub mirc_resume: bool,
    /// Show full paths in LIST instead of the last segment.
    pub long_pathnames: bool,
    /// Port to fall back on when the requested one is busy.
    pub default_port: Option<u16>,
    /// Whether transfers update the progress status buffer.
    pub updates_status: bool,
}

impl Default for DccSettings {
    fn default() -> Self {
        Self {
            auto_send_rejects: true,
            sliding_window: 1,
            block_size: DEFAULT_BLOCK_SIZE,
            receive_block_size: DEFAULT_RECEIVE_BLOCK_SIZE,
            idle_timeout_secs: 3600,
            connect_timeout_secs: 30,
            store_path: None,
            gateway_addr: None,
            mirc_resume: false,
            long_pathnames: true,
            default_port: None,
            updates_status: true,
        }
    }
}

impl DccSettings {
    /// Window size in packets, never below one.
    pub fn window(&self) -> usize {
        self.sliding_window.max(1)
    }

    pub fn block_size(&self) -> usize {
        self.block_size.max(1)
    }

    pub fn receive_block_size(&self) -> usize {
        self.receive_block_size.max(1)
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(|| PathBuf::from("./"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_uses_defaults() {
        let s: DccSettings = toml::from_str("").unwrap();
        assert_eq!(s, DccSettings::default());
        assert!(s.auto_send_rejects);
        assert_eq!(s.window(), 1);
        assert_eq!(s.idle_timeout_secs, 3600);
    }

    #[test]
    fn partial_table_overrides() {
        let s: DccSettings = toml::from_str(
            "sliding_window = 0\nmirc_resume = true\ngateway_addr = \"203.0.113.9\"\n",
        )
        .unwrap();
        assert_eq!(s.window(), 1);
        assert!(s.mirc_resume);
        assert_eq!(s.gateway_addr, Some("203.0.113.9".parse().unwrap()));
        assert_eq!(s.block_size(), DEFAULT_BLOCK_SIZE);
    }
}
