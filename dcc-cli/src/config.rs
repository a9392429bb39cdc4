//! Persistent configuration for dcc-cli.
//!
//! Config file lives at `~/.config/dcc-cli/config.toml`. The `[dcc]` table
//! holds the DCC tunables; anything missing takes its default.

use std::path::{Path, PathBuf};

use dcc_sdk::dcc::DccSettings;
use serde::{Deserialize, Serialize};

/// Default IRC server.
pub const DEFAULT_SERVER: &str = "127.0.0.1:6667";

/// User configuration (persisted in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server address (host:port).
    pub server: Option<String>,
    /// IRC nickname.
    pub nick: Option<String>,
    /// Real name sent at registration.
    pub realname: Option<String>,
    /// Channels to join once registered.
    pub channels: Option<Vec<String>>,
    #[serde(default)]
    pub dcc: DccSettings,
}

pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dcc-cli")
        .join("config.toml")
}

impl Config {
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(s) => match toml::from_str(&s) {
                    Ok(c) => return c,
                    Err(e) => eprintln!("Warning: bad config file {}: {e}", path.display()),
                },
                Err(e) => eprintln!("Warning: can't read {}: {e}", path.display()),
            }
        }
        Self::default()
    }

    pub fn save(&self, path: &Path) {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        match toml::to_string_pretty(self) {
            Ok(s) => {
                if let Err(e) = std::fs::write(path, s) {
                    eprintln!("Warning: can't save config: {e}");
                }
            }
            Err(e) => eprintln!("Warning: can't serialize config: {e}"),
        }
    }
}

/// Effective settings after merging CLI args over the config file.
#[derive(Debug)]
pub struct Resolved {
    pub server: String,
    pub nick: String,
    pub realname: String,
    pub channels: Vec<String>,
    pub dcc: DccSettings,
}

impl Resolved {
    /// Merge: CLI overrides > config file > defaults.
    pub fn merge(cli: &super::Cli, config: &Config) -> Self {
        let server = cli
            .server
            .clone()
            .or_else(|| config.server.clone())
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());

        // Ensure server has a port
        let server = if server.contains(':') {
            server
        } else {
            format!("{server}:6667")
        };

        let nick = cli
            .nick
            .clone()
            .or_else(|| config.nick.clone())
            .unwrap_or_else(|| "dccuser".to_string());

        let realname = config
            .realname
            .clone()
            .unwrap_or_else(|| "dcc-cli".to_string());

        let channels = if let Some(ref ch) = cli.channels {
            ch.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else {
            config.channels.clone().unwrap_or_default()
        };

        let mut dcc = config.dcc.clone();
        if let Some(ref dir) = cli.store_path {
            dcc.store_path = Some(dir.clone());
        }
        if let Some(window) = cli.window {
            dcc.sliding_window = window;
        }
        if cli.resume {
            dcc.mirc_resume = true;
        }

        Self {
            server,
            nick,
            realname,
            channels,
            dcc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn dcc_table_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            server = "irc.example.org"
            nick = "alice"

            [dcc]
            sliding_window = 4
            mirc_resume = true
            "#,
        )
        .unwrap();
        assert_eq!(config.dcc.sliding_window, 4);
        assert!(config.dcc.mirc_resume);
        assert_eq!(config.dcc.idle_timeout_secs, DccSettings::default().idle_timeout_secs);
    }

    #[test]
    fn cli_overrides_config() {
        let config = Config {
            server: Some("irc.example.org".into()),
            nick: Some("alice".into()),
            channels: Some(vec!["#files".into()]),
            ..Config::default()
        };
        let cli = super::super::Cli::parse_from([
            "dcc-cli",
            "--nick",
            "bob",
            "--window",
            "3",
            "--store-path",
            "/tmp/incoming",
        ]);
        let r = Resolved::merge(&cli, &config);
        assert_eq!(r.server, "irc.example.org:6667");
        assert_eq!(r.nick, "bob");
        assert_eq!(r.channels, vec!["#files".to_string()]);
        assert_eq!(r.dcc.sliding_window, 3);
        assert_eq!(r.dcc.store_path, Some(PathBuf::from("/tmp/incoming")));
        assert!(!r.dcc.mirc_resume);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.nick = Some("carol".into());
        config.dcc.default_port = Some(5000);
        config.save(&path);
        let loaded = Config::load(&path);
        assert_eq!(loaded.nick.as_deref(), Some("carol"));
        assert_eq!(loaded.dcc.default_port, Some(5000));
    }
}
