//! Event hub configuration loaded from JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::EventHubError;
use crate::options::ConnectOptions;
use crate::types::{EndBlock, PeerTarget, StartBlock};

/// The peer to stream from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Endpoint URL, e.g. "grpcs://peer0.org1.example.com:7051"
    pub url: String,
    /// Display name; defaults to the `host:port` of `url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// `log` section of the hub config file.
///
/// `level` is the floor for every crate; `components` adjusts single crates,
/// e.g. `{"chainevents-ws": "debug"}` to see gateway frames. Missing fields
/// take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub components: HashMap<String, String>,
    /// One JSON object per log line on stderr.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            components: HashMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Filter directives such as `info,chainevents_core=debug`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();
        for (component, level) in components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Top-level event hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHubConfig {
    pub channel_id: String,
    pub peer: PeerConfig,
    /// Deliver full blocks instead of filtered blocks
    #[serde(default)]
    pub full_block: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<StartBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_block: Option<EndBlock>,
    #[serde(default)]
    pub log: LogConfig,
}

impl EventHubConfig {
    /// Create a config for one peer with live delivery and default logging.
    pub fn new(channel_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            peer: PeerConfig {
                url: url.into(),
                name: None,
            },
            full_block: false,
            start_block: None,
            end_block: None,
            log: LogConfig::default(),
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self, EventHubError> {
        serde_json::from_str(s)
            .map_err(|e| EventHubError::config(format!("invalid event hub config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EventHubError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EventHubError::config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// The peer as a [`PeerTarget`].
    pub fn target(&self) -> Result<PeerTarget, EventHubError> {
        let target = PeerTarget::new(&self.peer.url)?;
        Ok(match &self.peer.name {
            Some(name) => target.with_name(name),
            None => target,
        })
    }

    /// Connect options carrying the configured block mode and replay window.
    pub fn connect_options(&self) -> Result<ConnectOptions, EventHubError> {
        let mut options = ConnectOptions::new().full_block(self.full_block);
        options.start_block = self.start_block;
        options.end_block = self.end_block;
        options.window()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_defaults() {
        let cfg = EventHubConfig::from_json_str(
            r#"{"channelId":"mychannel","peer":{"url":"grpcs://localhost:7051"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.channel_id, "mychannel");
        assert!(!cfg.full_block);
        assert_eq!(cfg.log.level, "info");
        assert_eq!(cfg.target().unwrap().name(), "localhost:7051");
    }

    #[test]
    fn replay_window_from_json() {
        let cfg = EventHubConfig::from_json_str(
            r#"{
                "channelId": "mychannel",
                "peer": {"url": "grpcs://localhost:7051", "name": "peer0"},
                "fullBlock": true,
                "startBlock": "oldest",
                "endBlock": 12,
                "log": {"level": "debug", "components": {"chainevents-core": "trace"}}
            }"#,
        )
        .unwrap();
        let opts = cfg.connect_options().unwrap();
        assert!(opts.full_block);
        assert_eq!(opts.start_block, Some(StartBlock::Oldest));
        assert_eq!(opts.end_block, Some(EndBlock::Number(12)));
        assert_eq!(cfg.target().unwrap().name(), "peer0");
        assert_eq!(cfg.log.directives(), "debug,chainevents_core=trace");
    }

    #[test]
    fn partial_log_section_keeps_defaults() {
        let cfg = EventHubConfig::from_json_str(
            r#"{"channelId":"c","peer":{"url":"grpc://localhost:7051"},"log":{"json":true}}"#,
        )
        .unwrap();
        assert!(cfg.log.json);
        assert_eq!(cfg.log.level, "info");
        assert_eq!(cfg.log.directives(), "info");
    }

    #[test]
    fn inverted_window_is_rejected() {
        let mut cfg = EventHubConfig::new("mychannel", "grpcs://localhost:7051");
        cfg.start_block = Some(StartBlock::Number(9));
        cfg.end_block = Some(EndBlock::Number(3));
        assert!(cfg.connect_options().unwrap_err().is_config());
    }
}
