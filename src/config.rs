use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Tuning for the voice coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// Envelopes sent this long before we subscribed are treated as leftovers
    /// from an earlier session and dropped.
    pub stale_signal_window_ms: i64,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                    "stun:stun2.l.google.com:19302".to_string(),
                    "stun:stun3.l.google.com:19302".to_string(),
                ],
                username: None,
                credential: None,
            }],
            stale_signal_window_ms: 5000,
            command_buffer: 64,
            event_buffer: 256,
        }
    }
}

/// Node configuration: file values first, CLI flags override them in `main`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub identity: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub relay_url: String,
    pub api_port: u16,
    pub voice: VoiceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            identity: None,
            display_name: None,
            avatar_url: None,
            relay_url: "ws://127.0.0.1:9850/relay".to_string(),
            api_port: 9847,
            voice: VoiceConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from `path`, or from the platform config dir when no path is given.
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                info!("Loaded config from {:?}", path);
                Self::from_toml(&text)
            }
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Read(path, e)),
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "voicemesh", "Voicemesh").map(|p| p.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = AppConfig::from_toml("").unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.voice.stale_signal_window_ms, 5000);
        assert_eq!(cfg.voice.ice_servers[0].urls.len(), 4);
    }

    #[test]
    fn partial_voice_section_keeps_other_defaults() {
        let cfg = AppConfig::from_toml(
            r#"
            identity = "alice"
            api_port = 9000

            [voice]
            stale_signal_window_ms = 250

            [[voice.ice_servers]]
            urls = ["turn:turn.example.org:3478"]
            username = "u"
            credential = "p"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.identity.as_deref(), Some("alice"));
        assert_eq!(cfg.api_port, 9000);
        assert_eq!(cfg.voice.stale_signal_window_ms, 250);
        assert_eq!(cfg.voice.command_buffer, 64);
        assert_eq!(cfg.voice.ice_servers.len(), 1);
        assert_eq!(cfg.voice.ice_servers[0].username.as_deref(), Some("u"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/voicemesh.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read(_, _)));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        assert!(matches!(
            AppConfig::from_toml("api_port = \"nope\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
