use std::time::Duration;

use serde::Serialize;

use crate::config::Config;

/// What one profile token can deliver, as published by the device's media
/// configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MediaCapability {
    pub token: String,
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub audio_enabled: bool,
    /// `None` falls back to the server default.
    pub session_timeout: Option<Duration>,
    pub secure_supported: bool,
}

pub trait CapabilityProvider: Send + Sync {
    fn by_path(&self, path: &str) -> Option<MediaCapability>;

    fn by_token(&self, token: &str) -> Option<MediaCapability>;
}

/// Fixed capability table built at startup.
#[derive(Clone, Debug, Default)]
pub struct StaticCapabilities {
    profiles: Vec<MediaCapability>,
}

impl StaticCapabilities {
    pub fn new(profiles: Vec<MediaCapability>) -> Self {
        Self { profiles }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config
                .profiles
                .iter()
                .map(|p| MediaCapability {
                    token: p.token.clone(),
                    path: p.path.trim_end_matches('/').to_string(),
                    width: p.width,
                    height: p.height,
                    fps: p.fps,
                    bitrate_kbps: p.bitrate_kbps,
                    audio_enabled: p.audio_channel.is_some(),
                    session_timeout: p.session_timeout_secs.map(Duration::from_secs),
                    secure_supported: false,
                })
                .collect(),
        )
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.profiles.iter().map(|p| p.token.as_str())
    }
}

impl CapabilityProvider for StaticCapabilities {
    fn by_path(&self, path: &str) -> Option<MediaCapability> {
        let path = path.trim_end_matches('/');
        self.profiles.iter().find(|p| p.path == path).cloned()
    }

    fn by_token(&self, token: &str) -> Option<MediaCapability> {
        self.profiles.iter().find(|p| p.token == token).cloned()
    }
}
