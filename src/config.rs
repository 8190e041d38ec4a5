use std::{path::Path, sync::OnceLock, time::Duration};

use anyhow::Context;
use encoder_bus::ProfileBinding;
use serde::{Deserialize, Serialize};

use crate::{
    pool::{MAX_THREADS, PoolOptions, QueueOrder},
    rtsp::auth::AuthMode,
};

pub const CONFIG_ENV: &str = "LITE_RTSP_CONFIG";

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub rtsp_listen: String,
    /// Empty disables the status API.
    pub api_listen: String,
    pub log_level: String,
    pub pool: PoolConfig,
    pub rtp_port_range: PortRange,
    pub default_session_timeout_secs: u64,
    /// Read poll interval of a connection; also the idle-check granularity.
    pub session_poll_ms: u64,
    pub profiles: Vec<ProfileConfig>,
    pub encoder: EncoderConfig,
    pub auth: AuthConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub threads: usize,
    pub idle_wait_ms: u64,
    pub grace_ms: u64,
    pub join_timeout_ms: u64,
    pub cancel_timeout_ms: u64,
    pub order: QueueOrder,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProfileConfig {
    pub token: String,
    pub path: String,
    pub video_channel: u32,
    #[serde(default)]
    pub audio_channel: Option<u32>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub fps: u32,
    #[serde(default)]
    pub bitrate_kbps: u32,
    #[serde(default)]
    pub session_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Streams each simulated channel accepts at once.
    pub channel_capacity: usize,
    /// Video frames per second produced by the simulated encoder.
    pub frame_rate: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub realm: String,
    pub users: Vec<UserConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rtsp_listen: "0.0.0.0:554".to_string(),
            api_listen: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            pool: PoolConfig::default(),
            rtp_port_range: PortRange {
                start: 50000,
                end: 50999,
            },
            default_session_timeout_secs: 60,
            session_poll_ms: 250,
            profiles: vec![
                ProfileConfig {
                    token: "main".to_string(),
                    path: "/vs0".to_string(),
                    video_channel: 0,
                    audio_channel: Some(0),
                    width: 1920,
                    height: 1080,
                    fps: 25,
                    bitrate_kbps: 4096,
                    session_timeout_secs: None,
                },
                ProfileConfig {
                    token: "sub".to_string(),
                    path: "/vs1".to_string(),
                    video_channel: 1,
                    audio_channel: None,
                    width: 640,
                    height: 360,
                    fps: 15,
                    bitrate_kbps: 512,
                    session_timeout_secs: None,
                },
            ],
            encoder: EncoderConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            idle_wait_ms: 1000,
            grace_ms: 100,
            join_timeout_ms: 2000,
            cancel_timeout_ms: 1000,
            order: QueueOrder::default(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1,
            frame_rate: 25,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::None,
            realm: "lite-rtsp".to_string(),
            users: Vec::new(),
        }
    }
}

impl PoolConfig {
    pub fn options(&self) -> PoolOptions {
        PoolOptions {
            threads: self.threads,
            idle_wait: Duration::from_millis(self.idle_wait_ms),
            grace: Duration::from_millis(self.grace_ms),
            join_timeout: Duration::from_millis(self.join_timeout_ms),
            cancel_timeout: Duration::from_millis(self.cancel_timeout_ms),
            order: self.order,
        }
    }
}

impl ProfileConfig {
    pub fn binding(&self) -> ProfileBinding {
        match self.audio_channel {
            Some(audio) => ProfileBinding::with_audio(self.video_channel, audio),
            None => ProfileBinding::video_only(self.video_channel),
        }
    }
}

impl Config {
    /// Read a JSON config file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool.threads == 0 || self.pool.threads > MAX_THREADS {
            anyhow::bail!(
                "pool.threads must be between 1 and {}, got {}",
                MAX_THREADS,
                self.pool.threads
            );
        }
        if self.rtp_port_range.start >= self.rtp_port_range.end {
            anyhow::bail!(
                "rtp_port_range {}-{} is empty",
                self.rtp_port_range.start,
                self.rtp_port_range.end
            );
        }
        if self.default_session_timeout_secs == 0 {
            anyhow::bail!("default_session_timeout_secs must be positive");
        }
        let mut seen = std::collections::HashSet::new();
        for profile in &self.profiles {
            if !profile.path.starts_with('/') {
                anyhow::bail!("profile {:?}: path must start with '/'", profile.token);
            }
            if profile.session_timeout_secs == Some(0) {
                anyhow::bail!("profile {:?}: session_timeout_secs must be positive", profile.token);
            }
            if !seen.insert(profile.token.as_str()) {
                anyhow::bail!("duplicate profile token {:?}", profile.token);
            }
        }
        if self.auth.mode != AuthMode::None && self.auth.users.is_empty() {
            anyhow::bail!("auth.mode is {:?} but no users are configured", self.auth.mode);
        }
        for user in &self.auth.users {
            if user.username.is_empty() || user.username.contains(':') {
                anyhow::bail!("auth user name {:?} is not valid", user.username);
            }
        }
        if self.encoder.frame_rate == 0 {
            anyhow::bail!("encoder.frame_rate must be positive");
        }
        Ok(())
    }

    pub fn default_session_timeout(&self) -> Duration {
        Duration::from_secs(self.default_session_timeout_secs)
    }

    pub fn session_poll(&self) -> Duration {
        Duration::from_millis(self.session_poll_ms.max(10))
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Config path from the first CLI argument, else `LITE_RTSP_CONFIG`.
pub fn config_path() -> Option<String> {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
}

/// Load the process-wide config once. Later calls return the first result.
pub fn init(path: Option<&str>) -> anyhow::Result<&'static Config> {
    if let Some(config) = CONFIG.get() {
        log::warn!("config: already initialised, ignoring {:?}", path);
        return Ok(config);
    }
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    Ok(CONFIG.get_or_init(|| config))
}

pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.pool.order, QueueOrder::Lifo);
        assert_eq!(config.default_session_timeout(), Duration::from_secs(60));
        assert_eq!(config.profiles[0].binding(), ProfileBinding::with_audio(0, 0));
        assert_eq!(config.profiles[1].binding(), ProfileBinding::video_only(1));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"rtsp_listen": "127.0.0.1:8554", "pool": {"threads": 4, "order": "fifo"}}"#,
        )
        .unwrap();
        assert_eq!(config.rtsp_listen, "127.0.0.1:8554");
        assert_eq!(config.pool.threads, 4);
        assert_eq!(config.pool.order, QueueOrder::Fifo);
        assert_eq!(config.pool.join_timeout_ms, 2000);
        assert_eq!(config.profiles.len(), 2);
        assert_eq!(config.pool.options().join_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.pool.threads = MAX_THREADS + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rtp_port_range = PortRange { start: 6000, end: 6000 };
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.profiles.push(config.profiles[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_profile_timeout() {
        let mut config = Config::default();
        config.profiles[1].session_timeout_secs = Some(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("\"sub\""));

        config.profiles[1].session_timeout_secs = Some(1);
        config.validate().unwrap();
    }

    #[test]
    fn test_auth_section() {
        let config: Config = serde_json::from_str(
            r#"{"auth": {"mode": "digest", "users": [{"username": "admin", "password": "secret"}]}}"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.auth.mode, AuthMode::Digest);
        assert_eq!(config.auth.realm, "lite-rtsp");

        let mut config = Config::default();
        config.auth.mode = AuthMode::Basic;
        assert!(config.validate().is_err());
        config.auth.users.push(UserConfig {
            username: "a:b".into(),
            password: "x".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("lite-rtsp-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"profiles": [{"token": "only", "path": "/live", "video_channel": 2, "session_timeout_secs": 30}]}"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.profiles.len(), 1);
        assert_eq!(config.profiles[0].session_timeout_secs, Some(30));
        assert!(Config::load(&path).is_err());
    }
}
