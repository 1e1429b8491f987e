use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::pipeline::analytics::AnalyticsSettings;
use crate::pipeline::clarifies::DEFAULT_LONG_MESSAGE_WORDS;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub hume: HumeConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub intelligence: IntelligenceConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub vonage: VonageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub external_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            external_url: "http://localhost:8080".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HumeConfig {
    pub api_key: String,
    /// Fallback config used only after the call's own config fails.
    pub default_config_id: Option<String>,
    pub url: String,
    pub connect_timeout_secs: u64,
}

impl Default for HumeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            default_config_id: None,
            url: "wss://api.hume.ai/v0/evi/chat".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl HumeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AudioConfig {
    /// Gain applied to caller mu-law before resampling.
    pub inbound_boost: f32,
    pub voice_sample_rate: u32,
    pub vonage_sample_rate: u32,
    /// Gain applied to agent audio before it goes back to the caller.
    pub output_volume: f32,
    pub playback_speed: f32,
    pub chunk_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            inbound_boost: 2.8,
            voice_sample_rate: 48000,
            vonage_sample_rate: 16000,
            output_volume: 1.0,
            playback_speed: 1.0,
            chunk_ms: 40,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Used when the call directory has no greeting for the call.
    pub greeting: Option<String>,
    pub voice_name: Option<String>,
    pub silence_duration_ms: u32,
    pub interruption_threshold_ms: u32,
    pub noise_suppression: bool,
    pub input_gain: f32,
    pub silence_timeout_ms: u32,
    pub silence_prompt: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            greeting: None,
            voice_name: None,
            silence_duration_ms: 800,
            interruption_threshold_ms: 300,
            noise_suppression: true,
            input_gain: 1.0,
            silence_timeout_ms: 30_000,
            silence_prompt: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BridgeConfig {
    pub stream_start_grace_secs: u64,
    /// 0 disables the cap.
    pub max_call_secs: u64,
    pub event_queue: usize,
    pub lookup_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stream_start_grace_secs: 15,
            max_call_secs: 3600,
            event_queue: 256,
            lookup_timeout_secs: 5,
        }
    }
}

impl BridgeConfig {
    pub fn stream_start_grace(&self) -> Duration {
        Duration::from_secs(self.stream_start_grace_secs)
    }

    pub fn max_call(&self) -> Option<Duration> {
        (self.max_call_secs > 0).then(|| Duration::from_secs(self.max_call_secs))
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IntelligenceConfig {
    pub long_message_words: usize,
    pub dominant_emotion_threshold: f64,
    pub trend_threshold: f64,
    pub outcome_window: usize,
    /// TOML rules file; the built-in table is used when unset.
    pub risk_rules_file: Option<PathBuf>,
}

impl Default for IntelligenceConfig {
    fn default() -> Self {
        let analytics = AnalyticsSettings::default();
        Self {
            long_message_words: DEFAULT_LONG_MESSAGE_WORDS,
            dominant_emotion_threshold: analytics.dominant_emotion_threshold,
            trend_threshold: analytics.trend_threshold,
            outcome_window: analytics.outcome_window,
            risk_rules_file: None,
        }
    }
}

impl IntelligenceConfig {
    pub fn analytics(&self) -> AnalyticsSettings {
        AnalyticsSettings {
            trend_threshold: self.trend_threshold,
            dominant_emotion_threshold: self.dominant_emotion_threshold,
            outcome_window: self.outcome_window,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DirectoryConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// JSONL root, defaults to `<config dir>/calls`.
    pub dir: Option<PathBuf>,
    /// HTTP persistence endpoint; takes precedence over `dir`.
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HooksConfig {
    pub completion_url: Option<String>,
    /// Upper bound on one completion report delivery.
    pub timeout_secs: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            completion_url: None,
            timeout_secs: 10,
        }
    }
}

impl HooksConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct VonageConfig {
    pub ringback_url: Option<String>,
    /// Append an NCCO `input` action collecting keypad digits.
    pub dtmf_input: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}. Copy config.example.toml to {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file from same directory as config.toml
        let env_path = config_dir().join(".env");
        match dotenvy::from_path(&env_path) {
            Ok(()) => tracing::info!("Loaded .env from {}", env_path.display()),
            Err(dotenvy::Error::Io(_)) => {
                tracing::debug!(
                    "No .env file at {}, using environment only",
                    env_path.display()
                );
            }
            Err(e) => tracing::warn!("Failed to parse .env: {e}"),
        }

        let path = config_path();
        tracing::info!("Loading config from {}", path.display());

        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut config = Self::parse(&contents)?;
        config.apply_env();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Env var overrides for secrets and deployment URLs.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("HUME_API_KEY") {
            self.hume.api_key = v;
        }
        if let Ok(v) = std::env::var("HUME_DEFAULT_CONFIG_ID") {
            self.hume.default_config_id = Some(v);
        }
        if let Ok(v) = std::env::var("SERVER_EXTERNAL_URL") {
            self.server.external_url = v;
        }
        if let Ok(v) = std::env::var("CALL_DIRECTORY_URL") {
            self.directory.url = v;
        }
        if let Ok(v) = std::env::var("COMPLETION_WEBHOOK_URL") {
            self.hooks.completion_url = Some(v);
        }
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.storage
            .dir
            .clone()
            .unwrap_or_else(|| config_dir().join("calls"))
    }
}

fn config_dir() -> PathBuf {
    if let Ok(p) = std::env::var("VOICE_BRIDGE_CONFIG") {
        // If pointing to a file, use its parent directory
        let path = PathBuf::from(p);
        return path.parent().map(|p| p.to_path_buf()).unwrap_or(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".voice-bridge")
}

fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("VOICE_BRIDGE_CONFIG") {
        return PathBuf::from(p);
    }

    config_dir().join("config.toml")
}
