// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and environment overrides for scriba.
//!
//! This crate provides [`ScribaConfig`], the top-level runtime settings,
//! together with helpers for loading from TOML files, applying `SCRIBA_*`
//! environment overrides, and producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarning {
    /// The JWT secret is a known placeholder value.
    PlaceholderSecret,
    /// The presigned-URL TTL is very short.
    ShortPresignedTtl {
        /// Configured TTL in seconds.
        secs: u64,
    },
    /// The live window is shorter than its configured overlap.
    OverlapExceedsWindow {
        /// Window length in seconds.
        window: f64,
        /// Overlap in seconds.
        overlap: f64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::PlaceholderSecret => {
                write!(f, "jwt_secret is a placeholder value; set a real secret")
            }
            ConfigWarning::ShortPresignedTtl { secs } => {
                write!(f, "blob_presigned_ttl of {secs}s may expire mid-download")
            }
            ConfigWarning::OverlapExceedsWindow { window, overlap } => {
                write!(
                    f,
                    "live_window_overlap_seconds ({overlap}) exceeds live_window_seconds ({window})"
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Selection enums
// ---------------------------------------------------------------------------

/// Which queue backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    /// Try the broker; fall back to in-process for the rest of the process.
    #[default]
    Auto,
    /// Require the broker; fail requests when it is unreachable.
    Broker,
    /// Always use the in-process queue.
    Memory,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "broker" => Ok(Self::Broker),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown queue backend: {other}")),
        }
    }
}

/// Preferred compute device for the speech engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    /// Accelerator when the runtime reports one, CPU otherwise.
    #[default]
    Auto,
    /// Accelerator if available (or forced); CPU with a warning otherwise.
    Accelerator,
    /// CPU always.
    Cpu,
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "accelerator" | "gpu" | "cuda" => Ok(Self::Accelerator),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!("unknown device preference: {other}")),
        }
    }
}

/// Which engine adapter variant to instantiate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineVariantChoice {
    /// Aligned decode with optional diarization.
    Primary,
    /// Single-model, CPU-safe decode.
    #[default]
    Fallback,
    /// Deterministic output for tests and dependency-free deployments.
    Stub,
}

impl FromStr for EngineVariantChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "fallback" => Ok(Self::Fallback),
            "stub" => Ok(Self::Stub),
            other => Err(format!("unknown engine variant: {other}")),
        }
    }
}

/// Voice-activity-detection mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadMode {
    /// Enable when the input's silence ratio exceeds 0.30.
    #[default]
    Auto,
    /// Always on.
    On,
    /// Always off.
    Off,
}

impl FromStr for VadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "on" | "true" | "1" => Ok(Self::On),
            "off" | "false" | "0" => Ok(Self::Off),
            other => Err(format!("unknown vad mode: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Config type
// ---------------------------------------------------------------------------

/// Placeholder secrets that must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["changeme", "secret", "dev-secret", "placeholder"];

/// Top-level runtime configuration for the scriba service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScribaConfig {
    /// HTTP bind address.
    pub bind: String,
    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    pub log_level: String,

    /// Queue backend selection.
    pub queue_backend: QueueBackend,
    /// Broker connection URL (redis).
    pub broker_url: String,
    /// Per-job decode timeout in seconds; 0 disables the timeout.
    pub job_timeout: u64,

    /// Relational catalog URL (sqlite).
    pub database_url: String,

    /// Object-store endpoint; empty selects the local filesystem backend.
    pub blob_endpoint: String,
    /// Object-store region.
    pub blob_region: String,
    /// Object-store access key.
    pub blob_access_key: String,
    /// Object-store secret key.
    pub blob_secret_key: String,
    /// Bucket (or local subdirectory) for uploaded audio.
    pub blob_bucket_audio: String,
    /// Bucket (or local subdirectory) for transcripts.
    pub blob_bucket_transcripts: String,
    /// Presigned-URL lifetime in seconds.
    pub blob_presigned_ttl: u64,
    /// Root directory for the local filesystem backend.
    pub storage_dir: String,

    /// Maximum accepted upload size in megabytes.
    pub max_upload_mb: u64,

    /// Live-session ring length in seconds.
    pub live_window_seconds: f64,
    /// Live-session re-decode overlap in seconds.
    pub live_window_overlap_seconds: f64,
    /// Repeated-hypothesis window in seconds.
    pub live_repeat_window_seconds: f64,
    /// Repeats tolerated inside the window before dropping.
    pub live_repeat_max_duplicates: u32,
    /// Directory holding per-session audio while a live session is open.
    pub live_sessions_root: String,

    /// Default quality profile for submissions that omit one.
    pub quality_profile_default: String,
    /// Engine adapter variant.
    pub engine_variant: EngineVariantChoice,
    /// Preferred compute device.
    pub engine_device: DevicePreference,
    /// Treat the accelerator as present even when the runtime disagrees.
    pub engine_force_accelerator: bool,
    /// Voice-activity-detection mode.
    pub engine_vad: VadMode,
    /// Engine model identifier.
    pub model_size: String,

    /// HMAC secret for JWT signing.
    pub jwt_secret: String,
    /// Token lifetime in minutes.
    pub jwt_expiration_minutes: u64,

    /// Allowed CORS origin, or `*`.
    pub allowed_frontend_origin: String,
}

impl Default for ScribaConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8490".into(),
            log_level: "info".into(),
            queue_backend: QueueBackend::Auto,
            broker_url: "redis://127.0.0.1:6379/0".into(),
            job_timeout: 0,
            database_url: "sqlite://scriba.db".into(),
            blob_endpoint: String::new(),
            blob_region: "us-east-1".into(),
            blob_access_key: String::new(),
            blob_secret_key: String::new(),
            blob_bucket_audio: "audio".into(),
            blob_bucket_transcripts: "transcripts".into(),
            blob_presigned_ttl: 3600,
            storage_dir: "./storage".into(),
            max_upload_mb: 512,
            live_window_seconds: 5.0,
            live_window_overlap_seconds: 1.0,
            live_repeat_window_seconds: 2.0,
            live_repeat_max_duplicates: 3,
            live_sessions_root: "./live_sessions".into(),
            quality_profile_default: "balanced".into(),
            engine_variant: EngineVariantChoice::Fallback,
            engine_device: DevicePreference::Auto,
            engine_force_accelerator: false,
            engine_vad: VadMode::Auto,
            model_size: "large-v2".into(),
            jwt_secret: "changeme".into(),
            jwt_expiration_minutes: 60,
            allowed_frontend_origin: "*".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`ScribaConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, starts from [`ScribaConfig::default()`].
///
/// `SCRIBA_*` environment overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<ScribaConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => ScribaConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Parse a TOML string into a [`ScribaConfig`].
pub fn parse_toml(content: &str) -> Result<ScribaConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Apply `SCRIBA_*` overrides read through `lookup` (injectable for tests).
///
/// Unparseable values are ignored rather than fatal, matching the behavior
/// of an operator exporting a typo'd variable: the file/default value wins.
pub fn apply_env_overrides<F>(config: &mut ScribaConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn set_string(target: &mut String, value: Option<String>) {
        if let Some(v) = value {
            *target = v;
        }
    }
    fn set_parsed<T: FromStr>(target: &mut T, value: Option<String>) {
        if let Some(parsed) = value.and_then(|v| v.parse().ok()) {
            *target = parsed;
        }
    }

    set_string(&mut config.bind, lookup("SCRIBA_BIND"));
    set_string(&mut config.log_level, lookup("SCRIBA_LOG_LEVEL"));
    set_parsed(&mut config.queue_backend, lookup("SCRIBA_QUEUE_BACKEND"));
    set_string(&mut config.broker_url, lookup("SCRIBA_BROKER_URL"));
    set_parsed(&mut config.job_timeout, lookup("SCRIBA_JOB_TIMEOUT"));
    set_string(&mut config.database_url, lookup("SCRIBA_DATABASE_URL"));
    set_string(&mut config.blob_endpoint, lookup("SCRIBA_BLOB_ENDPOINT"));
    set_string(&mut config.blob_region, lookup("SCRIBA_BLOB_REGION"));
    set_string(&mut config.blob_access_key, lookup("SCRIBA_BLOB_ACCESS_KEY"));
    set_string(&mut config.blob_secret_key, lookup("SCRIBA_BLOB_SECRET_KEY"));
    set_string(&mut config.blob_bucket_audio, lookup("SCRIBA_BLOB_BUCKET_AUDIO"));
    set_string(
        &mut config.blob_bucket_transcripts,
        lookup("SCRIBA_BLOB_BUCKET_TRANSCRIPTS"),
    );
    set_parsed(&mut config.blob_presigned_ttl, lookup("SCRIBA_BLOB_PRESIGNED_TTL"));
    set_string(&mut config.storage_dir, lookup("SCRIBA_STORAGE_DIR"));
    set_parsed(&mut config.max_upload_mb, lookup("SCRIBA_MAX_UPLOAD_MB"));
    set_parsed(&mut config.live_window_seconds, lookup("SCRIBA_LIVE_WINDOW_SECONDS"));
    set_parsed(
        &mut config.live_window_overlap_seconds,
        lookup("SCRIBA_LIVE_WINDOW_OVERLAP_SECONDS"),
    );
    set_parsed(
        &mut config.live_repeat_window_seconds,
        lookup("SCRIBA_LIVE_REPEAT_WINDOW_SECONDS"),
    );
    set_parsed(
        &mut config.live_repeat_max_duplicates,
        lookup("SCRIBA_LIVE_REPEAT_MAX_DUPLICATES"),
    );
    set_string(&mut config.live_sessions_root, lookup("SCRIBA_LIVE_SESSIONS_ROOT"));
    set_string(
        &mut config.quality_profile_default,
        lookup("SCRIBA_QUALITY_PROFILE_DEFAULT"),
    );
    set_parsed(&mut config.engine_variant, lookup("SCRIBA_ENGINE_VARIANT"));
    set_parsed(&mut config.engine_device, lookup("SCRIBA_ENGINE_DEVICE"));
    set_parsed(
        &mut config.engine_force_accelerator,
        lookup("SCRIBA_ENGINE_FORCE_ACCELERATOR"),
    );
    set_parsed(&mut config.engine_vad, lookup("SCRIBA_ENGINE_VAD"));
    set_string(&mut config.model_size, lookup("SCRIBA_MODEL_SIZE"));
    set_string(&mut config.jwt_secret, lookup("SCRIBA_JWT_SECRET"));
    set_parsed(
        &mut config.jwt_expiration_minutes,
        lookup("SCRIBA_JWT_EXPIRATION_MINUTES"),
    );
    set_string(
        &mut config.allowed_frontend_origin,
        lookup("SCRIBA_ALLOWED_FRONTEND_ORIGIN"),
    );
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl ScribaConfig {
    /// Validate the configuration.
    ///
    /// Returns advisory warnings on success; collects every hard failure
    /// into a single [`ConfigError::ValidationError`] otherwise.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();

        if self.max_upload_mb < 1 {
            reasons.push("max_upload_mb must be at least 1".to_string());
        }
        if self.blob_presigned_ttl < 60 {
            reasons.push("blob_presigned_ttl must be at least 60 seconds".to_string());
        }
        if self.live_window_seconds <= 0.0 {
            reasons.push("live_window_seconds must be positive".to_string());
        }
        if self.live_window_overlap_seconds < 0.0 {
            reasons.push("live_window_overlap_seconds must be non-negative".to_string());
        }
        if self.live_repeat_window_seconds < 0.0 {
            reasons.push("live_repeat_window_seconds must be non-negative".to_string());
        }
        if self.jwt_secret.trim().is_empty() {
            reasons.push("jwt_secret must not be empty".to_string());
        }
        if self.jwt_expiration_minutes < 1 {
            reasons.push("jwt_expiration_minutes must be at least 1".to_string());
        }
        if self.quality_profile_default.parse::<ProfileNameCheck>().is_err() {
            reasons.push(format!(
                "quality_profile_default must be fast, balanced, or precise (got {})",
                self.quality_profile_default
            ));
        }

        if PLACEHOLDER_SECRETS.contains(&self.jwt_secret.trim().to_ascii_lowercase().as_str()) {
            warnings.push(ConfigWarning::PlaceholderSecret);
        }
        if (60..300).contains(&self.blob_presigned_ttl) {
            warnings.push(ConfigWarning::ShortPresignedTtl {
                secs: self.blob_presigned_ttl,
            });
        }
        if self.live_window_overlap_seconds > self.live_window_seconds {
            warnings.push(ConfigWarning::OverlapExceedsWindow {
                window: self.live_window_seconds,
                overlap: self.live_window_overlap_seconds,
            });
        }

        if reasons.is_empty() {
            Ok(warnings)
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }
}

/// Local parse target so this crate does not depend on scriba-core.
struct ProfileNameCheck;

impl FromStr for ProfileNameCheck {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" | "balanced" | "precise" => Ok(ProfileNameCheck),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(|v| (*v).to_string())
    }

    #[test]
    fn defaults_validate_with_placeholder_warning() {
        let config = ScribaConfig::default();
        let warnings = config.validate().unwrap();
        assert!(warnings.contains(&ConfigWarning::PlaceholderSecret));
    }

    #[test]
    fn toml_roundtrip() {
        let config = ScribaConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let back = parse_toml(&serialized).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = parse_toml("max_upload_mb = 64\nqueue_backend = \"memory\"\n").unwrap();
        assert_eq!(config.max_upload_mb, 64);
        assert_eq!(config.queue_backend, QueueBackend::Memory);
        assert_eq!(config.live_window_seconds, 5.0);
    }

    #[test]
    fn env_overrides_win() {
        let mut config = ScribaConfig::default();
        let env = HashMap::from([
            ("SCRIBA_QUEUE_BACKEND", "broker"),
            ("SCRIBA_MAX_UPLOAD_MB", "32"),
            ("SCRIBA_ENGINE_DEVICE", "cpu"),
            ("SCRIBA_JWT_SECRET", "a-real-secret"),
        ]);
        apply_env_overrides(&mut config, lookup_from(&env));
        assert_eq!(config.queue_backend, QueueBackend::Broker);
        assert_eq!(config.max_upload_mb, 32);
        assert_eq!(config.engine_device, DevicePreference::Cpu);
        assert_eq!(config.jwt_secret, "a-real-secret");
    }

    #[test]
    fn unparseable_env_value_is_ignored() {
        let mut config = ScribaConfig::default();
        let env = HashMap::from([("SCRIBA_MAX_UPLOAD_MB", "lots")]);
        apply_env_overrides(&mut config, lookup_from(&env));
        assert_eq!(config.max_upload_mb, 512);
    }

    #[test]
    fn validation_collects_all_reasons() {
        let mut config = ScribaConfig::default();
        config.max_upload_mb = 0;
        config.blob_presigned_ttl = 10;
        config.jwt_secret = "  ".into();
        config.quality_profile_default = "ultra".into();
        let err = config.validate().unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert_eq!(reasons.len(), 4, "{reasons:?}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn short_ttl_warns_but_passes() {
        let mut config = ScribaConfig::default();
        config.jwt_secret = "real".into();
        config.blob_presigned_ttl = 120;
        let warnings = config.validate().unwrap();
        assert!(matches!(
            warnings.as_slice(),
            [ConfigWarning::ShortPresignedTtl { secs: 120 }]
        ));
    }

    #[test]
    fn overlap_longer_than_window_warns() {
        let mut config = ScribaConfig::default();
        config.jwt_secret = "real".into();
        config.live_window_seconds = 2.0;
        config.live_window_overlap_seconds = 3.0;
        let warnings = config.validate().unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::OverlapExceedsWindow { .. })));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = load_config(Some(Path::new("/nonexistent/scriba.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn device_aliases_parse() {
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Accelerator);
        assert_eq!("cuda".parse::<DevicePreference>().unwrap(), DevicePreference::Accelerator);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }
}
