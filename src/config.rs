//! Configuration types for pilot-transfer

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default chunk size: 20 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 20 * 1024 * 1024;

/// Data zone a transfer targets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    /// Staging zone for raw uploads
    #[default]
    Greenroom,
    /// Curated zone
    Core,
}

impl Zone {
    /// Name used by the platform APIs
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Greenroom => "greenroom",
            Zone::Core => "core",
        }
    }

    /// Prefix for the object-storage bucket of a project in this zone
    pub fn bucket_prefix(&self) -> &'static str {
        match self {
            Zone::Greenroom => "gr",
            Zone::Core => "core",
        }
    }

    /// Bucket holding a project's objects in this zone
    pub fn bucket_for(&self, project_code: &str) -> String {
        format!("{}-{}", self.bucket_prefix(), project_code)
    }
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Zone {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "greenroom" | "gr" => Ok(Zone::Greenroom),
            "core" => Ok(Zone::Core),
            other => Err(Error::config(format!("unknown zone '{other}'"), "zone")),
        }
    }
}

/// Platform service locations
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Gateway base URL; the upload and download services hang off it
    #[serde(default)]
    pub base_url: String,

    /// Backend-for-frontend URL (registration, status, resume lookups)
    #[serde(default)]
    pub bff_url: String,

    /// Identity provider realm URL; the token endpoint is `{keycloak_url}/token`
    #[serde(default)]
    pub keycloak_url: String,

    /// Client id the CLI's tokens are issued to
    #[serde(default = "default_device_client_id")]
    pub device_client_id: String,

    /// Value of the `VM-Info` header sent with every request
    #[serde(default)]
    pub vm_info: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            bff_url: String::new(),
            keycloak_url: String::new(),
            device_client_id: default_device_client_id(),
            vm_info: String::new(),
        }
    }
}

impl EndpointConfig {
    /// Upload service base for a zone
    pub fn upload_url(&self, zone: Zone) -> String {
        match zone {
            Zone::Greenroom => format!("{}upload/gr", self.base_url),
            Zone::Core => format!("{}upload/core", self.base_url),
        }
    }

    /// Download service base for a zone (ends with a slash)
    pub fn download_url(&self, zone: Zone) -> String {
        match zone {
            Zone::Greenroom => format!("{}portal/download/gr/", self.base_url),
            Zone::Core => format!("{}portal/download/core/", self.base_url),
        }
    }

    /// Identity provider token endpoint
    pub fn token_url(&self) -> String {
        format!("{}/token", self.keycloak_url)
    }
}

/// Chunking and concurrency settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Size of one upload chunk in bytes (default: 20 MiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Number of chunk workers (default: 1)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Files per pre-registration request (default: 100)
    #[serde(default = "default_upload_batch_size")]
    pub upload_batch_size: usize,

    /// Write buffer used while streaming a download (default: 64 KiB)
    #[serde(default = "default_download_buffer_size")]
    pub download_buffer_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            concurrency: default_concurrency(),
            upload_batch_size: default_upload_batch_size(),
            download_buffer_size: default_download_buffer_size(),
        }
    }
}

/// Retry configuration for transient failures
///
/// Backoff is linear: the wait after attempt `n` is `interval * n`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff interval (default: 1 second)
    #[serde(default = "default_retry_interval", with = "duration_serde")]
    pub interval: Duration,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval: default_retry_interval(),
            jitter: false,
        }
    }
}

/// Access token maintenance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenConfig {
    /// How often the keep-alive refreshes the token (default: 120 seconds)
    #[serde(default = "default_refresh_interval", with = "duration_serde")]
    pub refresh_interval: Duration,

    /// Keep-alive tick (default: 2 seconds)
    #[serde(default = "default_keepalive_tick", with = "duration_serde")]
    pub tick: Duration,

    /// Refresh before a protected call when the token expires within this window
    /// (default: 250 seconds)
    #[serde(default = "default_grace_window", with = "duration_serde")]
    pub grace_window: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            tick: default_keepalive_tick(),
            grace_window: default_grace_window(),
        }
    }
}

/// What to do when a download target already exists
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCollisionAction {
    /// Append " (1)", " (2)", ... to the file name (default)
    #[default]
    Rename,
    /// Replace the existing file
    Overwrite,
    /// Refuse to download
    Skip,
}

/// Download preparation polling and local placement
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Delay between status polls (default: 1 second)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    /// Give up on a preparation job after this long (default: 30 minutes, None = wait forever)
    #[serde(default = "default_max_wait", with = "optional_duration_serde")]
    pub max_wait: Option<Duration>,

    /// Handling of an existing file at the download target (default: rename)
    #[serde(default)]
    pub on_collision: FileCollisionAction,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_wait: default_max_wait(),
            on_collision: FileCollisionAction::default(),
        }
    }
}

/// Main configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Platform service locations
    #[serde(default)]
    pub endpoints: EndpointConfig,

    /// Chunking and concurrency
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Retry policy shared by chunk transport and finalize
    #[serde(default)]
    pub retry: RetryConfig,

    /// Token keep-alive and expiry handling
    #[serde(default)]
    pub token: TokenConfig,

    /// Download preparation polling
    #[serde(default)]
    pub download: DownloadConfig,
}

impl Config {
    /// Build a configuration from the process environment
    ///
    /// A `.env` file in the working directory is loaded first if present.
    /// Recognized variables: `BASE_URL`, `URL_BFF`, `URL_KEYCLOAK`,
    /// `KEYCLOAK_DEVICE_CLIENT_ID`, `VM_INFO`.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            tracing::warn!(error = %e, "Could not read .env file");
        }

        let mut config = Config::default();
        if let Ok(v) = std::env::var("BASE_URL") {
            config.endpoints.base_url = v;
        }
        if let Ok(v) = std::env::var("URL_BFF") {
            config.endpoints.bff_url = v;
        }
        if let Ok(v) = std::env::var("URL_KEYCLOAK") {
            config.endpoints.keycloak_url = v;
        }
        if let Ok(v) = std::env::var("KEYCLOAK_DEVICE_CLIENT_ID") {
            config.endpoints.device_client_id = v;
        }
        if let Ok(v) = std::env::var("VM_INFO") {
            config.endpoints.vm_info = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 {
            return Err(Error::config("chunk size must be positive", "chunk_size"));
        }
        if self.transfer.concurrency == 0 {
            return Err(Error::config(
                "at least one worker is required",
                "concurrency",
            ));
        }
        if self.transfer.upload_batch_size == 0 {
            return Err(Error::config(
                "upload batch size must be positive",
                "upload_batch_size",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config(
                "at least one attempt is required",
                "max_attempts",
            ));
        }
        if self.token.tick.is_zero() {
            return Err(Error::config("keep-alive tick must be positive", "tick"));
        }
        for (key, value) in [
            ("base_url", &self.endpoints.base_url),
            ("bff_url", &self.endpoints.bff_url),
            ("keycloak_url", &self.endpoints.keycloak_url),
        ] {
            if !value.is_empty()
                && let Err(e) = url::Url::parse(value)
            {
                return Err(Error::config(format!("invalid URL {value:?}: {e}"), key));
            }
        }
        Ok(())
    }
}

fn default_device_client_id() -> String {
    "cli".to_string()
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_concurrency() -> usize {
    1
}

fn default_upload_batch_size() -> usize {
    100
}

fn default_download_buffer_size() -> usize {
    64 * 1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(120)
}

fn default_keepalive_tick() -> Duration {
    Duration::from_secs(2)
}

fn default_grace_window() -> Duration {
    Duration::from_secs(250)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_wait() -> Option<Duration> {
    Some(Duration::from_secs(30 * 60))
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_match_platform_constants() {
        let config = Config::default();
        assert_eq!(config.transfer.chunk_size, 20 * 1024 * 1024);
        assert_eq!(config.transfer.upload_batch_size, 100);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.interval, Duration::from_secs(1));
        assert_eq!(config.token.refresh_interval, Duration::from_secs(120));
        assert_eq!(config.token.tick, Duration::from_secs(2));
        assert_eq!(config.token.grace_window, Duration::from_secs(250));
        assert_eq!(config.download.poll_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_json_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.transfer.concurrency, 1);
        assert_eq!(config.download.max_wait, Some(Duration::from_secs(1800)));
    }

    #[test]
    fn device_client_id_default_is_the_same_everywhere() {
        let built = Config::default();
        let empty: Config = serde_json::from_str("{}").unwrap();
        let empty_endpoints: Config = serde_json::from_str(r#"{"endpoints": {}}"#).unwrap();

        assert_eq!(built.endpoints.device_client_id, "cli");
        assert_eq!(empty.endpoints.device_client_id, "cli");
        assert_eq!(empty_endpoints.endpoints.device_client_id, "cli");
        assert_eq!(EndpointConfig::default().device_client_id, "cli");
    }

    #[test]
    fn durations_are_integer_seconds() {
        let json = r#"{"retry": {"interval": 5}, "download": {"max_wait": null}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.retry.interval, Duration::from_secs(5));
        assert_eq!(config.download.max_wait, None);

        let out = serde_json::to_value(&config.retry).unwrap();
        assert_eq!(out["interval"], 5);
    }

    #[test]
    fn duration_serde_rejects_string_instead_of_integer() {
        let json = r#"{"interval": "soon"}"#;
        let result = serde_json::from_str::<RetryConfig>(json);
        assert!(
            result.is_err(),
            "string value for a Duration field must produce a serde error"
        );
    }

    #[test]
    fn validate_rejects_zero_values() {
        let mut config = Config::default();
        config.transfer.chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::Config { key: Some(ref k), .. }) if k == "chunk_size"
        ));

        let mut config = Config::default();
        config.transfer.concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::Config { key: Some(ref k), .. }) if k == "concurrency"
        ));

        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.endpoints.bff_url = "not a url".to_string();
        assert!(matches!(
            config.validate(),
            Err(Error::Config { key: Some(ref k), .. }) if k == "bff_url"
        ));
    }

    #[test]
    fn zone_derives_bucket_and_service_urls() {
        let endpoints = EndpointConfig {
            base_url: "https://pilot.example/".to_string(),
            keycloak_url: "https://id.example/realms/pilot".to_string(),
            ..Default::default()
        };
        assert_eq!(Zone::Greenroom.bucket_for("proj"), "gr-proj");
        assert_eq!(Zone::Core.bucket_for("proj"), "core-proj");
        assert_eq!(
            endpoints.upload_url(Zone::Greenroom),
            "https://pilot.example/upload/gr"
        );
        assert_eq!(
            endpoints.download_url(Zone::Core),
            "https://pilot.example/portal/download/core/"
        );
        assert_eq!(
            endpoints.token_url(),
            "https://id.example/realms/pilot/token"
        );
    }

    #[test]
    fn zone_parses_case_insensitively() {
        assert_eq!("GreenRoom".parse::<Zone>().unwrap(), Zone::Greenroom);
        assert_eq!("core".parse::<Zone>().unwrap(), Zone::Core);
        assert!("archive".parse::<Zone>().is_err());
    }

    #[test]
    #[serial]
    fn from_env_reads_endpoint_variables() {
        // SAFETY: serialized with other environment tests
        unsafe {
            std::env::set_var("URL_BFF", "https://bff.example");
            std::env::set_var("KEYCLOAK_DEVICE_CLIENT_ID", "device-cli");
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.endpoints.bff_url, "https://bff.example");
        assert_eq!(config.endpoints.device_client_id, "device-cli");
        unsafe {
            std::env::remove_var("URL_BFF");
            std::env::remove_var("KEYCLOAK_DEVICE_CLIENT_ID");
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.endpoints.device_client_id, "cli");
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"transfer": {"concurrency": 4}}"#).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.transfer.concurrency, 4);
    }
}
