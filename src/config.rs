//! Configuration management for crabwhip
//!
//! Settings come from built-in defaults, an optional TOML file and
//! `CRABWHIP__SECTION__KEY` environment variables, in that order.

use crate::auth::{StreamKeyCodec, DEFAULT_PUBLISH_SEGMENT};
use crate::errors::PublishError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "CRABWHIP";

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub endpoint: EndpointConfig,
    pub auth: AuthConfig,
    pub capture: CaptureConfig,
}

/// Where offers are sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// API base URL, e.g. `https://live.example.com/api`
    pub api_base: String,
    /// Path of the WHIP resource under the base
    pub whip_path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8080/api".to_string(),
            whip_path: "/whip".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Segment removed from the navigation path to get the bearer token
    pub publish_segment: String,
    /// Hex HMAC key for stream key signing, falls back to `HMAC_KEY`
    pub hmac_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            publish_segment: DEFAULT_PUBLISH_SEGMENT.to_string(),
            hmac_key: None,
        }
    }
}

/// Capture backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    Native,
    Synthetic,
}

impl Default for CaptureBackend {
    fn default() -> Self {
        if cfg!(feature = "native-capture") {
            CaptureBackend::Native
        } else {
            CaptureBackend::Synthetic
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: CaptureBackend,
    /// Constraint parameters used when none are given on the command line
    pub default_query: String,
}

fn config_error(context: &str, err: impl std::fmt::Display) -> PublishError {
    PublishError::Config(format!("{}: {}", context, err))
}

impl PublisherConfig {
    /// Layer defaults, the TOML file at `path` (if any) and the environment.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, PublishError> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| config_error("Failed to build default config", e))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            let path = path.as_ref();
            log::info!("Loading configuration from {:?}", path);
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: PublisherConfig = builder
            .build()
            .map_err(|e| config_error("Failed to load config", e))?
            .try_deserialize()
            .map_err(|e| config_error("Failed to parse config", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file alone
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, PublishError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| config_error("Failed to read config file", e))?;
        let config: PublisherConfig =
            toml::from_str(&contents).map_err(|e| config_error("Failed to parse config file", e))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), PublishError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| config_error("Failed to create config directory", e))?;
        }

        let toml_string =
            toml::to_string_pretty(self).map_err(|e| config_error("Failed to serialize config", e))?;
        fs::write(path, toml_string).map_err(|e| config_error("Failed to write config file", e))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("crabwhip.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load(Some(Self::default_path())).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), PublishError> {
        let base = url::Url::parse(&self.endpoint.api_base)
            .map_err(|e| config_error("Invalid api_base", e))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(PublishError::Config(format!(
                "api_base must be http or https, got {}",
                base.scheme()
            )));
        }
        if !self.endpoint.whip_path.starts_with('/') {
            return Err(PublishError::Config("whip_path must start with '/'".to_string()));
        }

        if !self.auth.publish_segment.is_empty() && !self.auth.publish_segment.ends_with('/') {
            return Err(PublishError::Config(
                "publish_segment must end with '/'".to_string(),
            ));
        }
        if let Some(key) = &self.auth.hmac_key {
            StreamKeyCodec::from_hex(key)?;
        }

        Ok(())
    }

    /// Full URL offers are posted to.
    pub fn whip_endpoint(&self) -> String {
        format!(
            "{}{}",
            self.endpoint.api_base.trim_end_matches('/'),
            self.endpoint.whip_path
        )
    }

    /// Stream key codec from `auth.hmac_key`, else from `HMAC_KEY`.
    pub fn stream_key_codec(&self) -> Result<StreamKeyCodec, PublishError> {
        let codec = match &self.auth.hmac_key {
            Some(key) => StreamKeyCodec::from_hex(key)?,
            None => StreamKeyCodec::from_env()?,
        };
        Ok(codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = PublisherConfig::default();
        assert_eq!(config.whip_endpoint(), "http://localhost:8080/api/whip");
        assert_eq!(config.auth.publish_segment, "publish/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut bad_base = PublisherConfig::default();
        bad_base.endpoint.api_base = "ftp://example.com".to_string();
        assert!(bad_base.validate().is_err());

        let mut bad_path = PublisherConfig::default();
        bad_path.endpoint.whip_path = "whip".to_string();
        assert!(bad_path.validate().is_err());

        let mut bad_key = PublisherConfig::default();
        bad_key.auth.hmac_key = Some("not-hex".to_string());
        assert!(matches!(bad_key.validate(), Err(PublishError::StreamKey(_))));
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("nested").join("crabwhip.toml");

        let mut config = PublisherConfig::default();
        config.endpoint.api_base = "https://live.example.com/api/".to_string();
        config.capture.default_query = "br=2000".to_string();
        config.save_to_file(&config_path).unwrap();

        let loaded = PublisherConfig::load_from_file(&config_path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.whip_endpoint(), "https://live.example.com/api/whip");
    }

    #[test]
    fn test_layered_load_with_partial_file() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("crabwhip.toml");
        fs::write(
            &config_path,
            "[endpoint]\napi_base = \"https://ingest.example.com/api\"\n\n[capture]\nbackend = \"synthetic\"\n",
        )
        .unwrap();

        let loaded = PublisherConfig::load(Some(&config_path)).unwrap();
        assert_eq!(loaded.endpoint.api_base, "https://ingest.example.com/api");
        assert_eq!(loaded.endpoint.whip_path, "/whip");
        assert_eq!(loaded.capture.backend, CaptureBackend::Synthetic);
    }

    #[test]
    fn test_config_toml_format() {
        let toml_string = toml::to_string_pretty(&PublisherConfig::default()).unwrap();
        assert!(toml_string.contains("[endpoint]"));
        assert!(toml_string.contains("[auth]"));
        assert!(toml_string.contains("[capture]"));
        assert!(toml_string.contains("publish_segment"));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = PublisherConfig::load_from_file("nonexistent_file.toml");
        assert_eq!(result.unwrap(), PublisherConfig::default());
    }
}
