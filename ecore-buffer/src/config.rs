//! TOML configuration
//!
//! ```toml
//! [queue]
//! name = "ecore-buffer"
//! size = 3
//! format = "AR24"
//! backend = "dri3"
//!
//! [backends.dri3]
//! max_size = "4096"
//!
//! [display]
//! flip_timeout_ms = 500
//! ```

use crate::backend::BackendOptions;
use crate::drm::DisplayOptions;
use crate::format::Format;
use crate::queue::DEFAULT_QUEUE_SIZE;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

fn default_name() -> String {
    "ecore-buffer".to_string()
}

fn default_size() -> u32 {
    DEFAULT_QUEUE_SIZE as u32
}

fn default_dimension() -> u32 {
    64
}

fn default_format() -> Format {
    Format::Xrgb8888
}

fn default_backend() -> String {
    "shm".to_string()
}

fn default_flip_timeout_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_size")]
    pub size: u32,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_format")]
    pub format: Format,
    /// Backend the provider allocates from
    #[serde(default = "default_backend")]
    pub backend: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            size: default_size(),
            width: default_dimension(),
            height: default_dimension(),
            format: default_format(),
            backend: default_backend(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Upper bound on a blocking flip wait; 0 waits forever
    #[serde(default = "default_flip_timeout_ms")]
    pub flip_timeout_ms: u64,
    /// Fabricate a 1920x1080 output when no display is connected
    #[serde(default = "default_true")]
    pub fake_output: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            flip_timeout_ms: default_flip_timeout_ms(),
            fake_output: true,
        }
    }
}

impl DisplayConfig {
    pub fn options(&self) -> DisplayOptions {
        DisplayOptions {
            flip_timeout: match self.flip_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            fake_output: self.fake_output,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    /// Per-backend options, keyed by backend name
    #[serde(default)]
    pub backends: HashMap<String, BackendOptions>,
    #[serde(default)]
    pub display: DisplayConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config = Self::parse(&contents)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.queue.size, 2);
        assert_eq!(config.queue.format, Format::Xrgb8888);
        assert_eq!(
            config.display.options().flip_timeout,
            Some(Duration::from_millis(1000))
        );
        assert!(config.display.fake_output);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
            [queue]
            size = 3
            format = "AR24"
            backend = "dri3"

            [backends.dri3]
            max_size = "4096"

            [display]
            flip_timeout_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.name, "ecore-buffer");
        assert_eq!(config.queue.size, 3);
        assert_eq!(config.queue.width, 64);
        assert_eq!(config.queue.format, Format::Argb8888);
        assert_eq!(config.queue.backend, "dri3");
        assert_eq!(config.backends["dri3"].get("max_size"), Some("4096"));
        assert_eq!(config.display.options().flip_timeout, None);
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(matches!(
            Config::parse("[queue]\nformat = \"QQQQ\""),
            Err(crate::Error::Config(_))
        ));
        assert!(Config::parse("[queue]\nsize = -1").is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Config::load(Path::new("/nonexistent/ecore-buffer.toml")).unwrap_err();
        assert!(matches!(err, crate::Error::Io(_)));
    }
}
