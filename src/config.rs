//! Settings consumed by the hub, the watcher and each session.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Tailing configuration.
///
/// Loading it (flags, files, environment) is up to the embedding program;
/// every field has a default so partial documents deserialize fine.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Root directory for log files. Nothing outside it can be tailed.
    pub root: PathBuf,
    /// Tail a newly watched file from this many bytes before its end.
    pub bytes: u64,
    /// Keep this many recent lines per file for new subscribers.
    pub lines: usize,
    /// Split lines longer than this many bytes.
    pub max_line_size: usize,
    /// Seconds to cache the directory listing.
    pub list_cache: u64,
    /// Re-stat watched files periodically instead of using fs notifications.
    pub poll: bool,
    /// Interval between re-stats in polling mode, in milliseconds.
    pub poll_interval: u64,
    /// Log every hub request and session command.
    pub trace: bool,
    /// Capacity of each session's outbound queue. Must be greater than
    /// `lines` so a full replay fits.
    pub client_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root: PathBuf::from("log/"),
            bytes: 5000,
            lines: 100,
            max_line_size: 180,
            list_cache: 2,
            poll: false,
            poll_interval: 250,
            trace: false,
            client_buffer_size: 256,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_line_size == 0 {
            return Err(Error::Config("max_line_size must be at least 1".into()));
        }
        if self.client_buffer_size == 0 {
            return Err(Error::Config(
                "client_buffer_size must be at least 1".into(),
            ));
        }
        // A subscribe queues `Attached` plus the whole replay in one go.
        if self.lines >= self.client_buffer_size {
            return Err(Error::Config(format!(
                "client_buffer_size ({}) must be greater than lines ({})",
                self.client_buffer_size, self.lines
            )));
        }
        if self.poll && self.poll_interval == 0 {
            return Err(Error::Config("poll_interval must be at least 1ms".into()));
        }
        Ok(())
    }

    pub fn list_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.list_cache)
    }

    pub fn watch_mode(&self) -> crate::WatchMode {
        if self.poll {
            crate::WatchMode::Poll(Duration::from_millis(self.poll_interval))
        } else {
            crate::WatchMode::Notify
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"root": "/var/log", "lines": 10}"#).unwrap();

        assert_eq!(config.root, PathBuf::from("/var/log"));
        assert_eq!(config.lines, 10);
        assert_eq!(config.bytes, 5000);
        assert_eq!(config.max_line_size, 180);
        assert_eq!(config.client_buffer_size, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = Config {
            max_line_size: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = Config {
            client_buffer_size: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_requires_room_for_replay() {
        let config = Config {
            lines: 300,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = Config {
            lines: 256,
            client_buffer_size: 256,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = Config {
            lines: 255,
            client_buffer_size: 256,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_watch_mode() {
        let config = Config {
            poll: true,
            poll_interval: 40,
            ..Config::default()
        };
        assert_eq!(
            config.watch_mode(),
            crate::WatchMode::Poll(Duration::from_millis(40))
        );
        assert_eq!(Config::default().watch_mode(), crate::WatchMode::Notify);
    }
}
