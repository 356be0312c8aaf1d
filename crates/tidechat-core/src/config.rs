//! Centralized Configuration Management
//!
//! This module consolidates all configuration structures used throughout the
//! Tidechat engine to provide a unified, consistent configuration interface.

use core::time::Duration;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Store Configuration
// ----------------------------------------------------------------------------

/// Configuration for the durable local store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file (None = in-memory, for tests)
    pub database_path: Option<PathBuf>,
    /// Maximum number of messages kept in the in-memory timeline per
    /// conversation; older messages remain in SQLite only
    pub max_timeline_messages: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_timeline_messages: 5_000,
        }
    }
}

impl StoreConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            database_path: None,
            max_timeline_messages: 200,
        }
    }
}

// ----------------------------------------------------------------------------
// Retry Configuration
// ----------------------------------------------------------------------------

/// Configuration for offline-queue redrive behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of automatic retry attempts before a message is
    /// permanently marked failed (manual retry remains available)
    pub max_retries: u32,
    /// Initial retry delay
    pub initial_backoff: Duration,
    /// Maximum retry delay (cap for exponential backoff)
    pub max_backoff: Duration,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f32,
    /// Fraction of the delay used as jitter range (0.25 = ±25%)
    pub jitter_ratio: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_ratio: 0.25,
        }
    }
}

impl RetryConfig {
    /// Create configuration optimized for testing (fast retries)
    pub fn testing() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter_ratio: 0.25,
        }
    }
}

// ----------------------------------------------------------------------------
// Reconciler Configuration
// ----------------------------------------------------------------------------

/// Configuration for the remote reconciler and its subscription lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Capacity of the LRU set of recently applied canonical ids used to
    /// absorb replayed listener events
    pub dedup_cache_size: usize,
    /// If the gap since the last applied server timestamp exceeds this,
    /// resubscription performs a full resync instead of a cursor resume
    pub full_resync_gap: Duration,
    /// Consecutive subscription failures tolerated before escalating the
    /// next resubscription to a full resync
    pub max_listener_restarts: u32,
    /// Delay between subscription restart attempts
    pub listener_restart_backoff: Duration,
    /// Buffer size of the per-conversation merge-event channel
    pub event_buffer_size: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            dedup_cache_size: 1_024,
            full_resync_gap: Duration::from_secs(60 * 60 * 24 * 7), // 7 days
            max_listener_restarts: 5,
            listener_restart_backoff: Duration::from_secs(2),
            event_buffer_size: 128, // listener events can be bursty
        }
    }
}

impl ReconcilerConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            dedup_cache_size: 64,
            full_resync_gap: Duration::from_secs(3600),
            max_listener_restarts: 2,
            listener_restart_backoff: Duration::from_millis(10),
            event_buffer_size: 128,
        }
    }
}

// ----------------------------------------------------------------------------
// Presence Configuration
// ----------------------------------------------------------------------------

/// Configuration for the ephemeral typing/presence channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Time-to-live of a typing record
    pub typing_ttl: Duration,
    /// Interval of the periodic sweep that deletes expired records
    pub sweep_interval: Duration,
    /// Local inactivity window after which a scheduled `false` write fires
    pub idle_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            typing_ttl: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(3),
        }
    }
}

impl PresenceConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            typing_ttl: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_millis(50),
        }
    }
}

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Configuration for inter-task channel buffer sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Buffer size for per-conversation command channels
    pub command_buffer_size: usize,
    /// Buffer size for the app-event broadcast channel (UI observers)
    pub app_event_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 32,    // UI commands are infrequent
            app_event_buffer_size: 256, // UI updates need responsiveness
        }
    }
}

impl ChannelConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            command_buffer_size: 100,
            app_event_buffer_size: 1_024,
        }
    }
}

// ----------------------------------------------------------------------------
// Master Configuration
// ----------------------------------------------------------------------------

/// Master configuration struct that consolidates all engine configurations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Durable store configuration
    pub store: StoreConfig,
    /// Offline queue / redrive configuration
    pub retry: RetryConfig,
    /// Reconciler and subscription configuration
    pub reconciler: ReconcilerConfig,
    /// Typing/presence configuration
    pub presence: PresenceConfig,
    /// Channel buffer configuration
    pub channels: ChannelConfig,
}

impl SyncConfig {
    /// Create new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            store: StoreConfig::testing(),
            retry: RetryConfig::testing(),
            reconciler: ReconcilerConfig::testing(),
            presence: PresenceConfig::testing(),
            channels: ChannelConfig::testing(),
        }
    }

    /// Validate the configuration for consistency and feasibility
    pub fn validate(&self) -> Result<(), String> {
        if self.store.max_timeline_messages == 0 {
            return Err("timeline message limit cannot be zero".into());
        }

        if self.retry.max_retries == 0 {
            return Err("max retries cannot be zero".into());
        }
        if self.retry.backoff_multiplier <= 1.0 {
            return Err("backoff multiplier must be greater than 1.0".into());
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err("initial backoff cannot exceed max backoff".into());
        }
        if !(0.0..1.0).contains(&self.retry.jitter_ratio) {
            return Err("jitter ratio must be in [0.0, 1.0)".into());
        }

        if self.reconciler.dedup_cache_size == 0 {
            return Err("dedup cache size cannot be zero".into());
        }
        if self.reconciler.event_buffer_size == 0 {
            return Err("event buffer size cannot be zero".into());
        }

        if self.presence.typing_ttl.is_zero() {
            return Err("typing TTL cannot be zero".into());
        }
        if self.presence.sweep_interval > self.presence.typing_ttl {
            return Err("sweep interval should not exceed typing TTL".into());
        }

        if self.channels.command_buffer_size == 0 {
            return Err("command buffer size cannot be zero".into());
        }
        if self.channels.app_event_buffer_size == 0 {
            return Err("app event buffer size cannot be zero".into());
        }

        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validation() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testing_config_validation() {
        let config = SyncConfig::testing();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_retry_config() {
        let mut config = SyncConfig::default();
        config.retry.backoff_multiplier = 1.0;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.retry.initial_backoff = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_presence_config() {
        let mut config = SyncConfig::default();
        config.presence.sweep_interval = Duration::from_secs(10);
        assert!(config.validate().is_err());
    }
}
