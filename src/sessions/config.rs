//! Configuration types for sessions.
//!
//! | Config Type | Purpose | Presets |
//! |-------------|---------|---------|
//! | `ProtocolConfig` | Wire protocol, connection maintenance, event queue | `lan()`, `internet()` |
//! | `SyncConfig` | Lockstep engine pacing and eviction | `tolerant()` |
//!
//! # Example
//!
//! ```
//! use lockstep_mesh::{ProtocolConfig, SessionBuilder, SyncConfig};
//! use web_time::Duration;
//!
//! let builder = SessionBuilder::new("alice")
//!     .with_protocol_config(ProtocolConfig::internet())
//!     .with_sync_config(SyncConfig {
//!         stall_timeout: Some(Duration::from_secs(5)),
//!         ..SyncConfig::default()
//!     });
//! ```

use web_time::Duration;

use crate::error::MeshError;

/// Configuration for the connection layer.
///
/// # Forward Compatibility
///
/// New fields may be added to this struct in future versions. Construct it with
/// `..ProtocolConfig::default()`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "ProtocolConfig has no effect unless passed to SessionBuilder::with_protocol_config()"]
pub struct ProtocolConfig {
    /// Version sent in, and required of, every join request.
    ///
    /// Default: 1
    pub protocol_version: u16,

    /// Client tag a joiner sends with its join request. The host hands it to the admission
    /// predicate.
    ///
    /// Default: `"lockstep-mesh"`
    pub client_tag: String,

    /// Largest payload a frame may declare. Frames declaring more are malformed.
    ///
    /// Default: 64 KiB
    pub max_frame_size: usize,

    /// How often an unreachable peer is re-dialed and re-punched.
    ///
    /// Default: 500ms
    pub punch_retry_interval: Duration,

    /// Capacity of the session event queue. When full, the oldest event is dropped.
    ///
    /// Default: 256
    pub event_queue_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            client_tag: "lockstep-mesh".to_owned(),
            max_frame_size: 64 * 1024,
            punch_retry_interval: Duration::from_millis(500),
            event_queue_size: 256,
        }
    }
}

impl ProtocolConfig {
    /// Creates a new `ProtocolConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for a local network: quick retries.
    pub fn lan() -> Self {
        Self {
            punch_retry_interval: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// Preset for peers behind address translation on the open internet: slower retries and a
    /// larger event queue to ride out bursts.
    pub fn internet() -> Self {
        Self {
            punch_retry_interval: Duration::from_secs(1),
            event_queue_size: 1024,
            ..Self::default()
        }
    }

    /// Checks every field for a usable value.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::InvalidRequest`] naming the first offending field.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.client_tag.len() > u8::MAX as usize {
            return Err(MeshError::InvalidRequest {
                info: format!(
                    "client_tag is {} bytes, at most 255 fit a short string",
                    self.client_tag.len()
                ),
            });
        }
        // Smallest useful frame: a full game data batch of one event.
        if self.max_frame_size < 12 || self.max_frame_size > i32::MAX as usize {
            return Err(MeshError::InvalidRequest {
                info: format!(
                    "max_frame_size must be in 12..={}, got {}",
                    i32::MAX,
                    self.max_frame_size
                ),
            });
        }
        if self.punch_retry_interval < Duration::from_millis(1)
            || self.punch_retry_interval > Duration::from_secs(60)
        {
            return Err(MeshError::InvalidRequest {
                info: format!(
                    "punch_retry_interval must be in 1ms..=60s, got {}ms",
                    self.punch_retry_interval.as_millis()
                ),
            });
        }
        if self.event_queue_size == 0 {
            return Err(MeshError::InvalidRequest {
                info: "event_queue_size must be at least 1".to_owned(),
            });
        }
        Ok(())
    }
}

/// Configuration for the lockstep engine.
///
/// # Example
///
/// ```
/// use lockstep_mesh::SyncConfig;
/// use web_time::Duration;
///
/// // Evict any participant that holds up the barrier for ten seconds.
/// let config = SyncConfig {
///     stall_timeout: Some(Duration::from_secs(10)),
///     ..SyncConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "SyncConfig has no effect unless passed to SessionBuilder::with_sync_config()"]
pub struct SyncConfig {
    /// How many locally submitted batches may be waiting on the barrier before `tick` refuses to
    /// submit another. With more than one, participants report states from different frames,
    /// which the divergence check reads as disagreement.
    ///
    /// Default: 1
    pub max_pending_frames: usize,

    /// How long the barrier may wait on one participant before evicting it.
    ///
    /// Default: `None` (wait forever)
    pub stall_timeout: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: 1,
            stall_timeout: None,
        }
    }
}

impl SyncConfig {
    /// Creates a new `SyncConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Evicts participants that stall the barrier for 30 seconds.
    pub fn tolerant() -> Self {
        Self {
            stall_timeout: Some(Duration::from_secs(30)),
            ..Self::default()
        }
    }

    /// Checks every field for a usable value.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::InvalidRequest`] naming the first offending field.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.max_pending_frames == 0 {
            return Err(MeshError::InvalidRequest {
                info: "max_pending_frames must be at least 1".to_owned(),
            });
        }
        if self.stall_timeout == Some(Duration::ZERO) {
            return Err(MeshError::InvalidRequest {
                info: "stall_timeout must be non-zero when set".to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn assert_rejects(result: Result<(), MeshError>, field: &str) {
        match result {
            Err(MeshError::InvalidRequest { info }) => {
                assert!(info.contains(field), "{info} should name {field}");
            },
            other => panic!("expected InvalidRequest for {field}, got {other:?}"),
        }
    }

    #[test]
    fn defaults_and_presets_are_valid() {
        ProtocolConfig::default().validate().unwrap();
        ProtocolConfig::lan().validate().unwrap();
        ProtocolConfig::internet().validate().unwrap();
        SyncConfig::default().validate().unwrap();
        SyncConfig::tolerant().validate().unwrap();
    }

    #[test]
    fn default_values() {
        let config = ProtocolConfig::new();
        assert_eq!(config.protocol_version, 1);
        assert_eq!(config.client_tag, "lockstep-mesh");
        assert_eq!(config.max_frame_size, 65536);
        assert_eq!(SyncConfig::new().max_pending_frames, 1);
        assert_eq!(SyncConfig::new().stall_timeout, None);
    }

    #[test]
    fn protocol_fields_are_checked() {
        assert_rejects(
            ProtocolConfig {
                client_tag: "x".repeat(256),
                ..ProtocolConfig::default()
            }
            .validate(),
            "client_tag",
        );
        assert_rejects(
            ProtocolConfig {
                max_frame_size: 4,
                ..ProtocolConfig::default()
            }
            .validate(),
            "max_frame_size",
        );
        assert_rejects(
            ProtocolConfig {
                punch_retry_interval: Duration::ZERO,
                ..ProtocolConfig::default()
            }
            .validate(),
            "punch_retry_interval",
        );
        assert_rejects(
            ProtocolConfig {
                event_queue_size: 0,
                ..ProtocolConfig::default()
            }
            .validate(),
            "event_queue_size",
        );
    }

    #[test]
    fn sync_fields_are_checked() {
        assert_rejects(
            SyncConfig {
                max_pending_frames: 0,
                ..SyncConfig::default()
            }
            .validate(),
            "max_pending_frames",
        );
        assert_rejects(
            SyncConfig {
                stall_timeout: Some(Duration::ZERO),
                ..SyncConfig::default()
            }
            .validate(),
            "stall_timeout",
        );
    }
}
