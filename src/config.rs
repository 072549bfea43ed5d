use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Default rollover threshold: records appended to a segment file before the
/// queue seals it and starts a new one.
pub const DEFAULT_ITEMS_PER_SEGMENT: usize = 50;

/// Durability mode applied to segment writes.
///
/// `Strict` forces a filesystem sync after every append and tombstone, so a
/// returned enqueue or dequeue has reached the disk. `Relaxed` defers
/// syncing until an explicit [`crate::Queue::sync`] or a transition back to
/// `Strict`; it trades crash durability of the most recent writes for
/// throughput.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    /// Sync after every mutation (the default).
    #[default]
    Strict,
    /// Defer syncing until requested.
    Relaxed,
}

/// Configuration for opening or creating a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Rollover threshold, counted in records appended to a segment (live
    /// plus tombstoned), not in currently-live records. Must be non-zero.
    pub items_per_segment: usize,
    /// Durability mode the queue starts in.
    pub durability: Durability,
}

impl QueueConfig {
    /// Configuration with the given rollover threshold and strict durability.
    pub fn new(items_per_segment: usize) -> Self {
        Self {
            items_per_segment,
            durability: Durability::Strict,
        }
    }

    /// Replace the durability mode.
    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub(crate) fn validate(&self) -> QueueResult<()> {
        if self.items_per_segment == 0 {
            return Err(QueueError::invalid_config(
                "items_per_segment must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ITEMS_PER_SEGMENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_strict() {
        let config = QueueConfig::default();
        assert_eq!(config.items_per_segment, DEFAULT_ITEMS_PER_SEGMENT);
        assert_eq!(config.durability, Durability::Strict);
    }

    #[test]
    fn zero_rollover_threshold_is_rejected() {
        let err = QueueConfig::new(0).validate().unwrap_err();
        assert!(matches!(err, QueueError::InvalidConfig(_)));
    }

    #[test]
    fn durability_builder_overrides_mode() {
        let config = QueueConfig::new(3).durability(Durability::Relaxed);
        assert_eq!(config.durability, Durability::Relaxed);
        assert!(config.validate().is_ok());
    }
}
