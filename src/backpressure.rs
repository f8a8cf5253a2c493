// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backpressure levels for bounded queues.
//!
//! A queue with `max_pending` set reports how full its pending buffer is as a
//! [`BackpressureLevel`]. Only [`BackpressureLevel::Full`] changes behaviour
//! (see [`OverflowPolicy`](crate::OverflowPolicy)); the lower levels are
//! advisory and exported as a gauge.
//!
//! # Example
//!
//! ```
//! use deferred_queue::BackpressureLevel;
//!
//! let level = BackpressureLevel::from_fill(50, Some(100), 0.7, 0.9);
//! assert_eq!(level, BackpressureLevel::Normal);
//! assert!(level.should_accept_writes());
//!
//! let level = BackpressureLevel::from_fill(95, Some(100), 0.7, 0.9);
//! assert_eq!(level, BackpressureLevel::Critical);
//! assert!(level.should_accept_writes()); // still accepts, flush is overdue
//!
//! let level = BackpressureLevel::from_fill(100, Some(100), 0.7, 0.9);
//! assert!(!level.should_accept_writes());
//!
//! // Unbounded queues never push back
//! let level = BackpressureLevel::from_fill(1_000_000, None, 0.7, 0.9);
//! assert_eq!(level, BackpressureLevel::Normal);
//! ```

/// Fill level of a bounded pending buffer.
///
/// - **Normal** (< warn): accept everything
/// - **Warn** (warn..critical): accept, log once on entry
/// - **Critical** (critical..100%): accept, producers are about to hit the cap
/// - **Full** (100%): overflow policy applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackpressureLevel {
    Normal = 0,
    Warn = 1,
    Critical = 2,
    Full = 3,
}

impl BackpressureLevel {
    /// Calculate level from a fill ratio (0.0 → 1.0)
    #[must_use]
    pub fn from_ratio(ratio: f64, warn: f64, critical: f64) -> Self {
        match ratio {
            r if r >= 1.0 => Self::Full,
            r if r >= critical => Self::Critical,
            r if r >= warn => Self::Warn,
            _ => Self::Normal,
        }
    }

    /// Calculate level from a pending count and optional cap
    #[must_use]
    pub fn from_fill(pending: usize, max_pending: Option<usize>, warn: f64, critical: f64) -> Self {
        match max_pending {
            None => Self::Normal,
            Some(0) => Self::Full,
            Some(max) => Self::from_ratio(pending as f64 / max as f64, warn, critical),
        }
    }

    #[must_use]
    pub fn should_accept_writes(&self) -> bool {
        !matches!(self, Self::Full)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Warn => "Warning - pending buffer filling up",
            Self::Critical => "Critical - pending buffer nearly full",
            Self::Full => "Full - overflow policy in effect",
        }
    }
}

impl std::fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
