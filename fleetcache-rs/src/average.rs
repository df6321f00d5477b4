//! Provides a helper which computes the average of a series of durations.
//!
//! This is used to track the execution time of commands and of the loads performed by a
//! [Group](crate::group::Group). Values are recorded in microseconds.
//!
//! An [Average](Average) is internally mutable without needing a mutable reference, as it only
//! relies on atomic counters.
//!
//! # Example
//!
//! ```
//! # use fleetcache::average::Average;
//! let avg = Average::new();
//! avg.add(10);
//! avg.add(20);
//! avg.add(30);
//!
//! assert_eq!(avg.avg(), 20);
//! assert_eq!(avg.count(), 3);
//! ```
use crate::fmt::format_micros;
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

/// Computes the average of all recorded values.
///
/// Note that both counters wrap around on overflow, which would take several hundred thousand
/// years worth of recorded microseconds.
#[derive(Default)]
pub struct Average {
    sum: AtomicU64,
    count: AtomicU64,
}

impl Clone for Average {
    fn clone(&self) -> Self {
        Average {
            sum: AtomicU64::new(self.sum.load(Ordering::Relaxed)),
            count: AtomicU64::new(self.count.load(Ordering::Relaxed)),
        }
    }
}

impl Average {
    /// Creates a new average.
    pub fn new() -> Average {
        Average::default()
    }

    /// Records the given value (in microseconds).
    pub fn add(&self, micros: u64) {
        let _ = self.sum.fetch_add(micros, Ordering::Relaxed);
        let _ = self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total number of recorded values.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Computes the average of all recorded values.
    pub fn avg(&self) -> u64 {
        match self.count() {
            0 => 0,
            count => self.sum.load(Ordering::Relaxed) / count,
        }
    }
}

impl Display for Average {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_micros(self.avg(), f)?;
        write!(f, " ({})", self.count())
    }
}
