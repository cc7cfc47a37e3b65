//! Memory limiter
//!
//! Periodically compares process RSS against the configured limits. In the
//! spike band below the hard limit new batches are refused at the receivers
//! (scrapers pause); above the hard limit the pipeline sheds batches
//! oldest-first. One engagement event is logged per engagement, not per
//! check.

use crate::config::MemoryLimiterConfig;
use crate::utils::ScheduledTask;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryState {
    Normal,
    /// Above the spike threshold: back-pressure receivers
    Busy,
    /// Above the hard limit: shed batches
    Critical,
}

impl MemoryState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            2 => Self::Critical,
            1 => Self::Busy,
            _ => Self::Normal,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Busy => 1,
            Self::Critical => 2,
        }
    }
}

pub struct MemoryLimiter {
    limit_bytes: u64,
    spike_threshold_bytes: u64,
    state: AtomicU8,
    pub shed_batches: AtomicU64,
    pub refused_batches: AtomicU64,
}

impl MemoryLimiter {
    pub fn new(config: &MemoryLimiterConfig) -> Self {
        let limit_bytes = config.limit_mib * 1024 * 1024;
        let spike_threshold_bytes = (config.limit_mib - config.spike_limit_mib) * 1024 * 1024;
        Self {
            limit_bytes,
            spike_threshold_bytes,
            state: AtomicU8::new(MemoryState::Normal.as_u8()),
            shed_batches: AtomicU64::new(0),
            refused_batches: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> MemoryState {
        MemoryState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Receivers consult this before submitting a batch
    pub fn can_accept(&self) -> bool {
        let ok = self.state() == MemoryState::Normal;
        if !ok {
            self.refused_batches.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// The batcher consults this to shed its oldest pending batch
    pub fn should_shed(&self) -> bool {
        self.state() == MemoryState::Critical
    }

    /// Re-evaluate against current RSS; called on the check interval
    pub fn check(&self) {
        let Some(rss) = read_rss_bytes() else {
            return;
        };
        self.apply_rss(rss);
    }

    fn apply_rss(&self, rss: u64) {
        let next = if rss >= self.limit_bytes {
            MemoryState::Critical
        } else if rss >= self.spike_threshold_bytes {
            MemoryState::Busy
        } else {
            MemoryState::Normal
        };

        let prev = MemoryState::from_u8(self.state.swap(next.as_u8(), Ordering::Relaxed));
        if prev == MemoryState::Normal && next != MemoryState::Normal {
            tracing::warn!(
                "Memory limiter engaged: rss {} MiB, threshold {} MiB, state {:?}",
                rss / (1024 * 1024),
                self.spike_threshold_bytes / (1024 * 1024),
                next
            );
        } else if prev != MemoryState::Normal && next == MemoryState::Normal {
            tracing::info!("Memory limiter disengaged: rss back under threshold");
        }
    }
}

/// Resident set size from /proc/self/statm (Linux); None elsewhere
fn read_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}

/// Background task driving the periodic check
pub struct MemoryCheckTask {
    limiter: Arc<MemoryLimiter>,
}

impl MemoryCheckTask {
    pub fn new(limiter: Arc<MemoryLimiter>) -> Self {
        Self { limiter }
    }
}

impl ScheduledTask for MemoryCheckTask {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin(async move {
            self.limiter.check();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit_mib: u64, spike_mib: u64) -> MemoryLimiter {
        MemoryLimiter::new(&MemoryLimiterConfig {
            limit_mib,
            spike_limit_mib: spike_mib,
            check_interval_secs: 5,
        })
    }

    #[test]
    fn test_state_bands() {
        let l = limiter(100, 20); // soft threshold at 80 MiB

        l.apply_rss(50 * 1024 * 1024);
        assert_eq!(l.state(), MemoryState::Normal);
        assert!(l.can_accept());

        l.apply_rss(85 * 1024 * 1024);
        assert_eq!(l.state(), MemoryState::Busy);
        assert!(!l.can_accept());
        assert!(!l.should_shed());

        l.apply_rss(120 * 1024 * 1024);
        assert_eq!(l.state(), MemoryState::Critical);
        assert!(l.should_shed());

        l.apply_rss(10 * 1024 * 1024);
        assert_eq!(l.state(), MemoryState::Normal);
    }

    #[test]
    fn test_refusals_counted() {
        let l = limiter(100, 20);
        l.apply_rss(90 * 1024 * 1024);
        let _ = l.can_accept();
        let _ = l.can_accept();
        assert_eq!(l.refused_batches.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_rss_readable_on_linux() {
        if cfg!(target_os = "linux") {
            assert!(read_rss_bytes().unwrap() > 0);
        }
    }
}
