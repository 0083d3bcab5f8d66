//! Per-platform download slots.
//!
//! Each platform has an independent ceiling (no borrowing across platforms).
//! A slot is reserved with a compare-and-increment on the platform's counter
//! and handed out as a [`SlotToken`]; releasing the token gives the slot back.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::config::PlatformLimits;
use crate::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("slot token {token} for {platform} was already released")]
    DoubleRelease { platform: Platform, token: u64 },
    #[error("no slot ceiling configured for {0}")]
    UnknownPlatform(Platform),
}

/// Capability for one reserved slot. Not cloneable; only the holder can release it.
#[derive(Debug, PartialEq, Eq)]
pub struct SlotToken {
    id: u64,
    platform: Platform,
}

impl SlotToken {
    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
struct SlotCounter {
    max: usize,
    used: AtomicUsize,
}

/// Usage of one platform's slots.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotUsage {
    pub platform: Platform,
    pub slots_used: usize,
    pub max_slots: usize,
    pub utilization: f64,
}

/// Owns the slot counters of every platform.
#[derive(Debug)]
pub struct PlatformSlots {
    counters: HashMap<Platform, SlotCounter>,
    next_token: AtomicU64,
    outstanding: Mutex<HashSet<u64>>,
}

impl PlatformSlots {
    /// Build counters from the configured per-platform ceilings.
    pub fn new(limits: &PlatformLimits) -> Self {
        let counters = limits
            .resolved()
            .into_iter()
            .map(|(platform, max)| {
                (
                    platform,
                    SlotCounter {
                        max,
                        used: AtomicUsize::new(0),
                    },
                )
            })
            .collect();
        Self {
            counters,
            next_token: AtomicU64::new(1),
            outstanding: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve one slot for `platform`, or `None` if the platform is at its ceiling.
    ///
    /// `None` is not an error; the caller should try again later.
    pub fn try_acquire(&self, platform: Platform) -> Option<SlotToken> {
        let counter = self.counters.get(&platform)?;
        let mut current = counter.used.load(Ordering::Relaxed);
        loop {
            if current >= counter.max {
                return None;
            }
            match counter.used.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        tracing::trace!(%platform, token = id, "slot acquired");
        Some(SlotToken { id, platform })
    }

    /// Return the slot held by `token`.
    ///
    /// A token can be released once; a second release is rejected and leaves
    /// the counter untouched.
    pub fn release(&self, token: &SlotToken) -> Result<(), SlotError> {
        let was_outstanding = self
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token.id);
        if !was_outstanding {
            tracing::error!(platform = %token.platform, token = token.id, "double release of slot token");
            return Err(SlotError::DoubleRelease {
                platform: token.platform,
                token: token.id,
            });
        }
        let counter = self
            .counters
            .get(&token.platform)
            .ok_or(SlotError::UnknownPlatform(token.platform))?;
        // Outstanding tokens guarantee used > 0; saturate anyway.
        let _ = counter
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| n.checked_sub(1));
        tracing::trace!(platform = %token.platform, token = token.id, "slot released");
        Ok(())
    }

    pub fn usage(&self, platform: Platform) -> SlotUsage {
        let (used, max) = self
            .counters
            .get(&platform)
            .map_or((0, 0), |c| (c.used.load(Ordering::Relaxed), c.max));
        SlotUsage {
            platform,
            slots_used: used,
            max_slots: max,
            utilization: if max == 0 { 0.0 } else { used as f64 / max as f64 },
        }
    }

    /// Usage of every platform, in `Platform::ALL` order.
    pub fn snapshot(&self) -> Vec<SlotUsage> {
        Platform::ALL.into_iter().map(|p| self.usage(p)).collect()
    }
}
