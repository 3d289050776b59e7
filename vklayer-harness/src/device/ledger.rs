//! Bookkeeping of every handle the harness creates on a device.

use ash::vk::{self, Handle};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub object_type: vk::ObjectType,
    pub raw: u64,
    pub label: &'static str,
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} 0x{:x}", self.label, self.object_type, self.raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerViolation {
    /// A handle was released that is not live.
    UnknownRelease { object_type: vk::ObjectType, raw: u64 },
    /// A handle value was recorded twice without a release in between.
    DuplicateCreate(LedgerEntry),
}

impl fmt::Display for LedgerViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerViolation::UnknownRelease { object_type, raw } => {
                write!(f, "released {object_type:?} 0x{raw:x} which is not live (double destroy?)")
            }
            LedgerViolation::DuplicateCreate(entry) => write!(f, "{entry} recorded twice"),
        }
    }
}

/// Live set of `(object type, raw handle)` pairs.
#[derive(Debug, Default)]
pub struct HandleLedger {
    live: HashMap<(vk::ObjectType, u64), &'static str>,
    order: Vec<(vk::ObjectType, u64)>,
    created: usize,
    destroyed: usize,
    violations: Vec<LedgerViolation>,
}

impl HandleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_create<H: Handle>(&mut self, handle: H, label: &'static str) {
        self.record_raw(H::TYPE, handle.as_raw(), label);
    }

    pub fn record_destroy<H: Handle>(&mut self, handle: H) {
        self.release_raw(H::TYPE, handle.as_raw());
    }

    pub fn record_raw(&mut self, object_type: vk::ObjectType, raw: u64, label: &'static str) {
        if raw == 0 {
            return;
        }
        self.created += 1;
        if self.live.insert((object_type, raw), label).is_some() {
            self.violations.push(LedgerViolation::DuplicateCreate(LedgerEntry {
                object_type,
                raw,
                label,
            }));
        } else {
            self.order.push((object_type, raw));
        }
    }

    pub fn release_raw(&mut self, object_type: vk::ObjectType, raw: u64) {
        if raw == 0 {
            return;
        }
        if self.live.remove(&(object_type, raw)).is_some() {
            self.destroyed += 1;
            self.order.retain(|key| *key != (object_type, raw));
        } else {
            self.violations
                .push(LedgerViolation::UnknownRelease { object_type, raw });
        }
    }

    pub fn is_live<H: Handle>(&self, handle: H) -> bool {
        self.live.contains_key(&(H::TYPE, handle.as_raw()))
    }

    /// Live entries in creation order.
    pub fn outstanding(&self) -> Vec<LedgerEntry> {
        self.order
            .iter()
            .filter_map(|key| {
                self.live.get(key).map(|label| LedgerEntry {
                    object_type: key.0,
                    raw: key.1,
                    label,
                })
            })
            .collect()
    }

    pub fn violations(&self) -> &[LedgerViolation] {
        &self.violations
    }

    pub fn counts(&self) -> (usize, usize) {
        (self.created, self.destroyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn balanced_create_destroy_leaves_nothing() {
        let mut ledger = HandleLedger::new();
        let fence = vk::Fence::from_raw(0x10);
        let event = vk::Event::from_raw(0x10);
        ledger.record_create(fence, "fence");
        ledger.record_create(event, "event");
        assert!(ledger.is_live(fence));
        ledger.record_destroy(event);
        ledger.record_destroy(fence);
        assert!(ledger.outstanding().is_empty());
        assert!(ledger.violations().is_empty());
        assert_eq!(ledger.counts(), (2, 2));
    }

    #[test]
    fn leaks_are_reported_in_creation_order() {
        let mut ledger = HandleLedger::new();
        ledger.record_create(vk::Buffer::from_raw(3), "buffer");
        ledger.record_create(vk::Image::from_raw(1), "image");
        ledger.record_create(vk::Sampler::from_raw(2), "sampler");
        ledger.record_destroy(vk::Image::from_raw(1));
        let labels: Vec<&str> = ledger.outstanding().iter().map(|e| e.label).collect();
        assert_eq!(labels, vec!["buffer", "sampler"]);
    }

    #[test]
    fn double_destroy_is_a_violation() {
        let mut ledger = HandleLedger::new();
        let semaphore = vk::Semaphore::from_raw(7);
        ledger.record_create(semaphore, "semaphore");
        ledger.record_destroy(semaphore);
        ledger.record_destroy(semaphore);
        assert_eq!(
            ledger.violations(),
            &[LedgerViolation::UnknownRelease {
                object_type: vk::ObjectType::SEMAPHORE,
                raw: 7
            }]
        );
    }

    #[test]
    fn null_handles_are_ignored() {
        let mut ledger = HandleLedger::new();
        ledger.record_create(vk::Pipeline::null(), "pipeline");
        ledger.record_destroy(vk::Pipeline::null());
        assert_eq!(ledger.counts(), (0, 0));
        assert!(ledger.violations().is_empty());
    }
}
