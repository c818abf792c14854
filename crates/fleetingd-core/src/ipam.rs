//! `/30` slot allocation inside the configured `/24`.
//!
//! Every VM reserves one slot of four consecutive addresses: network,
//! host-side TAP, guest-side TAP, broadcast. Slot bases walk `0, 4, 8, …` and
//! a base is usable only while a full `/30` still fits below `.255`, which
//! yields exactly 63 slots.
//!
//! The set has no internal locking: both operations are called under the
//! inventory's exclusive lock.

use std::collections::BTreeSet;

use crate::error::{CoreError, Result};

/// Addresses per slot.
pub const SLOT_STRIDE: u8 = 4;

/// Maximum live instances: `floor(255 / 4)`.
pub const MAX_SLOTS: usize = 63;

/// Instance name prefix; the full name is `pool<slot / 4>`.
pub const INSTANCE_PREFIX: &str = "pool";

/// Deterministic name for a slot base.
#[must_use]
pub fn instance_name(slot: u8) -> String {
    format!("{INSTANCE_PREFIX}{}", slot / SLOT_STRIDE)
}

/// The set of reserved slot bases.
#[derive(Debug, Default)]
pub struct SlotSet {
    reserved: BTreeSet<u8>,
}

impl SlotSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reserved slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reserved.len()
    }

    /// Returns true when nothing is reserved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }

    /// Returns true when every slot is reserved.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.reserved.len() >= MAX_SLOTS
    }

    /// Returns true when the base is reserved.
    #[must_use]
    pub fn contains(&self, base: u8) -> bool {
        self.reserved.contains(&base)
    }

    /// Reserves and returns the lowest free slot base.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AddressSpaceExhausted`] when no base is free.
    pub fn allocate(&mut self) -> Result<u8> {
        let mut base: u16 = 0;
        loop {
            if base >= 255 - u16::from(SLOT_STRIDE) {
                return Err(CoreError::AddressSpaceExhausted);
            }

            let candidate = base as u8;
            if !self.reserved.contains(&candidate) {
                self.reserved.insert(candidate);
                return Ok(candidate);
            }

            base += u16::from(SLOT_STRIDE);
        }
    }

    /// Releases a slot base. Releasing a free base is a no-op.
    pub fn release(&mut self, base: u8) {
        self.reserved.remove(&base);
    }

    /// The `/30` CIDR a base stands for, given the `/24` prefix.
    #[must_use]
    pub fn cidr(prefix: &str, base: u8) -> String {
        format!("{prefix}{base}/30")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_lowest_free_first() {
        let mut slots = SlotSet::new();
        assert_eq!(slots.allocate().unwrap(), 0);
        assert_eq!(slots.allocate().unwrap(), 4);
        assert_eq!(slots.allocate().unwrap(), 8);
    }

    #[test]
    fn released_slot_is_reused_before_higher_bases() {
        let mut slots = SlotSet::new();
        for _ in 0..3 {
            slots.allocate().unwrap();
        }

        slots.release(4);
        assert_eq!(slots.allocate().unwrap(), 4);
        assert_eq!(slots.allocate().unwrap(), 12);
    }

    #[test]
    fn capacity_is_sixty_three() {
        let mut slots = SlotSet::new();
        for i in 0..MAX_SLOTS {
            let base = slots.allocate().unwrap();
            assert_eq!(base as usize, i * SLOT_STRIDE as usize);
        }

        assert!(slots.is_full());
        assert!(matches!(
            slots.allocate(),
            Err(CoreError::AddressSpaceExhausted)
        ));
        assert_eq!(slots.len(), MAX_SLOTS);
    }

    #[test]
    fn releasing_a_free_base_is_a_no_op() {
        let mut slots = SlotSet::new();
        slots.release(12);
        assert!(slots.is_empty());
        assert_eq!(slots.allocate().unwrap(), 0);
    }

    #[test]
    fn names_derive_from_slot_over_stride() {
        assert_eq!(instance_name(0), "pool0");
        assert_eq!(instance_name(4), "pool1");
        assert_eq!(instance_name(12), "pool3");
        assert_eq!(instance_name(248), "pool62");
    }

    #[test]
    fn cidr_strings() {
        assert_eq!(SlotSet::cidr("10.0.0.", 8), "10.0.0.8/30");
    }
}
