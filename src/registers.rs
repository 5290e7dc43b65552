use crate::xlen::XlenValue;

/// Number of architectural integer registers tracked by the crawl.
pub(crate) const REG_DATA_SIZE: usize = 32;

/// DWARF register numbers of the two registers the crawl is really about.
pub(crate) const REG_RA: usize = 1;
pub(crate) const REG_SP: usize = 2;

/// How the current contents of an abstract register slot may be used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum Provenance {
    /// No usable value.
    #[default]
    Unknown,
    /// The slot holds the catalog index of a caller-frame register; the
    /// actual contents must be fetched from that frame on demand.
    Frame,
    /// The slot holds a memory address; the register abstractly contains
    /// whatever is stored at that address, not yet materialized. This is how
    /// loads are deferred.
    Addr,
    /// Like `Addr`, but known to be a stack-resident spill. Behaves the same
    /// during tracing; the distinction is kept for result reporting.
    Stack,
    /// A concrete or derived value, usable as data.
    Other,
}

impl Provenance {
    /// Whether the slot carries anything at all. After materialization this
    /// is equivalent to being `Other`.
    #[inline]
    pub fn is_known(self) -> bool {
        self != Provenance::Unknown
    }

    /// Whether the slot is a not-yet-materialized memory reference.
    #[inline]
    pub fn is_deferred(self) -> bool {
        matches!(self, Provenance::Addr | Provenance::Stack)
    }
}

/// One abstract register slot: a 128-bit value plus its provenance.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RegSlot {
    pub value: XlenValue,
    pub origin: Provenance,
}

impl RegSlot {
    pub fn other(value: XlenValue) -> Self {
        RegSlot {
            value,
            origin: Provenance::Other,
        }
    }

    pub fn unknown() -> Self {
        RegSlot::default()
    }
}

/// The abstract register file: one slot per integer register.
///
/// x0 is seeded as (`Other`, 0) and `set` discards writes to it, so the zero
/// register reads as zero at every step of the crawl.
#[derive(Clone)]
pub(crate) struct RegisterFile {
    slots: [RegSlot; REG_DATA_SIZE],
}

impl RegisterFile {
    pub fn new() -> Self {
        let mut slots = [RegSlot::default(); REG_DATA_SIZE];
        slots[0] = RegSlot::other(XlenValue::ZERO);
        Self { slots }
    }

    #[inline]
    pub fn get(&self, r: usize) -> RegSlot {
        self.slots[r]
    }

    #[inline]
    pub fn set(&mut self, r: usize, slot: RegSlot) {
        if r != 0 {
            self.slots[r] = slot;
        }
    }

    /// Forget everything, x0 included. Used when the trace gives up and the
    /// fallback decides what little can still be reported.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.origin = Provenance::Unknown;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::xlen::Xlen;

    #[test]
    fn test_zero_register_is_write_protected() {
        let mut regs = RegisterFile::new();
        regs.set(0, RegSlot::other(XlenValue::from_u64(7, Xlen::Rv64)));
        assert_eq!(regs.get(0).origin, Provenance::Other);
        assert!(regs.get(0).value.is_zero());
        regs.set(5, RegSlot::other(XlenValue::from_u64(7, Xlen::Rv64)));
        assert_eq!(regs.get(5).value.low(), 7);
    }

    #[test]
    fn test_fresh_slots_are_unknown() {
        let regs = RegisterFile::new();
        for r in 1..REG_DATA_SIZE {
            assert_eq!(regs.get(r).origin, Provenance::Unknown);
        }
    }
}
