use crate::error::Error;
use crate::xlen::XlenValue;

pub(crate) const MEM_HASH_SIZE: usize = 61;

#[derive(Clone, Copy, Default)]
struct Slot {
    addr: XlenValue,
    value: XlenValue,
    /// Width of the traced store in bytes. Zero marks the slot free.
    size: u8,
    valid: bool,
}

/// Bounded associative store from target address to the value written there
/// by a traced store instruction. Stack spills land here, and later loads
/// from the same address are served from here instead of target memory.
///
/// Open addressing with linear probing, on purpose: the bounded size is part
/// of the contract. A full table is reported as an overflow error rather than
/// grown, because a dropped store would let a later load read a stale value
/// from target memory as if it were current.
#[derive(Clone)]
pub(crate) struct MemHash {
    slots: [Slot; MEM_HASH_SIZE],
}

impl MemHash {
    pub fn new() -> Self {
        Self {
            slots: [Slot::default(); MEM_HASH_SIZE],
        }
    }

    /// The slot holding `addr`, or the free slot where it would be inserted.
    /// `None` when every slot in the probe sequence holds some other address.
    fn probe(&self, addr: XlenValue) -> Option<usize> {
        let start = (addr.low() % MEM_HASH_SIZE as u64) as usize;
        let mut s = start;
        loop {
            let slot = &self.slots[s];
            if slot.size == 0 || slot.addr == addr {
                return Some(s);
            }
            s += 1;
            if s >= MEM_HASH_SIZE {
                s = 0;
            }
            if s == start {
                return None;
            }
        }
    }

    /// Look up a previously traced store at `addr`. The returned flag tells
    /// whether the entry is usable for a read of `want_bytes`: it must have
    /// been stored from a known value and be at least as wide as the read.
    pub fn read(&self, addr: XlenValue, want_bytes: u64) -> Option<(XlenValue, bool)> {
        let slot = &self.slots[self.probe(addr)?];
        if slot.size != 0 && slot.addr == addr {
            Some((slot.value, slot.valid && u64::from(slot.size) >= want_bytes))
        } else {
            None
        }
    }

    pub fn write(
        &mut self,
        addr: XlenValue,
        value: XlenValue,
        bytes: u64,
        valid: bool,
    ) -> Result<(), Error> {
        let s = self.probe(addr).ok_or(Error::MemoryHashOverflow)?;
        self.slots[s] = Slot {
            addr,
            value,
            size: bytes as u8,
            valid,
        };
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::xlen::Xlen;

    fn addr(a: u64) -> XlenValue {
        XlenValue::from_u64(a, Xlen::Rv64)
    }

    fn val(v: u64) -> XlenValue {
        XlenValue::from_u64(v, Xlen::Rv64)
    }

    #[test]
    fn test_store_then_load() {
        let mut hash = MemHash::new();
        hash.write(addr(0x8000_0040), val(0xdead_beef), 8, true).unwrap();
        assert_eq!(hash.read(addr(0x8000_0040), 8), Some((val(0xdead_beef), true)));
        assert_eq!(hash.read(addr(0x8000_0040), 4), Some((val(0xdead_beef), true)));
        assert_eq!(hash.read(addr(0x8000_0048), 8), None);
    }

    #[test]
    fn test_narrow_store_wide_load() {
        let mut hash = MemHash::new();
        hash.write(addr(0x100), val(0x1234), 4, true).unwrap();
        // The entry is found but not wide enough to satisfy the read.
        assert_eq!(hash.read(addr(0x100), 8), Some((val(0x1234), false)));
    }

    #[test]
    fn test_invalid_store_stays_invalid() {
        let mut hash = MemHash::new();
        hash.write(addr(0x100), XlenValue::ZERO, 8, false).unwrap();
        assert_eq!(hash.read(addr(0x100), 8), Some((XlenValue::ZERO, false)));
    }

    #[test]
    fn test_rewrite_same_address_reuses_slot() {
        let mut hash = MemHash::new();
        for i in 0..MEM_HASH_SIZE as u64 {
            hash.write(addr(0x100 + i), val(i), 1, true).unwrap();
        }
        // The table is full, but updating an existing address still works.
        hash.write(addr(0x100), val(77), 1, true).unwrap();
        assert_eq!(hash.read(addr(0x100), 1), Some((val(77), true)));
    }

    #[test]
    fn test_linear_probing_on_collision() {
        let mut hash = MemHash::new();
        let step = MEM_HASH_SIZE as u64;
        // Same home slot for all three.
        hash.write(addr(0x100), val(1), 8, true).unwrap();
        hash.write(addr(0x100 + step), val(2), 8, true).unwrap();
        hash.write(addr(0x100 + 2 * step), val(3), 8, true).unwrap();
        assert_eq!(hash.read(addr(0x100), 8), Some((val(1), true)));
        assert_eq!(hash.read(addr(0x100 + step), 8), Some((val(2), true)));
        assert_eq!(hash.read(addr(0x100 + 2 * step), 8), Some((val(3), true)));
    }

    #[test]
    fn test_overflow() {
        let mut hash = MemHash::new();
        for i in 0..MEM_HASH_SIZE as u64 {
            hash.write(addr(0x100 + i * 8), val(i), 8, true).unwrap();
        }
        assert_eq!(
            hash.write(addr(0x9000), val(9), 8, true),
            Err(Error::MemoryHashOverflow)
        );
        // A full table is also a miss for addresses it does not hold.
        assert_eq!(hash.read(addr(0x9000), 8), None);
    }
}
