use crate::error::Error;
use crate::xlen::{Xlen, XlenValue};

pub(crate) const MEM_CACHE_SIZE: usize = 8;
const MEM_CACHE_LINE_SIZE: usize = 64;

/// Read access to the stopped process's memory. This is the collaborator
/// interface through which all target reads happen; the unwinder wraps it in
/// a small line cache so that fetching consecutive instructions does not
/// round-trip for every byte.
pub trait ProcessMemory {
    /// Read bytes at `addr` into `buf`. Returns the number of bytes that
    /// could be read, which may be less than `buf.len()` when the range
    /// crosses into an unmapped or protected region. `Err(())` means that
    /// nothing at `addr` is readable.
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<usize, ()>;
}

#[derive(Clone, Copy)]
struct CacheLine {
    addr: u64,
    /// Length of the valid prefix of `data`. Zero marks the line unused.
    valid: usize,
    data: [u8; MEM_CACHE_LINE_SIZE],
}

const EMPTY_LINE: CacheLine = CacheLine {
    addr: 0,
    valid: 0,
    data: [0; MEM_CACHE_LINE_SIZE],
};

/// Read-through view of target memory with a small fully-associative line
/// cache. Lookup scans all lines; replacement is round-robin with its own
/// cursor. A partial line read records the valid prefix length so that later
/// accesses inside the prefix still hit.
///
/// The cache lives for one unwind request only.
pub(crate) struct MemoryReader<'a, M: ProcessMemory> {
    mem: &'a mut M,
    width: Xlen,
    lines: [CacheLine; MEM_CACHE_SIZE],
    replace_idx: usize,
}

impl<'a, M: ProcessMemory> MemoryReader<'a, M> {
    pub fn new(mem: &'a mut M, width: Xlen) -> Self {
        Self {
            mem,
            width,
            lines: [EMPTY_LINE; MEM_CACHE_SIZE],
            replace_idx: 0,
        }
    }

    pub fn read_byte(&mut self, addr: XlenValue) -> Result<u8, Error> {
        if addr.high() != 0 {
            // 128-bit memory addressing is out of scope.
            return Err(Error::InvalidAddress);
        }
        let ca = addr.low();
        if ca == 0 {
            return Err(Error::InvalidAddress);
        }
        for line in &self.lines {
            if let Some(offset) = ca.checked_sub(line.addr) {
                if (offset as usize) < line.valid {
                    return Ok(line.data[offset as usize]);
                }
            }
        }
        let line = &mut self.lines[self.replace_idx];
        self.replace_idx = (self.replace_idx + 1) % MEM_CACHE_SIZE;
        line.addr = ca;
        line.valid = 0;
        match self.mem.read(ca, &mut line.data) {
            Ok(n) if n > 0 => {
                line.valid = n.min(MEM_CACHE_LINE_SIZE);
                Ok(line.data[0])
            }
            _ => Err(Error::CouldNotReadMemory(ca)),
        }
    }

    pub fn read_u32(&mut self, addr: XlenValue) -> Result<u32, Error> {
        let mut n: u32 = 0;
        for i in 0..4 {
            let bt = self.read_byte(addr.add_u64(i, self.width))?;
            n |= u32::from(bt) << (i * 8);
        }
        Ok(n)
    }

    pub fn read_u64(&mut self, addr: XlenValue) -> Result<u64, Error> {
        let mut n: u64 = 0;
        for i in 0..8 {
            let bt = self.read_byte(addr.add_u64(i, self.width))?;
            n |= u64::from(bt) << (i * 8);
        }
        Ok(n)
    }

    pub fn read_u128(&mut self, addr: XlenValue) -> Result<XlenValue, Error> {
        let lo = self.read_u64(addr)?;
        let hi = self.read_u64(addr.add_u64(8, self.width))?;
        Ok(XlenValue::from_parts(lo, hi, self.width))
    }
}
