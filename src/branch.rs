use arrayvec::ArrayVec;

use crate::mem_hash::MemHash;
use crate::registers::RegisterFile;
use crate::xlen::XlenValue;

pub(crate) const BRANCH_LIST_SIZE: usize = 12;

/// Snapshot of the abstract machine at an untaken control-flow edge: the
/// branch target plus copies of the register file and the traced-store hash
/// at the moment the branch was seen. Restoring one of these resumes the
/// crawl on the other side of the fork.
#[derive(Clone)]
pub(crate) struct BranchWorkItem {
    pub addr: XlenValue,
    pub regs: RegisterFile,
    pub mem: MemHash,
}

/// Bounded FIFO of branch snapshots. Consumed items stay in the list so that
/// every distinct target is explored at most once per crawl; once the list is
/// full, further targets are silently dropped.
pub(crate) struct BranchList {
    items: ArrayVec<BranchWorkItem, BRANCH_LIST_SIZE>,
    next: usize,
}

impl BranchList {
    pub fn new() -> Self {
        Self {
            items: ArrayVec::new(),
            next: 0,
        }
    }

    pub fn push(&mut self, addr: XlenValue, regs: &RegisterFile, mem: &MemHash) {
        if self.items.is_full() {
            return;
        }
        if self.items.iter().any(|b| b.addr == addr) {
            return;
        }
        self.items.push(BranchWorkItem {
            addr,
            regs: regs.clone(),
            mem: mem.clone(),
        });
    }

    pub fn take_next(&mut self) -> Option<BranchWorkItem> {
        let item = self.items.get(self.next)?.clone();
        self.next += 1;
        Some(item)
    }
}
