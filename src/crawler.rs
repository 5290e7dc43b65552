use tracing::trace;

use crate::branch::BranchList;
use crate::error::Error;
use crate::frame::{
    read_frame_register, write_frame_register, RegisterDefinition, StackFrameAccess,
};
use crate::location::LocationExpressionCommand;
use crate::mem_hash::MemHash;
use crate::memory::{MemoryReader, ProcessMemory};
use crate::registers::{Provenance, RegSlot, RegisterFile, REG_DATA_SIZE, REG_RA, REG_SP};
use crate::xlen::{Xlen, XlenValue};

/// Instruction budget per explored path.
const MAX_INST: usize = 200;

// Immediate encodings. Each table lists, for immediate bit i, the instruction
// bit that holds it; signed immediates take their sign from the last listed
// bit. Scaled immediates (×4, ×8, ×16, ×2) are scaled at the use site.
const IMM_BITS_W: &[u32] = &[6, 10, 11, 12, 5];
const IMM_BITS_D: &[u32] = &[10, 11, 12, 5, 6];
const IMM_BITS_Q: &[u32] = &[11, 12, 5, 6, 10];

const IMM_BITS_LW_SP: &[u32] = &[4, 5, 6, 12, 2, 3];
const IMM_BITS_LD_SP: &[u32] = &[5, 6, 12, 2, 3, 4];
const IMM_BITS_LQ_SP: &[u32] = &[6, 12, 2, 3, 4, 5];
const IMM_BITS_SW_SP: &[u32] = &[9, 10, 11, 12, 7, 8];
const IMM_BITS_SD_SP: &[u32] = &[10, 11, 12, 7, 8, 9];
const IMM_BITS_SQ_SP: &[u32] = &[11, 12, 7, 8, 9, 10];

const IMM_BITS_JC: &[u32] = &[3, 4, 5, 11, 2, 7, 6, 9, 10, 8, 12];
const IMM_BITS_BC: &[u32] = &[3, 4, 10, 11, 2, 5, 6, 12];

const IMM_BITS_ADDI_SP: &[u32] = &[6, 2, 5, 3, 4, 12];
const IMM_BITS_ADDI_SPN: &[u32] = &[6, 5, 11, 12, 7, 8, 9, 10];
const IMM_BITS_SHIFT: &[u32] = &[2, 3, 4, 5, 6, 12];

const IMM_BITS_S: &[u32] = &[7, 8, 9, 10, 11, 25, 26, 27, 28, 29, 30, 31];
const IMM_BITS_B: &[u32] = &[8, 9, 10, 11, 25, 26, 27, 28, 29, 30, 7, 31];
const IMM_BITS_J: &[u32] = &[
    21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 20, 12, 13, 14, 15, 16, 17, 18, 19, 31,
];

fn get_imm(instr: u32, bits: &[u32]) -> u32 {
    let mut v = 0;
    for (i, &bit) in bits.iter().enumerate() {
        if instr & (1 << bit) != 0 {
            v |= 1 << i;
        }
    }
    v
}

fn get_imm_se(instr: u32, bits: &[u32]) -> i32 {
    let v = get_imm(instr, bits);
    let sign = 1u32 << (bits.len() - 1);
    (v ^ sign).wrapping_sub(sign) as i32
}

/// An ALU result is usable as data only when every source was.
fn combined_origin(a: Provenance, b: Provenance) -> Provenance {
    if a.is_known() && b.is_known() {
        Provenance::Other
    } else {
        Provenance::Unknown
    }
}

/// All state of one unwind request. Created by the entry point, destroyed
/// when it returns; nothing survives across requests.
struct StackCrawler<'a, M: ProcessMemory, F: StackFrameAccess> {
    width: Xlen,
    mem: MemoryReader<'a, M>,
    defs: &'a [RegisterDefinition],
    frame: &'a mut F,
    regs: RegisterFile,
    pc: RegSlot,
    hash: MemHash,
    branches: BranchList,
    trace_return: bool,
    trace_branch: bool,
}

impl<'a, M: ProcessMemory, F: StackFrameAccess> StackCrawler<'a, M, F> {
    /// Resolve a slot's provenance so that its value can be used as data.
    ///
    /// `Frame` slots are fetched from the stopped frame; a failed fetch is an
    /// error on the top frame and degrades to `Unknown` further down.
    /// `Addr`/`Stack` slots are read from memory at their referent; a failed
    /// read degrades to `Unknown`.
    fn materialize_slot(&mut self, slot: &mut RegSlot) -> Result<(), Error> {
        match slot.origin {
            Provenance::Unknown | Provenance::Other => Ok(()),
            Provenance::Frame => {
                let defs = self.defs;
                let def = &defs[slot.value.low() as usize];
                match read_frame_register(self.frame, def, self.width) {
                    Ok(v) => {
                        *slot = RegSlot::other(v);
                        Ok(())
                    }
                    Err(e) => {
                        if self.frame.is_top_frame() {
                            return Err(e);
                        }
                        slot.origin = Provenance::Unknown;
                        Ok(())
                    }
                }
            }
            Provenance::Addr | Provenance::Stack => {
                let addr = slot.value;
                if self.load_slot(addr, slot, self.width.bits()).is_err() {
                    *slot = RegSlot::unknown();
                }
                Ok(())
            }
        }
    }

    fn chk_loaded(&mut self, r: usize) -> Result<(), Error> {
        let mut slot = self.regs.get(r);
        self.materialize_slot(&mut slot)?;
        self.regs.set(r, slot);
        Ok(())
    }

    /// Fill `slot` with the `bits`-wide value at `addr`: from the
    /// traced-store hash when the address was stored to on this path,
    /// otherwise from target memory.
    fn load_slot(&mut self, addr: XlenValue, slot: &mut RegSlot, bits: u32) -> Result<(), Error> {
        if let Some((v, valid)) = self.hash.read(addr, u64::from(bits / 8)) {
            *slot = if valid {
                RegSlot::other(v)
            } else {
                RegSlot::unknown()
            };
            return Ok(());
        }
        *slot = RegSlot::unknown();
        let v = match bits {
            32 => XlenValue::from_u64(u64::from(self.mem.read_u32(addr)?), self.width),
            64 => XlenValue::from_u64(self.mem.read_u64(addr)?, self.width),
            _ => self.mem.read_u128(addr)?,
        };
        *slot = RegSlot::other(v);
        Ok(())
    }

    /// A traced load into register `r`. A load of the full register width is
    /// deferred: the slot just remembers the address, tagged `deferred_as`
    /// (`Stack` for sp-relative loads, `Addr` otherwise), so that a value
    /// which is never consumed can later be reported as a location instead.
    /// Narrow loads read memory immediately; if that fails, the register is
    /// simply unknown from here on.
    fn load_reg_lazy(&mut self, addr: XlenValue, r: usize, bits: u32, deferred_as: Provenance) {
        debug_assert!(deferred_as.is_deferred());
        if let Some((v, valid)) = self.hash.read(addr, u64::from(bits / 8)) {
            let slot = if valid {
                RegSlot::other(v)
            } else {
                RegSlot::unknown()
            };
            self.regs.set(r, slot);
            return;
        }
        if bits == self.width.bits() {
            self.regs.set(
                r,
                RegSlot {
                    value: addr,
                    origin: deferred_as,
                },
            );
            return;
        }
        let mut slot = RegSlot::unknown();
        let _ = self.load_slot(addr, &mut slot, bits);
        self.regs.set(r, slot);
    }

    /// A traced store of register `r`.
    fn store_reg(&mut self, addr: XlenValue, r: usize, bits: u32) -> Result<(), Error> {
        self.chk_loaded(r)?;
        let slot = self.regs.get(r);
        debug_assert!(matches!(
            slot.origin,
            Provenance::Unknown | Provenance::Other
        ));
        self.mem_hash_write(addr, slot.value, u64::from(bits / 8), slot.origin.is_known())
    }

    fn mem_hash_write(
        &mut self,
        addr: XlenValue,
        value: XlenValue,
        bytes: u64,
        valid: bool,
    ) -> Result<(), Error> {
        // Materialize any deferred register whose referent overlaps the
        // bytes about to be written; afterwards the old contents are gone.
        let write_end = addr.add_u64(bytes, self.width);
        for r in 0..REG_DATA_SIZE {
            let slot = self.regs.get(r);
            if !slot.origin.is_deferred() {
                continue;
            }
            if slot.value >= write_end {
                continue;
            }
            if slot.value.add_u64(self.width.bytes(), self.width) <= addr {
                continue;
            }
            let mut slot = slot;
            let referent = slot.value;
            if self.load_slot(referent, &mut slot, self.width.bits()).is_err() {
                slot = RegSlot::unknown();
            }
            self.regs.set(r, slot);
        }
        self.hash.write(addr, value, bytes, valid)
    }

    fn add_branch(&mut self, addr: XlenValue) {
        self.branches.push(addr, &self.regs, &self.hash);
    }

    fn set_alu_result(&mut self, rd: usize, value: XlenValue, origin: Provenance) {
        self.regs.set(rd, RegSlot { value, origin });
    }

    /// Compressed quadrants shared by every width.
    fn step_rv32c(&mut self, instr: u32) -> Result<(), Error> {
        let width = self.width;

        // Quadrant 0
        if instr & 0xffff == 0x0000 {
            return Err(Error::IllegalInstruction);
        }
        if instr & 0xe003 == 0x0000 {
            // c.addi4spn
            let imm = get_imm(instr, IMM_BITS_ADDI_SPN);
            if imm != 0 {
                let rd = ((instr >> 2) & 0x7) as usize + 8;
                self.chk_loaded(REG_SP)?;
                let sp = self.regs.get(REG_SP);
                self.set_alu_result(rd, sp.value.add_u64(u64::from(imm) * 4, width), sp.origin);
                return Ok(());
            }
        }
        if instr & 0x6003 == 0x2000 {
            // FP registers are not traced
            return Ok(());
        }
        if instr & 0x6003 == 0x4000 {
            // c.lw / c.sw
            let rd = ((instr >> 2) & 0x7) as usize + 8;
            let rs = ((instr >> 7) & 0x7) as usize + 8;
            let is_load = instr & 0x8000 == 0;
            self.chk_loaded(rs)?;
            let base = self.regs.get(rs);
            if base.origin.is_known() {
                let imm = get_imm(instr, IMM_BITS_W);
                let addr = base.value.add_u64(u64::from(imm) * 4, width);
                if is_load {
                    self.load_reg_lazy(addr, rd, 32, Provenance::Addr);
                } else {
                    self.store_reg(addr, rd, 32)?;
                }
                return Ok(());
            }
            if is_load {
                self.regs.set(rd, RegSlot::unknown());
            }
            return Ok(());
        }
        if instr & 0x6003 == 0x6000 {
            // FP registers are not traced
            return Ok(());
        }

        // Quadrant 1
        if instr & 0xef83 == 0x0001 {
            // c.nop
            return Ok(());
        }
        if instr & 0xe003 == 0x0001 {
            // c.addi
            let rd = ((instr >> 7) & 0x1f) as usize;
            if rd != 0 {
                let imm = get_imm_se(instr, IMM_BITS_SHIFT);
                self.chk_loaded(rd)?;
                let slot = self.regs.get(rd);
                self.set_alu_result(rd, slot.value.add_i32(imm, width), slot.origin);
                return Ok(());
            }
        }
        if instr & 0x6003 == 0x2001 {
            if instr & 0x8000 == 0 {
                // c.jal: the call is followed, the link register write is the
                // only visible effect.
                let ra = RegSlot {
                    value: self.pc.value.add_u64(2, width),
                    origin: self.pc.origin,
                };
                self.regs.set(REG_RA, ra);
            } else {
                // c.j: taken unconditional branch, continue at the target.
                let imm = get_imm_se(instr, IMM_BITS_JC);
                self.add_branch(self.pc.value.add_i32(imm << 1, width));
                self.trace_branch = true;
            }
            return Ok(());
        }
        if instr & 0xe003 == 0x4001 {
            // c.li
            let rd = ((instr >> 7) & 0x1f) as usize;
            if rd != 0 {
                let imm = get_imm_se(instr, IMM_BITS_SHIFT);
                self.set_alu_result(rd, XlenValue::from_i64(imm.into(), width), Provenance::Other);
                return Ok(());
            }
        }
        if instr & 0xe003 == 0x6001 {
            let rd = ((instr >> 7) & 0x1f) as usize;
            if rd == REG_SP {
                // c.addi16sp
                let imm = get_imm_se(instr, IMM_BITS_ADDI_SP);
                if imm != 0 {
                    let sp = self.regs.get(REG_SP);
                    self.set_alu_result(REG_SP, sp.value.add_i32(imm << 4, width), sp.origin);
                    return Ok(());
                }
            }
            if rd != 0 {
                // c.lui
                let imm = get_imm_se(instr, IMM_BITS_SHIFT);
                if imm != 0 {
                    let v = XlenValue::from_i64(i64::from(imm) << 12, width);
                    self.set_alu_result(rd, v, Provenance::Other);
                    return Ok(());
                }
            }
        }
        if instr & 0xe003 == 0x8001 {
            let rd = ((instr >> 7) & 0x7) as usize + 8;
            let func = (instr >> 10) & 3;
            if func < 2 {
                // c.srli / c.srai
                let mut imm = get_imm(instr, IMM_BITS_SHIFT);
                if width == Xlen::Rv32 && imm >= 32 {
                    return Ok(());
                }
                if imm == 0 {
                    // Shift-by-zero encodes a 64-bit shift on RV128.
                    if width == Xlen::Rv128 {
                        imm = 64;
                    } else {
                        return Ok(());
                    }
                }
                self.chk_loaded(rd)?;
                let slot = self.regs.get(rd);
                let value = if func != 0 {
                    slot.value.sar(imm, width)
                } else {
                    slot.value.shr(imm, width)
                };
                self.set_alu_result(rd, value, slot.origin);
            } else if func == 2 {
                // c.andi
                let imm = get_imm_se(instr, IMM_BITS_SHIFT);
                self.chk_loaded(rd)?;
                let slot = self.regs.get(rd);
                let value = slot.value.bitand(XlenValue::from_i64(imm.into(), width));
                self.set_alu_result(rd, value, slot.origin);
            } else if instr & (1 << 12) == 0 {
                // c.sub / c.xor / c.or / c.and
                let rs = ((instr >> 2) & 0x7) as usize + 8;
                self.chk_loaded(rd)?;
                self.chk_loaded(rs)?;
                let a = self.regs.get(rd);
                let b = self.regs.get(rs);
                let value = match (instr >> 5) & 3 {
                    0 => a.value.wrapping_sub(b.value, width),
                    1 => a.value.bitxor(b.value),
                    2 => a.value.bitor(b.value),
                    _ => a.value.bitand(b.value),
                };
                self.set_alu_result(rd, value, combined_origin(a.origin, b.origin));
            }
            return Ok(());
        }
        if instr & 0xc003 == 0xc001 {
            // c.beqz / c.bnez: queue the target, fall through.
            let imm = get_imm_se(instr, IMM_BITS_BC);
            self.add_branch(self.pc.value.add_i32(imm << 1, width));
            return Ok(());
        }

        // Quadrant 2
        if instr & 0xe003 == 0x4002 {
            // c.lwsp
            let rd = ((instr >> 7) & 0x1f) as usize;
            if rd != 0 {
                self.chk_loaded(REG_SP)?;
                let sp = self.regs.get(REG_SP);
                if sp.origin.is_known() {
                    let imm = get_imm(instr, IMM_BITS_LW_SP);
                    self.load_reg_lazy(sp.value.add_u64(u64::from(imm) * 4, width), rd, 32, Provenance::Stack);
                    return Ok(());
                }
                self.regs.set(rd, RegSlot::unknown());
                return Ok(());
            }
        }
        if instr & 0xe003 == 0x6002 {
            // FP registers are not traced
            return Ok(());
        }
        if instr & 0xe003 == 0x2002 {
            // FP registers are not traced
            return Ok(());
        }
        if instr & 0xe003 == 0xc002 {
            // c.swsp
            let rs2 = ((instr >> 2) & 0x1f) as usize;
            self.chk_loaded(REG_SP)?;
            let sp = self.regs.get(REG_SP);
            if sp.origin.is_known() {
                let imm = get_imm(instr, IMM_BITS_SW_SP);
                self.store_reg(sp.value.add_u64(u64::from(imm) * 4, width), rs2, 32)?;
            }
            return Ok(());
        }
        if instr & 0xe003 == 0xe002 {
            // FP registers are not traced
            return Ok(());
        }
        if instr & 0xe003 == 0xa002 {
            // FP registers are not traced
            return Ok(());
        }
        if instr & 0xe003 == 0x0002 {
            // c.slli
            let rd = ((instr >> 7) & 0x1f) as usize;
            if rd != 0 {
                let mut imm = get_imm(instr, IMM_BITS_SHIFT);
                if width == Xlen::Rv32 && imm >= 32 {
                    return Ok(());
                }
                if imm == 0 {
                    if width == Xlen::Rv128 {
                        imm = 64;
                    } else {
                        return Ok(());
                    }
                }
                self.chk_loaded(rd)?;
                let slot = self.regs.get(rd);
                self.set_alu_result(rd, slot.value.shl(imm, width), slot.origin);
                return Ok(());
            }
        }
        if instr & 0xe003 == 0x8002 {
            let rd = ((instr >> 7) & 0x1f) as usize;
            let rs = ((instr >> 2) & 0x1f) as usize;
            if instr & (1 << 12) == 0 {
                if rd == 0 {
                    return Ok(());
                }
                if rs == 0 {
                    // c.jr
                    if rd == REG_RA {
                        // Function return: the caller resumes at ra.
                        self.chk_loaded(REG_RA)?;
                        self.pc = self.regs.get(REG_RA);
                        self.trace_return = true;
                        return Ok(());
                    }
                    self.chk_loaded(rd)?;
                    let target = self.regs.get(rd);
                    if target.origin.is_known() {
                        self.add_branch(target.value);
                    }
                    self.trace_branch = true;
                    return Ok(());
                }
                // c.mv
                self.chk_loaded(rs)?;
                let slot = self.regs.get(rs);
                self.regs.set(rd, slot);
                return Ok(());
            }
            if rd == 0 && rs == 0 {
                // c.ebreak
                return Ok(());
            }
            if rd == 0 {
                return Ok(());
            }
            if rs == 0 {
                // c.jalr: the call is followed, ra is the only effect.
                let ra = RegSlot {
                    value: self.pc.value.add_u64(2, width),
                    origin: self.pc.origin,
                };
                self.regs.set(REG_RA, ra);
                return Ok(());
            }
            // c.add
            self.chk_loaded(rd)?;
            self.chk_loaded(rs)?;
            let a = self.regs.get(rd);
            let b = self.regs.get(rs);
            self.set_alu_result(
                rd,
                a.value.wrapping_add(b.value, width),
                combined_origin(a.origin, b.origin),
            );
            return Ok(());
        }

        Ok(())
    }

    /// RV64-specific compressed encodings; everything else chains to the
    /// RV32 layer.
    fn step_rv64c(&mut self, instr: u32) -> Result<(), Error> {
        let width = self.width;
        if instr & 0xe003 == 0x2001 {
            // c.addiw
            let rd = ((instr >> 7) & 0x1f) as usize;
            if rd != 0 {
                let imm = get_imm_se(instr, IMM_BITS_SHIFT);
                self.chk_loaded(rd)?;
                let slot = self.regs.get(rd);
                self.set_alu_result(rd, slot.value.add_i32(imm, width), slot.origin);
                return Ok(());
            }
        }
        if instr & 0xe003 == 0x6002 {
            // c.ldsp
            let rd = ((instr >> 7) & 0x1f) as usize;
            if rd != 0 {
                self.chk_loaded(REG_SP)?;
                let sp = self.regs.get(REG_SP);
                if sp.origin.is_known() {
                    let imm = get_imm(instr, IMM_BITS_LD_SP);
                    self.load_reg_lazy(sp.value.add_u64(u64::from(imm) * 8, width), rd, 64, Provenance::Stack);
                    return Ok(());
                }
                self.regs.set(rd, RegSlot::unknown());
                return Ok(());
            }
        }
        if instr & 0xe003 == 0xe002 {
            // c.sdsp
            let rs2 = ((instr >> 2) & 0x1f) as usize;
            self.chk_loaded(REG_SP)?;
            let sp = self.regs.get(REG_SP);
            if sp.origin.is_known() {
                let imm = get_imm(instr, IMM_BITS_SD_SP);
                self.store_reg(sp.value.add_u64(u64::from(imm) * 8, width), rs2, 64)?;
            }
            return Ok(());
        }
        if instr & 0x6003 == 0x6000 {
            // c.ld / c.sd
            let rd = ((instr >> 2) & 0x7) as usize + 8;
            let rs = ((instr >> 7) & 0x7) as usize + 8;
            let is_load = instr & 0x8000 == 0;
            self.chk_loaded(rs)?;
            let base = self.regs.get(rs);
            if base.origin.is_known() {
                let imm = get_imm(instr, IMM_BITS_D);
                let addr = base.value.add_u64(u64::from(imm) * 8, width);
                if is_load {
                    self.load_reg_lazy(addr, rd, 64, Provenance::Addr);
                } else {
                    self.store_reg(addr, rd, 64)?;
                }
                return Ok(());
            }
            if is_load {
                self.regs.set(rd, RegSlot::unknown());
            }
            return Ok(());
        }
        if instr & 0xfc03 == 0x9c01 {
            // c.subw / c.addw
            let rd = ((instr >> 7) & 0x7) as usize + 8;
            let rs = ((instr >> 2) & 0x7) as usize + 8;
            self.chk_loaded(rd)?;
            self.chk_loaded(rs)?;
            let a = self.regs.get(rd);
            let b = self.regs.get(rs);
            let value = match (instr >> 5) & 3 {
                0 => a.value.wrapping_sub(b.value, width),
                1 => a.value.wrapping_add(b.value, width),
                _ => return Ok(()),
            };
            self.set_alu_result(rd, value, combined_origin(a.origin, b.origin));
            return Ok(());
        }
        self.step_rv32c(instr)
    }

    /// RV128-specific compressed encodings; everything else chains to the
    /// RV64 layer.
    fn step_rv128c(&mut self, instr: u32) -> Result<(), Error> {
        let width = self.width;
        if instr & 0xe003 == 0x2002 {
            // c.lqsp
            let rd = ((instr >> 7) & 0x1f) as usize;
            if rd != 0 {
                self.chk_loaded(REG_SP)?;
                let sp = self.regs.get(REG_SP);
                if sp.origin.is_known() {
                    let imm = get_imm(instr, IMM_BITS_LQ_SP);
                    self.load_reg_lazy(sp.value.add_u64(u64::from(imm) * 16, width), rd, 128, Provenance::Stack);
                    return Ok(());
                }
                self.regs.set(rd, RegSlot::unknown());
                return Ok(());
            }
        }
        if instr & 0xe003 == 0xa002 {
            // c.sqsp
            let rs2 = ((instr >> 2) & 0x1f) as usize;
            self.chk_loaded(REG_SP)?;
            let sp = self.regs.get(REG_SP);
            if sp.origin.is_known() {
                let imm = get_imm(instr, IMM_BITS_SQ_SP);
                self.store_reg(sp.value.add_u64(u64::from(imm) * 16, width), rs2, 128)?;
            }
            return Ok(());
        }
        if instr & 0x6003 == 0x2000 {
            // c.lq / c.sq
            let rd = ((instr >> 2) & 0x7) as usize + 8;
            let rs = ((instr >> 7) & 0x7) as usize + 8;
            let is_load = instr & 0x8000 == 0;
            self.chk_loaded(rs)?;
            let base = self.regs.get(rs);
            if base.origin.is_known() {
                let imm = get_imm(instr, IMM_BITS_Q);
                let addr = base.value.add_u64(u64::from(imm) * 16, width);
                if is_load {
                    self.load_reg_lazy(addr, rd, 128, Provenance::Addr);
                } else {
                    self.store_reg(addr, rd, 128)?;
                }
                return Ok(());
            }
            if is_load {
                self.regs.set(rd, RegSlot::unknown());
            }
            return Ok(());
        }
        self.step_rv64c(instr)
    }

    /// Base 32-bit encodings shared by every width.
    fn step_rv32(&mut self, instr: u32) -> Result<(), Error> {
        let width = self.width;
        let rs2 = ((instr >> 20) & 0x1f) as usize;
        let rs1 = ((instr >> 15) & 0x1f) as usize;
        let rd = ((instr >> 7) & 0x1f) as usize;
        let funct3 = (instr >> 12) & 7;
        match instr & 0x7f {
            0x37 => {
                // lui
                if rd != 0 {
                    let imm = (instr & 0xffff_f000) as i32;
                    self.set_alu_result(rd, XlenValue::from_i64(imm.into(), width), Provenance::Other);
                }
            }
            0x17 => {
                // auipc
                if rd != 0 {
                    let imm = (instr & 0xffff_f000) as i32;
                    self.set_alu_result(rd, self.pc.value.add_i32(imm, width), Provenance::Other);
                }
            }
            0x6f => {
                // jal
                if rd == 0 {
                    let imm = get_imm_se(instr, IMM_BITS_J);
                    self.add_branch(self.pc.value.add_i32(imm << 1, width));
                    self.trace_branch = true;
                } else {
                    // A call; it is followed, so only ra changes.
                    let link = RegSlot {
                        value: self.pc.value.add_u64(4, width),
                        origin: self.pc.origin,
                    };
                    self.regs.set(rd, link);
                }
            }
            0x67 if funct3 == 0 => {
                // jalr
                let imm = (instr as i32) >> 20;
                if rd == 0 {
                    if rs1 == REG_RA && imm == 0 {
                        // Function return: the caller resumes at ra.
                        self.chk_loaded(REG_RA)?;
                        self.pc = self.regs.get(REG_RA);
                        self.trace_return = true;
                        return Ok(());
                    }
                    self.chk_loaded(rs1)?;
                    let base = self.regs.get(rs1);
                    if base.origin.is_known() {
                        let target = base
                            .value
                            .add_i32(imm, width)
                            .bitand(XlenValue::from_i64(-2, width));
                        self.add_branch(target);
                    }
                    self.trace_branch = true;
                } else {
                    let link = RegSlot {
                        value: self.pc.value.add_u64(4, width),
                        origin: self.pc.origin,
                    };
                    self.regs.set(rd, link);
                }
            }
            0x63 if funct3 != 2 && funct3 != 3 => {
                // beq / bne / blt / bge / bltu / bgeu: queue the target,
                // fall through.
                let imm = get_imm_se(instr, IMM_BITS_B);
                self.add_branch(self.pc.value.add_i32(imm << 1, width));
            }
            0x03 => {
                // Loads. Only a load of the full register width can be
                // deferred; any other width would need extension semantics
                // the tracer does not model, so the destination is unknown.
                if rd == 0 {
                    return Ok(());
                }
                let imm = (instr as i32) >> 20;
                self.chk_loaded(rs1)?;
                let base = self.regs.get(rs1);
                if base.origin.is_known() && funct3 == 2 && width == Xlen::Rv32 {
                    self.load_reg_lazy(base.value.add_i32(imm, width), rd, 32, Provenance::Addr);
                } else {
                    self.regs.set(rd, RegSlot::unknown());
                }
            }
            0x23 => {
                // sb / sh / sw
                let bits = match funct3 {
                    0 => 8,
                    1 => 16,
                    2 => 32,
                    _ => return Ok(()),
                };
                let imm = get_imm_se(instr, IMM_BITS_S);
                self.chk_loaded(rs1)?;
                let base = self.regs.get(rs1);
                if base.origin.is_known() {
                    self.store_reg(base.value.add_i32(imm, width), rs2, bits)?;
                }
            }
            0x13 => {
                if rd == 0 {
                    return Ok(());
                }
                if funct3 == 1 || funct3 == 5 {
                    // slli / srli / srai
                    let shamt = (instr >> 20) & 0x7f;
                    let funct = instr >> 26;
                    let arith = funct == 0b010000;
                    if funct != 0 && !(funct3 == 5 && arith) {
                        return Ok(());
                    }
                    if shamt >= width.bits() {
                        return Ok(());
                    }
                    self.chk_loaded(rs1)?;
                    let slot = self.regs.get(rs1);
                    let value = if funct3 == 1 {
                        slot.value.shl(shamt, width)
                    } else if arith {
                        slot.value.sar(shamt, width)
                    } else {
                        slot.value.shr(shamt, width)
                    };
                    self.set_alu_result(rd, value, slot.origin);
                } else {
                    // addi / slti / sltiu / xori / ori / andi
                    let imm = (instr as i32) >> 20;
                    self.chk_loaded(rs1)?;
                    let slot = self.regs.get(rs1);
                    let rhs = XlenValue::from_i64(imm.into(), width);
                    let value = match funct3 {
                        0 => slot.value.add_i32(imm, width),
                        2 => XlenValue::from_u64(
                            u64::from(slot.value.less_than_signed(rhs, width)),
                            width,
                        ),
                        3 => XlenValue::from_u64(u64::from(slot.value.less_than_unsigned(rhs)), width),
                        4 => slot.value.bitxor(rhs),
                        6 => slot.value.bitor(rhs),
                        _ => slot.value.bitand(rhs),
                    };
                    self.set_alu_result(rd, value, slot.origin);
                }
            }
            0x33 => {
                let funct7 = instr >> 25;
                if rd == 0 {
                    return Ok(());
                }
                if funct7 != 0 && funct7 != 0x20 {
                    // muldiv and friends are not traced
                    return Ok(());
                }
                if funct7 == 0x20 && funct3 != 0 && funct3 != 5 {
                    return Ok(());
                }
                self.chk_loaded(rs1)?;
                self.chk_loaded(rs2)?;
                let a = self.regs.get(rs1);
                let b = self.regs.get(rs2);
                let value = if funct7 == 0x20 {
                    if funct3 == 0 {
                        // sub
                        a.value.wrapping_sub(b.value, width)
                    } else {
                        // sra
                        a.value.sar(b.value.low() as u32, width)
                    }
                } else {
                    match funct3 {
                        0 => a.value.wrapping_add(b.value, width),
                        1 => a.value.shl(b.value.low() as u32, width),
                        2 => XlenValue::from_u64(
                            u64::from(a.value.less_than_signed(b.value, width)),
                            width,
                        ),
                        3 => XlenValue::from_u64(
                            u64::from(a.value.less_than_unsigned(b.value)),
                            width,
                        ),
                        4 => a.value.bitxor(b.value),
                        5 => a.value.shr(b.value.low() as u32, width),
                        6 => a.value.bitor(b.value),
                        _ => a.value.bitand(b.value),
                    }
                };
                self.set_alu_result(rd, value, combined_origin(a.origin, b.origin));
            }
            _ => {}
        }
        Ok(())
    }

    /// RV64-specific base encodings; everything else chains to the RV32
    /// layer.
    fn step_rv64(&mut self, instr: u32) -> Result<(), Error> {
        let width = self.width;
        let funct3 = (instr >> 12) & 7;
        if instr & 0x7f == 0x03 && funct3 == 3 {
            // ld
            let rs1 = ((instr >> 15) & 0x1f) as usize;
            let rd = ((instr >> 7) & 0x1f) as usize;
            if rd != 0 {
                let imm = (instr as i32) >> 20;
                self.chk_loaded(rs1)?;
                let base = self.regs.get(rs1);
                if base.origin.is_known() && width == Xlen::Rv64 {
                    self.load_reg_lazy(base.value.add_i32(imm, width), rd, 64, Provenance::Addr);
                } else {
                    self.regs.set(rd, RegSlot::unknown());
                }
            }
            return Ok(());
        }
        if instr & 0x7f == 0x23 && funct3 == 3 {
            // sd
            let rs2 = ((instr >> 20) & 0x1f) as usize;
            let rs1 = ((instr >> 15) & 0x1f) as usize;
            let imm = get_imm_se(instr, IMM_BITS_S);
            self.chk_loaded(rs1)?;
            let base = self.regs.get(rs1);
            if base.origin.is_known() {
                self.store_reg(base.value.add_i32(imm, width), rs2, 64)?;
            }
            return Ok(());
        }
        self.step_rv32(instr)
    }

    /// RV128-specific base encodings; everything else chains to the RV64
    /// layer.
    fn step_rv128(&mut self, instr: u32) -> Result<(), Error> {
        self.step_rv64(instr)
    }

    /// Fetch, decode and symbolically execute the instruction at the
    /// abstract PC, advancing the PC unless the instruction ended the path.
    fn step(&mut self) -> Result<(), Error> {
        debug_assert!(!self.pc.origin.is_deferred());

        if self.pc.value.low() & 1 != 0 {
            return Err(Error::PcMisalignment);
        }
        let instr = self.mem.read_u32(self.pc.value)?;
        if instr & 3 == 3 {
            match self.width {
                Xlen::Rv32 => self.step_rv32(instr)?,
                Xlen::Rv64 => self.step_rv64(instr)?,
                Xlen::Rv128 => self.step_rv128(instr)?,
            }
            if !self.trace_return && !self.trace_branch {
                self.pc.value = self.pc.value.add_u64(4, self.width);
            }
        } else {
            let instr = instr & 0xffff;
            match self.width {
                Xlen::Rv32 => self.step_rv32c(instr)?,
                Xlen::Rv64 => self.step_rv64c(instr)?,
                Xlen::Rv128 => self.step_rv128c(instr)?,
            }
            if !self.trace_return && !self.trace_branch {
                self.pc.value = self.pc.value.add_u64(2, self.width);
            }
        }
        Ok(())
    }

    /// Explore forward from the stopped PC until some path reaches a return.
    ///
    /// Paths are abandoned individually on errors and on budget exhaustion;
    /// queued branch targets are explored in FIFO order. When no path proves
    /// a return, the register state is wiped and the fallback guesses the
    /// caller from the original ra. The returned value is an error to
    /// surface to the caller after result assembly (hash overflow).
    fn trace_instructions(&mut self) -> Result<Option<Error>, Error> {
        let org_pc = self.pc;
        let org_regs = self.regs.clone();
        let mut deferred = None;

        'crawl: loop {
            self.chk_loaded(REG_SP)?;
            let sp = self.regs.get(REG_SP);
            trace!(
                "stack crawl: pc {:#x}, sp {:#x}",
                if self.pc.origin.is_known() { self.pc.value.low() } else { 0 },
                if sp.origin.is_known() { sp.value.low() } else { 0 },
            );
            for _ in 0..MAX_INST {
                self.trace_return = false;
                self.trace_branch = false;
                let result = if self.pc.origin != Provenance::Other {
                    Err(Error::PcUnavailable)
                } else if self.pc.value.is_zero() {
                    Err(Error::PcIsZero)
                } else {
                    self.step()
                };
                let result = result.and_then(|()| {
                    if self.trace_return {
                        let sp_usable = self.chk_loaded(REG_SP).is_ok()
                            && self.regs.get(REG_SP).origin.is_known();
                        if !sp_usable {
                            return Err(Error::InvalidStackPointer);
                        }
                    }
                    Ok(())
                });
                match result {
                    Ok(()) => {
                        if self.trace_return {
                            return Ok(None);
                        }
                        if self.trace_branch {
                            break;
                        }
                    }
                    Err(e @ Error::MemoryHashOverflow) => {
                        trace!("stack crawl: {e}");
                        deferred = Some(e);
                        break 'crawl;
                    }
                    Err(e) => {
                        trace!("stack crawl: {e}");
                        break;
                    }
                }
            }
            match self.branches.take_next() {
                Some(b) => {
                    self.regs = b.regs;
                    self.hash = b.mem;
                    self.pc = RegSlot::other(b.addr);
                }
                None => break,
            }
        }

        trace!("stack crawl: function epilogue not found");
        self.regs.clear();
        self.pc = RegSlot::unknown();

        // Leaf-function fallback: if the original ra still looks like a
        // return address, adopt it as the caller's pc and keep the original
        // sp as the caller's sp.
        let mut org_pc = org_pc;
        let mut org_ra = org_regs.get(REG_RA);
        let mut org_sp = org_regs.get(REG_SP);
        self.materialize_slot(&mut org_pc)?;
        self.materialize_slot(&mut org_ra)?;
        self.materialize_slot(&mut org_sp)?;
        if !org_sp.value.is_zero()
            && !org_ra.value.is_zero()
            && org_pc.value != org_ra.value
        {
            self.pc = org_ra;
            self.regs.set(REG_SP, org_sp);
        }
        Ok(deferred)
    }

    /// Seed the abstract state from the stopped frame, run the trace, and
    /// emit everything provable into the caller frame `down`.
    fn crawl(&mut self, down: &mut F) -> Result<(), Error> {
        let defs = self.defs;

        for (idx, def) in defs.iter().enumerate() {
            if def.dwarf_id == 0 {
                debug_assert_eq!(def.size as u32 * 8, self.width.bits());
            } else if def.dwarf_id == REG_SP as i32 {
                let Ok(v) = read_frame_register(self.frame, def, self.width) else {
                    continue;
                };
                if v.is_zero() {
                    // End of stack.
                    return Ok(());
                }
                self.regs.set(REG_SP, RegSlot::other(v));
            } else if (0..REG_DATA_SIZE as i32).contains(&def.dwarf_id) {
                let slot = RegSlot {
                    value: XlenValue::from_u64(idx as u64, self.width),
                    origin: Provenance::Frame,
                };
                self.regs.set(def.dwarf_id as usize, slot);
            } else if def.name == "pc" {
                let Ok(v) = read_frame_register(self.frame, def, self.width) else {
                    continue;
                };
                self.pc = RegSlot::other(v);
            }
        }

        let deferred = self.trace_instructions()?;

        for def in defs {
            if (0..REG_DATA_SIZE as i32).contains(&def.dwarf_id) {
                let r = def.dwarf_id as usize;
                let slot = self.regs.get(r);
                if r != REG_SP {
                    match slot.origin {
                        Provenance::Addr | Provenance::Stack => {
                            if let Some((v, valid)) = self.hash.read(slot.value, self.width.bytes())
                            {
                                if valid {
                                    write_frame_register(down, def, v)?;
                                }
                                continue;
                            }
                            let cmds = [
                                LocationExpressionCommand::Number(slot.value.low()),
                                LocationExpressionCommand::ReadMemory {
                                    size_in_bytes: self.width.bytes() as usize,
                                },
                            ];
                            if down.write_register_location(def, &cmds).is_ok() {
                                continue;
                            }
                        }
                        Provenance::Frame => {
                            let cmds =
                                [LocationExpressionCommand::ReadRegister(slot.value.low() as usize)];
                            if down.write_register_location(def, &cmds).is_ok() {
                                continue;
                            }
                        }
                        _ => {}
                    }
                }
                if self.chk_loaded(r).is_err() {
                    continue;
                }
                let slot = self.regs.get(r);
                if !slot.origin.is_known() {
                    continue;
                }
                if r == REG_SP {
                    self.frame.set_frame_pointer(slot.value.low());
                }
                write_frame_register(down, def, slot.value)?;
            } else if def.name == "pc" {
                let mut pc = self.pc;
                if self.materialize_slot(&mut pc).is_err() {
                    continue;
                }
                self.pc = pc;
                if !pc.origin.is_known() {
                    continue;
                }
                write_frame_register(down, def, pc.value)?;
            }
        }

        match deferred {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn crawl_stack_frame<M: ProcessMemory, F: StackFrameAccess>(
    width: Xlen,
    memory: &mut M,
    registers: &[RegisterDefinition],
    frame: &mut F,
    down: &mut F,
) -> Result<(), Error> {
    let mut crawler = StackCrawler {
        width,
        mem: MemoryReader::new(memory, width),
        defs: registers,
        frame,
        regs: RegisterFile::new(),
        pc: RegSlot::unknown(),
        hash: MemHash::new(),
        branches: BranchList::new(),
        trace_return: false,
        trace_branch: false,
    };
    crawler.crawl(down)
}

/// Reconstruct the caller frame of a stopped RV32 thread.
///
/// `frame` gives access to the stopped thread's registers, `registers` is
/// the catalog describing them, and `memory` is the stopped process's
/// memory. Recovered caller registers are written to `down`; registers the
/// analysis cannot prove are left untouched. The resolved caller stack
/// pointer is additionally handed to `frame` as its frame pointer.
///
/// When no return can be proven, the input `ra` is adopted as the caller's
/// PC (leaf-function heuristic) and whatever else was proven is still
/// reported, so a partial result is a success, not an error. The one
/// resource failure — overflow of the traced-store table — is reported as
/// [`Error::MemoryHashOverflow`] after the fallback results have been
/// written.
pub fn crawl_stack_frame_riscv32<M: ProcessMemory, F: StackFrameAccess>(
    memory: &mut M,
    registers: &[RegisterDefinition],
    frame: &mut F,
    down: &mut F,
) -> Result<(), Error> {
    crawl_stack_frame(Xlen::Rv32, memory, registers, frame, down)
}

/// Reconstruct the caller frame of a stopped RV64 thread.
/// See [`crawl_stack_frame_riscv32`].
pub fn crawl_stack_frame_riscv64<M: ProcessMemory, F: StackFrameAccess>(
    memory: &mut M,
    registers: &[RegisterDefinition],
    frame: &mut F,
    down: &mut F,
) -> Result<(), Error> {
    crawl_stack_frame(Xlen::Rv64, memory, registers, frame, down)
}

/// Reconstruct the caller frame of a stopped RV128 thread.
/// See [`crawl_stack_frame_riscv32`].
pub fn crawl_stack_frame_riscv128<M: ProcessMemory, F: StackFrameAccess>(
    memory: &mut M,
    registers: &[RegisterDefinition],
    frame: &mut F,
    down: &mut F,
) -> Result<(), Error> {
    crawl_stack_frame(Xlen::Rv128, memory, registers, frame, down)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_compressed_immediates() {
        // 0x717d  c.addi16sp sp, -16
        assert_eq!(get_imm_se(0x717d, IMM_BITS_ADDI_SP) << 4, -16);
        // 0x6141  c.addi16sp sp, 16
        assert_eq!(get_imm_se(0x6141, IMM_BITS_ADDI_SP) << 4, 16);
        // 0xe422  c.sdsp x8, 8(sp)
        assert_eq!(get_imm(0xe422, IMM_BITS_SD_SP) * 8, 8);
        // 0x6422  c.ldsp x8, 8(sp)
        assert_eq!(get_imm(0x6422, IMM_BITS_LD_SP) * 8, 8);
        // 0xc111  c.beqz x10, +4
        assert_eq!(get_imm_se(0xc111, IMM_BITS_BC) << 1, 4);
        // 0x0800  c.addi4spn x8, sp, 16
        assert_eq!(get_imm(0x0800, IMM_BITS_ADDI_SPN) * 4, 16);
        // 0xa021  c.j +8
        assert_eq!(get_imm_se(0xa021, IMM_BITS_JC) << 1, 8);
        // 0x547d  c.li x8, -1
        assert_eq!(get_imm_se(0x547d, IMM_BITS_SHIFT), -1);
    }

    #[test]
    fn test_base_immediates() {
        // 0x0080006f  jal x0, +8
        assert_eq!(get_imm_se(0x0080006f, IMM_BITS_J) << 1, 8);
        // 0xfe000ee3  beq x0, x0, -4
        assert_eq!(get_imm_se(0xfe000ee3, IMM_BITS_B) << 1, -4);
        // 0xfe112c23  sw x1, -8(x2)
        assert_eq!(get_imm_se(0xfe112c23, IMM_BITS_S), -8);
    }
}
