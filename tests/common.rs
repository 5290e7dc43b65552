use std::collections::HashMap;

use riscv_stackcrawl::{
    LocationExpressionCommand, ProcessMemory, RegisterDefinition, StackFrameAccess,
};

/// Target memory built from a handful of readable spans. Reads that start
/// inside a span but run off its end are partial; reads that start outside
/// every span fail.
#[derive(Default)]
pub struct FakeMemory {
    spans: Vec<(u64, Vec<u8>)>,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_span(&mut self, base: u64, bytes: Vec<u8>) {
        self.spans.push((base, bytes));
    }
}

impl ProcessMemory for FakeMemory {
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<usize, ()> {
        for (base, bytes) in &self.spans {
            let end = base + bytes.len() as u64;
            if addr >= *base && addr < end {
                let offset = (addr - base) as usize;
                let n = buf.len().min(bytes.len() - offset);
                buf[..n].copy_from_slice(&bytes[offset..offset + n]);
                return Ok(n);
            }
        }
        Err(())
    }
}

/// Little-endian code blob assembled from compressed (16-bit) and base
/// (32-bit) encodings.
#[derive(Default)]
pub struct Code {
    pub bytes: Vec<u8>,
}

impl Code {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn c(mut self, insn: u16) -> Self {
        self.bytes.extend_from_slice(&insn.to_le_bytes());
        self
    }

    pub fn i(mut self, insn: u32) -> Self {
        self.bytes.extend_from_slice(&insn.to_le_bytes());
        self
    }
}

/// The RISC-V register catalog: x0..x31 with their DWARF numbers, plus pc.
pub fn riscv_registers(reg_size: usize) -> Vec<RegisterDefinition> {
    let mut defs: Vec<RegisterDefinition> = (0..32)
        .map(|i| RegisterDefinition {
            name: format!("x{i}"),
            size: reg_size,
            big_endian: false,
            dwarf_id: i,
        })
        .collect();
    defs.push(RegisterDefinition {
        name: "pc".into(),
        size: reg_size,
        big_endian: false,
        dwarf_id: -1,
    });
    defs
}

/// A frame whose registers live in a name-keyed map. Registers that were
/// never set read as absent, like a debugger target that could not recover
/// them.
#[derive(Default)]
pub struct FakeFrame {
    top: bool,
    pub supports_locations: bool,
    values: HashMap<String, Vec<u8>>,
    pub locations: HashMap<String, Vec<LocationExpressionCommand>>,
    pub fp: Option<u64>,
}

impl FakeFrame {
    pub fn top_frame() -> Self {
        Self {
            top: true,
            ..Self::default()
        }
    }

    pub fn down_frame() -> Self {
        Self::default()
    }

    pub fn set_u32(&mut self, name: &str, v: u32) {
        self.values.insert(name.into(), v.to_le_bytes().to_vec());
    }

    pub fn set_u64(&mut self, name: &str, v: u64) {
        self.values.insert(name.into(), v.to_le_bytes().to_vec());
    }

    pub fn set_u128(&mut self, name: &str, v: u128) {
        self.values.insert(name.into(), v.to_le_bytes().to_vec());
    }

    pub fn get_u32(&self, name: &str) -> Option<u32> {
        let bytes = self.values.get(name)?;
        Some(u32::from_le_bytes(bytes[..4].try_into().unwrap()))
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        let bytes = self.values.get(name)?;
        Some(u64::from_le_bytes(bytes[..8].try_into().unwrap()))
    }

    pub fn get_u128(&self, name: &str) -> Option<u128> {
        let bytes = self.values.get(name)?;
        Some(u128::from_le_bytes(bytes[..16].try_into().unwrap()))
    }
}

impl StackFrameAccess for FakeFrame {
    fn is_top_frame(&self) -> bool {
        self.top
    }

    fn read_register(&mut self, def: &RegisterDefinition, buf: &mut [u8]) -> Result<(), ()> {
        let bytes = self.values.get(&def.name).ok_or(())?;
        buf.copy_from_slice(&bytes[..def.size]);
        Ok(())
    }

    fn write_register(&mut self, def: &RegisterDefinition, bytes: &[u8]) -> Result<(), ()> {
        self.values.insert(def.name.clone(), bytes.to_vec());
        Ok(())
    }

    fn write_register_location(
        &mut self,
        def: &RegisterDefinition,
        cmds: &[LocationExpressionCommand],
    ) -> Result<(), ()> {
        if !self.supports_locations {
            return Err(());
        }
        self.locations.insert(def.name.clone(), cmds.to_vec());
        Ok(())
    }

    fn set_frame_pointer(&mut self, fp: u64) {
        self.fp = Some(fp);
    }
}
