use crate::error::Error;
use crate::location::LocationExpressionCommand;
use crate::xlen::{Xlen, XlenValue};

/// Description of one register of the stopped thread, as listed by the
/// debug context's register catalog.
#[derive(Clone, Debug)]
pub struct RegisterDefinition {
    pub name: String,
    /// Register size in bytes.
    pub size: usize,
    pub big_endian: bool,
    /// DWARF register number: 0 is x0, 1 is RA, 2 is SP, 0..31 are the
    /// integer registers. −1 marks a register that is not a GPR; the PC is
    /// identified by `name == "pc"` instead.
    pub dwarf_id: i32,
}

/// Access to the registers of one stack frame.
///
/// The unwinder reads the stopped frame's registers through this interface
/// and writes the reconstructed caller registers to the `down` frame. Both
/// sides use the byte representation declared by the register's
/// [`RegisterDefinition`] (size and endianness).
pub trait StackFrameAccess {
    /// Whether this is the innermost frame, i.e. the one whose registers came
    /// straight from the stopped thread. A register of the innermost frame
    /// that cannot be read is a hard error; further down the stack it merely
    /// means the value was never recovered.
    fn is_top_frame(&self) -> bool;

    /// Read a register into `buf`, which is exactly `def.size` bytes long.
    fn read_register(&mut self, def: &RegisterDefinition, buf: &mut [u8]) -> Result<(), ()>;

    /// Write a register from `bytes`, which is exactly `def.size` bytes long.
    fn write_register(&mut self, def: &RegisterDefinition, bytes: &[u8]) -> Result<(), ()>;

    /// Report a register's location instead of its value. The default
    /// declines, which makes the unwinder materialize and report a plain
    /// value where it can; implement this to receive symbolic locations for
    /// registers whose value was never pulled out of memory.
    fn write_register_location(
        &mut self,
        def: &RegisterDefinition,
        cmds: &[LocationExpressionCommand],
    ) -> Result<(), ()> {
        let _ = (def, cmds);
        Err(())
    }

    /// Receives the resolved caller stack pointer for this frame.
    fn set_frame_pointer(&mut self, fp: u64) {
        let _ = fp;
    }
}

/// Read a register of up to 16 bytes and assemble it into a value.
pub(crate) fn read_frame_register<F: StackFrameAccess + ?Sized>(
    frame: &mut F,
    def: &RegisterDefinition,
    width: Xlen,
) -> Result<XlenValue, Error> {
    let mut buf = [0u8; 16];
    if def.size > buf.len() {
        return Err(Error::CouldNotReadRegister);
    }
    frame
        .read_register(def, &mut buf[..def.size])
        .map_err(|()| Error::CouldNotReadRegister)?;
    let bytes = &buf[..def.size];
    let mut v: u128 = 0;
    if def.big_endian {
        for &b in bytes {
            v = v << 8 | u128::from(b);
        }
    } else {
        for &b in bytes.iter().rev() {
            v = v << 8 | u128::from(b);
        }
    }
    Ok(XlenValue::from_u128(v, width))
}

pub(crate) fn write_frame_register<F: StackFrameAccess + ?Sized>(
    frame: &mut F,
    def: &RegisterDefinition,
    value: XlenValue,
) -> Result<(), Error> {
    let mut buf = [0u8; 16];
    if def.size > buf.len() {
        return Err(Error::CouldNotWriteRegister);
    }
    let mut raw = value.to_u128();
    for i in 0..def.size {
        let idx = if def.big_endian { def.size - i - 1 } else { i };
        buf[idx] = raw as u8;
        raw >>= 8;
    }
    frame
        .write_register(def, &buf[..def.size])
        .map_err(|()| Error::CouldNotWriteRegister)
}
