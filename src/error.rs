/// The error type used in this crate.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid memory address")]
    InvalidAddress,

    #[error("Could not read target memory at 0x{0:x}")]
    CouldNotReadMemory(u64),

    #[error("Could not read register of the stopped frame")]
    CouldNotReadRegister,

    #[error("Could not write register of the caller frame")]
    CouldNotWriteRegister,

    #[error("Memory hash overflow")]
    MemoryHashOverflow,

    #[error("PC misalignment")]
    PcMisalignment,

    #[error("Illegal instruction")]
    IllegalInstruction,

    #[error("PC value not available")]
    PcUnavailable,

    #[error("PC is zero")]
    PcIsZero,

    #[error("Invalid SP value at function return")]
    InvalidStackPointer,
}
