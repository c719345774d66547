//! Errors reported while building, validating or decoding packed code.

/// A packed region failed validation or could not be produced.
///
/// Every variant except [`TooLarge`](LayoutError::TooLarge) means the bytes
/// handed to this crate are not what the compiler wrote. There is no
/// recovery path: callers abort.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("not a packed unit: magic 0x{found:08X}, expected 0xCAFEBABE")]
    BadUnitMagic { found: u32 },

    #[error("corrupt code object at byte {offset}: magic 0x{found:08X}, expected 0x000000FF")]
    BadCodeMagic { offset: usize, found: u32 },

    #[error("truncated {what} at byte {offset}")]
    Truncated { what: &'static str, offset: usize },

    #[error("code object at byte {offset} records owner offset {owner_offset}")]
    OwnerMismatch { offset: usize, owner_offset: u32 },

    #[error("unit size field is {declared} bytes but the region holds {actual}")]
    SizeMismatch { declared: u32, actual: usize },

    #[error("{trailing} unexpected bytes after the last code object")]
    TrailingBytes { trailing: usize },

    #[error("{what} does not fit the 32-bit layout")]
    TooLarge { what: &'static str },

    #[error("unknown opcode 0x{opcode:02X} at instruction byte {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("code object decodes to {decoded} instructions but records {recorded}")]
    InstructionCountMismatch { decoded: usize, recorded: u32 },

    #[error("branch at byte {at} with offset {offset:+} does not land on an instruction")]
    BadBranchTarget { at: usize, offset: i32 },

    #[error("origin handle {0} does not name a unit already in the arena")]
    DanglingOrigin(u32),
}
