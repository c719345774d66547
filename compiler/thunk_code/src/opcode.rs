//! Instruction set and decoder for packed Code objects.
//!
//! Every instruction is one opcode byte followed by zero or more 32-bit
//! little-endian immediates. Pool and name operands are unsigned indices;
//! jump offsets are signed and relative to the end of the jump instruction.

use std::fmt;

use crate::LayoutError;

/// Width of every immediate operand in bytes.
pub const IMMEDIATE_SIZE: usize = 4;

/// Opcode byte of a packed instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x00,
    PushConst = 0x01,
    LdVar = 0x02,
    StVar = 0x03,
    /// Wraps the Code object at the given index of the owning unit into a
    /// promise bound to the current environment.
    MkPromise = 0x04,
    Force = 0x05,
    Call = 0x06,
    Ret = 0x07,
    Br = 0x08,
    BrTrue = 0x09,
    BrFalse = 0x0A,
    Pop = 0x0B,
    Dup = 0x0C,
    Deopt = 0x0D,
    Add = 0x0E,
    Lt = 0x0F,
}

impl Opcode {
    /// Decode an opcode byte. Returns `None` for bytes outside the table.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Opcode::Nop,
            0x01 => Opcode::PushConst,
            0x02 => Opcode::LdVar,
            0x03 => Opcode::StVar,
            0x04 => Opcode::MkPromise,
            0x05 => Opcode::Force,
            0x06 => Opcode::Call,
            0x07 => Opcode::Ret,
            0x08 => Opcode::Br,
            0x09 => Opcode::BrTrue,
            0x0A => Opcode::BrFalse,
            0x0B => Opcode::Pop,
            0x0C => Opcode::Dup,
            0x0D => Opcode::Deopt,
            0x0E => Opcode::Add,
            0x0F => Opcode::Lt,
            _ => return None,
        })
    }

    /// Number of 32-bit immediates following the opcode byte.
    pub fn immediate_count(self) -> usize {
        match self {
            Opcode::Nop
            | Opcode::Force
            | Opcode::Ret
            | Opcode::Pop
            | Opcode::Dup
            | Opcode::Add
            | Opcode::Lt => 0,
            Opcode::PushConst
            | Opcode::LdVar
            | Opcode::StVar
            | Opcode::MkPromise
            | Opcode::Br
            | Opcode::BrTrue
            | Opcode::BrFalse
            | Opcode::Deopt => 1,
            Opcode::Call => 2,
        }
    }

    /// Encoded size in bytes, opcode included.
    #[inline]
    pub fn size(self) -> usize {
        1 + self.immediate_count() * IMMEDIATE_SIZE
    }

    /// Mnemonic used by the disassembler.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::PushConst => "push_const",
            Opcode::LdVar => "ldvar",
            Opcode::StVar => "stvar",
            Opcode::MkPromise => "mk_promise",
            Opcode::Force => "force",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Br => "br",
            Opcode::BrTrue => "brtrue",
            Opcode::BrFalse => "brfalse",
            Opcode::Pop => "pop",
            Opcode::Dup => "dup",
            Opcode::Deopt => "deopt",
            Opcode::Add => "add",
            Opcode::Lt => "lt",
        }
    }
}

/// A decoded instruction with its immediates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Instruction {
    Nop,
    PushConst { pool: u32 },
    LdVar { name: u32 },
    StVar { name: u32 },
    MkPromise { code: u32 },
    Force,
    Call { nargs: u32, call_site: u32 },
    Ret,
    Br { offset: i32 },
    BrTrue { offset: i32 },
    BrFalse { offset: i32 },
    Pop,
    Dup,
    Deopt { frame: u32 },
    Add,
    Lt,
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Nop => Opcode::Nop,
            Instruction::PushConst { .. } => Opcode::PushConst,
            Instruction::LdVar { .. } => Opcode::LdVar,
            Instruction::StVar { .. } => Opcode::StVar,
            Instruction::MkPromise { .. } => Opcode::MkPromise,
            Instruction::Force => Opcode::Force,
            Instruction::Call { .. } => Opcode::Call,
            Instruction::Ret => Opcode::Ret,
            Instruction::Br { .. } => Opcode::Br,
            Instruction::BrTrue { .. } => Opcode::BrTrue,
            Instruction::BrFalse { .. } => Opcode::BrFalse,
            Instruction::Pop => Opcode::Pop,
            Instruction::Dup => Opcode::Dup,
            Instruction::Deopt { .. } => Opcode::Deopt,
            Instruction::Add => Opcode::Add,
            Instruction::Lt => Opcode::Lt,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.opcode().size()
    }

    /// Append the encoded instruction to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode() as u8);
        match *self {
            Instruction::PushConst { pool: imm }
            | Instruction::LdVar { name: imm }
            | Instruction::StVar { name: imm }
            | Instruction::MkPromise { code: imm }
            | Instruction::Deopt { frame: imm } => out.extend_from_slice(&imm.to_le_bytes()),
            Instruction::Br { offset }
            | Instruction::BrTrue { offset }
            | Instruction::BrFalse { offset } => out.extend_from_slice(&offset.to_le_bytes()),
            Instruction::Call { nargs, call_site } => {
                out.extend_from_slice(&nargs.to_le_bytes());
                out.extend_from_slice(&call_site.to_le_bytes());
            }
            Instruction::Nop
            | Instruction::Force
            | Instruction::Ret
            | Instruction::Pop
            | Instruction::Dup
            | Instruction::Add
            | Instruction::Lt => {}
        }
    }

    /// Absolute byte offset a jump at `at` transfers control to.
    ///
    /// Returns `None` for non-jumps and for offsets that leave the address
    /// space.
    pub fn branch_target(&self, at: usize) -> Option<usize> {
        let offset = match *self {
            Instruction::Br { offset }
            | Instruction::BrTrue { offset }
            | Instruction::BrFalse { offset } => offset,
            _ => return None,
        };
        at.checked_add(self.size())?
            .checked_add_signed(isize::try_from(offset).ok()?)
    }

    /// Does this instruction end straight-line execution?
    pub fn is_exit(&self) -> bool {
        matches!(self, Instruction::Ret | Instruction::Deopt { .. })
    }

    /// Does control leave this instruction other than by falling through?
    pub fn ends_block(&self) -> bool {
        self.is_exit()
            || matches!(
                self,
                Instruction::Br { .. } | Instruction::BrTrue { .. } | Instruction::BrFalse { .. }
            )
    }

    /// Can control continue with the next instruction?
    pub fn falls_through(&self) -> bool {
        !self.is_exit() && !matches!(self, Instruction::Br { .. })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.opcode().mnemonic();
        match *self {
            Instruction::PushConst { pool: imm }
            | Instruction::LdVar { name: imm }
            | Instruction::StVar { name: imm }
            | Instruction::MkPromise { code: imm }
            | Instruction::Deopt { frame: imm } => write!(f, "{name} {imm}"),
            Instruction::Br { offset }
            | Instruction::BrTrue { offset }
            | Instruction::BrFalse { offset } => write!(f, "{name} {offset:+}"),
            Instruction::Call { nargs, call_site } => write!(f, "{name} {nargs} @{call_site}"),
            _ => f.write_str(name),
        }
    }
}

/// Iterate the instructions encoded in `bytes`.
///
/// Yields `(byte offset, instruction)` pairs. The first malformed
/// instruction yields an error and ends the iteration.
pub fn decode(bytes: &[u8]) -> Decoder<'_> {
    Decoder {
        bytes,
        pos: 0,
        failed: false,
    }
}

/// Iterator returned by [`decode`].
pub struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    failed: bool,
}

impl Decoder<'_> {
    fn immediate(&self, index: usize) -> Result<[u8; IMMEDIATE_SIZE], LayoutError> {
        let start = self.pos + 1 + index * IMMEDIATE_SIZE;
        self.bytes
            .get(start..start + IMMEDIATE_SIZE)
            .and_then(|chunk| chunk.try_into().ok())
            .ok_or(LayoutError::Truncated {
                what: "instruction immediate",
                offset: start,
            })
    }

    fn decode_at(&self, opcode: Opcode) -> Result<Instruction, LayoutError> {
        let unsigned = |i| self.immediate(i).map(u32::from_le_bytes);
        let signed = |i| self.immediate(i).map(i32::from_le_bytes);
        Ok(match opcode {
            Opcode::Nop => Instruction::Nop,
            Opcode::PushConst => Instruction::PushConst { pool: unsigned(0)? },
            Opcode::LdVar => Instruction::LdVar { name: unsigned(0)? },
            Opcode::StVar => Instruction::StVar { name: unsigned(0)? },
            Opcode::MkPromise => Instruction::MkPromise { code: unsigned(0)? },
            Opcode::Force => Instruction::Force,
            Opcode::Call => Instruction::Call {
                nargs: unsigned(0)?,
                call_site: unsigned(1)?,
            },
            Opcode::Ret => Instruction::Ret,
            Opcode::Br => Instruction::Br { offset: signed(0)? },
            Opcode::BrTrue => Instruction::BrTrue { offset: signed(0)? },
            Opcode::BrFalse => Instruction::BrFalse { offset: signed(0)? },
            Opcode::Pop => Instruction::Pop,
            Opcode::Dup => Instruction::Dup,
            Opcode::Deopt => Instruction::Deopt {
                frame: unsigned(0)?,
            },
            Opcode::Add => Instruction::Add,
            Opcode::Lt => Instruction::Lt,
        })
    }
}

impl Iterator for Decoder<'_> {
    type Item = Result<(usize, Instruction), LayoutError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.bytes.len() {
            return None;
        }
        let at = self.pos;
        let byte = self.bytes[at];
        let result = Opcode::from_byte(byte)
            .ok_or(LayoutError::UnknownOpcode {
                opcode: byte,
                offset: at,
            })
            .and_then(|op| self.decode_at(op));
        match result {
            Ok(instr) => {
                self.pos += instr.size();
                Some(Ok((at, instr)))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
