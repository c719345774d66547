//! Packed bytecode layout for the Thunk interpreter.
//!
//! A compiled unit is one contiguous byte region: a unit header followed by
//! its Code objects (the function body first, then one Code object per
//! promise), each carrying its instruction bytes and one source-AST index
//! per instruction. The layout is bit-exact so the companion interpreter can
//! read it without a translation step.
//!
//! This crate provides:
//!
//! - **Layout** ([`UnitBuilder`], [`CodeBuilder`], [`PackedUnit`], [`CodeRef`]) —
//!   building, validating and navigating packed units. A [`CodeRef`] reaches
//!   its owning unit and the next Code object in O(1).
//!
//! - **Opcodes** ([`Opcode`], [`Instruction`], [`decode`]) — the instruction
//!   set with fixed-width 32-bit immediates, and a decoder over instruction
//!   bytes.
//!
//! - **Basic blocks** ([`CodeCfg`]) — partitions a Code object's
//!   instructions at branches, returns and deoptimization points, with
//!   successor and predecessor edges.
//!
//! - **Disassembly** ([`disassemble`], [`disassemble_unit`]) — a textual
//!   dump of unit and Code headers pairing each instruction with its source
//!   index.
//!
//! - **Unit arena** ([`UnitArena`], [`UnitHandle`]) — owns packed units and
//!   resolves the origin link from an optimized unit back to the
//!   less-optimized version it falls back to on deoptimization.
//!
//! # Corruption
//!
//! A region claimed to be compiled data whose magic does not match is a
//! build or versioning defect. Every such condition is reported as a
//! [`LayoutError`]; callers treat it as fatal.

mod arena;
pub mod cfg;
mod disasm;
mod error;
pub mod layout;
pub mod opcode;

pub use arena::{UnitArena, UnitHandle};
pub use cfg::{CodeBlock, CodeCfg};
pub use disasm::{disassemble, disassemble_unit};
pub use error::LayoutError;
pub use layout::{
    is_packed_unit, pad4, pad_word, CodeBuilder, CodeHeader, CodeRef, PackedUnit, UnitBuilder,
    CODE_HEADER_SIZE, CODE_MAGIC, NO_ORIGIN, UNIT_HEADER_SIZE, UNIT_MAGIC,
};
pub use opcode::{decode, Instruction, Opcode};
