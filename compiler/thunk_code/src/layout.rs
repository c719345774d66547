//! Packed layout of compiled units and their Code objects.
//!
//! # Layout
//!
//! All fields are 32-bit little-endian.
//!
//! ```text
//! Unit:  magic | totalSize | originRef | codeCount | Code... | pad-to-8
//! Code:  magic | ownerOffset | sourceIdx | opStack | auxStack
//!        | codeSize | instrCount | instructions[codeSize] | pad-to-4
//!        | sourceIndices[instrCount]
//! ```
//!
//! `ownerOffset` is the distance in bytes from the start of the Code object
//! back to the start of its unit, so a Code object finds its owner without
//! a search. The next Code object starts right after the source-index array
//! of the previous one.
//!
//! The unit magic and the code magic are compared by exact equality. They
//! are chosen so that an ordinary integer vector handed to the interpreter
//! is rejected instead of being executed.

use crate::opcode::{decode, Instruction};
use crate::LayoutError;

/// Tag at byte 0 of every packed unit.
pub const UNIT_MAGIC: u32 = 0xCAFE_BABE;

/// Tag at byte 0 of every Code object.
pub const CODE_MAGIC: u32 = 0x0000_00FF;

/// `originRef` value of a unit with no less-optimized predecessor.
pub const NO_ORIGIN: u32 = u32::MAX;

/// Size of the unit header in bytes.
pub const UNIT_HEADER_SIZE: usize = 16;

/// Size of the Code header in bytes.
pub const CODE_HEADER_SIZE: usize = 28;

const WORD: usize = 8;

/// Round `size` up to a 4-byte boundary.
#[inline]
pub const fn pad4(size: usize) -> usize {
    (size + 3) & !3
}

/// Round `size` up to a word (8-byte) boundary.
#[inline]
pub const fn pad_word(size: usize) -> usize {
    (size + WORD - 1) & !(WORD - 1)
}

/// Does `bytes` start with the unit tag?
///
/// This is the exact-equality test the interpreter uses before trusting a
/// region as compiled data. It does not validate the rest of the region.
pub fn is_packed_unit(bytes: &[u8]) -> bool {
    read_u32(bytes, 0) == Some(UNIT_MAGIC)
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let chunk: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(chunk))
}

fn to_u32(value: usize, what: &'static str) -> Result<u32, LayoutError> {
    u32::try_from(value).map_err(|_| LayoutError::TooLarge { what })
}

// ── Building ────────────────────────────────────────────────────────

/// Accumulates the instructions of one Code object.
#[derive(Clone, Debug, Default)]
pub struct CodeBuilder {
    source: u32,
    stack_depth: u32,
    aux_stack_depth: u32,
    bytes: Vec<u8>,
    sources: Vec<u32>,
}

impl CodeBuilder {
    /// Start a Code object for the AST at pool index `source`.
    pub fn new(source: u32) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }

    /// Record the operand and auxiliary stack depths the code needs.
    #[must_use]
    pub fn with_stack_depths(mut self, operand: u32, aux: u32) -> Self {
        self.stack_depth = operand;
        self.aux_stack_depth = aux;
        self
    }

    /// Append one instruction and the source index it was compiled from.
    ///
    /// Index 0 means "no source".
    pub fn emit(&mut self, instr: Instruction, source_index: u32) -> &mut Self {
        instr.encode(&mut self.bytes);
        self.sources.push(source_index);
        self
    }

    /// Byte offset the next emitted instruction will occupy.
    pub fn position(&self) -> usize {
        self.bytes.len()
    }

    pub fn instruction_count(&self) -> usize {
        self.sources.len()
    }

    /// Size of the encoded Code object, header and padding included.
    fn packed_size(&self) -> usize {
        CODE_HEADER_SIZE + pad4(self.bytes.len()) + self.sources.len() * 4
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<(), LayoutError> {
        let owner_offset = to_u32(out.len(), "code object offset")?;
        for field in [
            CODE_MAGIC,
            owner_offset,
            self.source,
            self.stack_depth,
            self.aux_stack_depth,
            to_u32(self.bytes.len(), "instruction bytes")?,
            to_u32(self.sources.len(), "instruction count")?,
        ] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out.extend_from_slice(&self.bytes);
        out.resize(out.len() + pad4(self.bytes.len()) - self.bytes.len(), 0);
        for &src in &self.sources {
            out.extend_from_slice(&src.to_le_bytes());
        }
        Ok(())
    }
}

/// Assembles Code objects into one packed unit.
#[derive(Clone, Debug, Default)]
pub struct UnitBuilder {
    origin: Option<u32>,
    codes: Vec<CodeBuilder>,
}

impl UnitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link the unit to the less-optimized version it replaces.
    ///
    /// `origin` is a raw [`UnitHandle`](crate::UnitHandle) index; the arena
    /// checks it on insertion.
    #[must_use]
    pub fn with_origin(mut self, origin: u32) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Append a Code object. Returns its index within the unit.
    pub fn push_code(&mut self, code: CodeBuilder) -> usize {
        self.codes.push(code);
        self.codes.len() - 1
    }

    /// Encode the unit.
    pub fn build(self) -> Result<PackedUnit, LayoutError> {
        let body: usize = self.codes.iter().map(CodeBuilder::packed_size).sum();
        let total = pad_word(UNIT_HEADER_SIZE + body);
        let mut out = Vec::with_capacity(total);

        for field in [
            UNIT_MAGIC,
            to_u32(total, "unit size")?,
            self.origin.unwrap_or(NO_ORIGIN),
            to_u32(self.codes.len(), "code object count")?,
        ] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        for code in &self.codes {
            code.write(&mut out)?;
        }
        out.resize(total, 0);

        tracing::trace!(
            bytes = total,
            codes = self.codes.len(),
            origin = self.origin,
            "packed unit"
        );

        PackedUnit::from_bytes(out)
    }
}

// ── Validated units ─────────────────────────────────────────────────

/// A validated packed unit.
///
/// Construction checks every header, so navigation never re-validates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedUnit {
    bytes: Vec<u8>,
    /// Start offset of each Code object.
    code_offsets: Vec<usize>,
}

impl PackedUnit {
    /// Validate `bytes` as a packed unit.
    ///
    /// Checks the unit tag and size, then walks every Code object checking
    /// its tag, its owner offset and that it lies inside the region.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, LayoutError> {
        let Some(found) = read_u32(&bytes, 0) else {
            return Err(LayoutError::Truncated {
                what: "unit header",
                offset: 0,
            });
        };
        if found != UNIT_MAGIC {
            return Err(LayoutError::BadUnitMagic { found });
        }
        let (Some(declared), Some(count)) = (read_u32(&bytes, 4), read_u32(&bytes, 12)) else {
            return Err(LayoutError::Truncated {
                what: "unit header",
                offset: 0,
            });
        };
        if declared as usize != bytes.len() || bytes.len() % WORD != 0 {
            return Err(LayoutError::SizeMismatch {
                declared,
                actual: bytes.len(),
            });
        }

        let mut code_offsets =
            Vec::with_capacity((count as usize).min(bytes.len() / CODE_HEADER_SIZE));
        let mut offset = UNIT_HEADER_SIZE;
        for _ in 0..count {
            let header = CodeHeader::read(&bytes, offset)?;
            let end = offset + header.packed_size();
            if end > bytes.len() {
                return Err(LayoutError::Truncated {
                    what: "code object",
                    offset,
                });
            }
            code_offsets.push(offset);
            offset = end;
        }

        if pad_word(offset) != bytes.len() {
            return Err(LayoutError::TrailingBytes {
                trailing: bytes.len() - offset,
            });
        }

        Ok(Self {
            bytes,
            code_offsets,
        })
    }

    /// Validate `bytes`, aborting on corruption.
    ///
    /// For interpreter entry points that have no way to report a broken
    /// build other than stopping.
    pub fn from_bytes_or_abort(bytes: Vec<u8>) -> Self {
        match Self::from_bytes(bytes) {
            Ok(unit) => unit,
            Err(err) => panic!("corrupt compiled unit: {err}"),
        }
    }

    /// The raw packed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total size in bytes, word aligned.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Raw origin handle, or `None` for an unoptimized unit.
    pub fn origin(&self) -> Option<u32> {
        read_u32(&self.bytes, 8).filter(|&raw| raw != NO_ORIGIN)
    }

    pub fn code_count(&self) -> usize {
        self.code_offsets.len()
    }

    /// The function body: the first Code object.
    pub fn body(&self) -> Option<CodeRef<'_>> {
        self.code(0)
    }

    /// Code object by index within the unit.
    pub fn code(&self, index: usize) -> Option<CodeRef<'_>> {
        let offset = *self.code_offsets.get(index)?;
        Some(self.code_ref(index, offset))
    }

    /// Code object starting at byte `offset` of the unit.
    ///
    /// The interpreter stores Code references as offsets, so an offset that
    /// does not start a Code object is corruption.
    pub fn code_at(&self, offset: usize) -> Result<CodeRef<'_>, LayoutError> {
        match self.code_offsets.binary_search(&offset) {
            Ok(index) => Ok(self.code_ref(index, offset)),
            Err(_) => Err(LayoutError::BadCodeMagic {
                offset,
                found: read_u32(&self.bytes, offset).unwrap_or(0),
            }),
        }
    }

    /// Iterate the Code objects in layout order.
    pub fn codes(&self) -> impl Iterator<Item = CodeRef<'_>> + '_ {
        self.code_offsets
            .iter()
            .enumerate()
            .map(|(index, &offset)| self.code_ref(index, offset))
    }

    fn code_ref(&self, index: usize, offset: usize) -> CodeRef<'_> {
        // Offsets in `code_offsets` were validated by `from_bytes`.
        let header = CodeHeader::read(&self.bytes, offset).unwrap_or_default();
        CodeRef {
            unit: self,
            index,
            offset,
            header,
        }
    }
}

/// Decoded header of one Code object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CodeHeader {
    pub owner_offset: u32,
    /// AST pool index of the function or promise body.
    pub source: u32,
    /// Operand stack slots required.
    pub stack_depth: u32,
    /// Integer (auxiliary) stack slots required.
    pub aux_stack_depth: u32,
    /// Instruction bytes, not padded.
    pub code_size: u32,
    pub instruction_count: u32,
}

impl CodeHeader {
    fn read(bytes: &[u8], offset: usize) -> Result<Self, LayoutError> {
        let field = |i: usize| {
            read_u32(bytes, offset + i * 4).ok_or(LayoutError::Truncated {
                what: "code header",
                offset,
            })
        };
        let found = field(0)?;
        if found != CODE_MAGIC {
            return Err(LayoutError::BadCodeMagic { offset, found });
        }
        let header = Self {
            owner_offset: field(1)?,
            source: field(2)?,
            stack_depth: field(3)?,
            aux_stack_depth: field(4)?,
            code_size: field(5)?,
            instruction_count: field(6)?,
        };
        if header.owner_offset as usize != offset {
            return Err(LayoutError::OwnerMismatch {
                offset,
                owner_offset: header.owner_offset,
            });
        }
        Ok(header)
    }

    /// Size of the Code object in bytes, header included.
    pub fn packed_size(&self) -> usize {
        CODE_HEADER_SIZE + pad4(self.code_size as usize) + self.instruction_count as usize * 4
    }
}

/// A Code object inside a validated [`PackedUnit`].
#[derive(Clone, Copy, Debug)]
pub struct CodeRef<'a> {
    unit: &'a PackedUnit,
    index: usize,
    offset: usize,
    header: CodeHeader,
}

impl<'a> CodeRef<'a> {
    pub fn header(&self) -> &CodeHeader {
        &self.header
    }

    /// Byte offset of this Code object inside its unit.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Position of this Code object within its unit (0 is the body).
    pub fn index(&self) -> usize {
        self.index
    }

    /// The unit this Code object belongs to.
    pub fn owner(&self) -> &'a PackedUnit {
        debug_assert_eq!(self.offset - self.header.owner_offset as usize, 0);
        self.unit
    }

    /// The Code object laid out right after this one.
    pub fn next(&self) -> Option<CodeRef<'a>> {
        let next = self.offset + self.header.packed_size();
        self.unit.code(self.index + 1).filter(|c| c.offset == next)
    }

    /// Instruction bytes, without padding.
    pub fn instructions(&self) -> &'a [u8] {
        let start = self.offset + CODE_HEADER_SIZE;
        &self.unit.bytes[start..start + self.header.code_size as usize]
    }

    /// Source index of the `n`th instruction.
    pub fn source_index(&self, n: usize) -> Option<u32> {
        if n >= self.header.instruction_count as usize {
            return None;
        }
        read_u32(&self.unit.bytes, self.sources_start() + n * 4)
    }

    /// Source indices, one per instruction.
    pub fn source_indices(&self) -> impl Iterator<Item = u32> + 'a {
        let start = self.sources_start();
        let len = self.header.instruction_count as usize * 4;
        self.unit.bytes[start..start + len]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }

    /// Decode every instruction, checking the count against the header.
    pub fn decode(&self) -> Result<Vec<(usize, Instruction)>, LayoutError> {
        let decoded = decode(self.instructions()).collect::<Result<Vec<_>, _>>()?;
        if decoded.len() != self.header.instruction_count as usize {
            return Err(LayoutError::InstructionCountMismatch {
                decoded: decoded.len(),
                recorded: self.header.instruction_count,
            });
        }
        Ok(decoded)
    }

    fn sources_start(&self) -> usize {
        self.offset + CODE_HEADER_SIZE + pad4(self.header.code_size as usize)
    }
}
