//! Basic blocks of a packed Code object.
//!
//! Leaders are the first instruction, every branch target, and the
//! instruction after any branch, `ret` or `deopt`. Each block runs from its
//! leader up to the next one; edges follow the branch target and the
//! fall-through.

use std::ops::Range;

use smallvec::SmallVec;

use crate::{CodeRef, Instruction, LayoutError};

/// A maximal straight-line run of instructions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeBlock {
    /// Byte offsets covered, relative to the instruction bytes.
    pub bytes: Range<usize>,
    /// Indices into the decoded instruction list.
    pub instrs: Range<usize>,
    /// Taken edge first, then the fall-through.
    pub successors: SmallVec<[usize; 2]>,
}

/// Blocks of one Code object in offset order; block 0 is the entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodeCfg {
    pub blocks: Vec<CodeBlock>,
}

impl CodeCfg {
    /// Partition the instructions of `code` into basic blocks.
    pub fn build(code: &CodeRef<'_>) -> Result<Self, LayoutError> {
        let decoded = code.decode()?;
        Self::from_decoded(&decoded, code.header().code_size as usize)
    }

    /// Partition already decoded `(offset, instruction)` pairs spanning
    /// `byte_len` bytes.
    pub fn from_decoded(
        decoded: &[(usize, Instruction)],
        byte_len: usize,
    ) -> Result<Self, LayoutError> {
        // Instruction index starting at each byte offset.
        let mut index_at: Vec<Option<usize>> = vec![None; byte_len + 1];
        for (n, &(offset, _)) in decoded.iter().enumerate() {
            if let Some(slot) = index_at.get_mut(offset) {
                *slot = Some(n);
            }
        }

        let mut leader = vec![false; decoded.len() + 1];
        if let Some(first) = leader.first_mut() {
            *first = true;
        }
        for (n, &(offset, instr)) in decoded.iter().enumerate() {
            if let Some(target) = branch_index(&index_at, offset, instr)? {
                leader[target] = true;
            }
            if instr.ends_block() {
                leader[n + 1] = true;
            }
        }

        let starts: Vec<usize> = (0..decoded.len()).filter(|&n| leader[n]).collect();
        let mut block_of = vec![0; decoded.len()];
        let mut blocks = Vec::with_capacity(starts.len());
        for (b, &start) in starts.iter().enumerate() {
            let end = starts.get(b + 1).copied().unwrap_or(decoded.len());
            block_of[start..end].fill(b);
            let byte_end = decoded.get(end).map_or(byte_len, |&(offset, _)| offset);
            blocks.push(CodeBlock {
                bytes: decoded[start].0..byte_end,
                instrs: start..end,
                successors: SmallVec::new(),
            });
        }

        for block in &mut blocks {
            let last = block.instrs.end - 1;
            let (offset, instr) = decoded[last];
            if let Some(target) = branch_index(&index_at, offset, instr)? {
                block.successors.push(block_of[target]);
            }
            if instr.falls_through() && block.instrs.end < decoded.len() {
                let next = block_of[block.instrs.end];
                if !block.successors.contains(&next) {
                    block.successors.push(next);
                }
            }
        }

        tracing::trace!(
            instructions = decoded.len(),
            blocks = blocks.len(),
            "partitioned code"
        );
        Ok(Self { blocks })
    }

    /// Block whose first instruction starts at byte `offset`.
    pub fn block_at(&self, offset: usize) -> Option<usize> {
        self.blocks.iter().position(|b| b.bytes.start == offset)
    }

    /// Predecessor list of each block, deduplicated and in block order.
    pub fn predecessors(&self) -> Vec<Vec<usize>> {
        let mut predecessors = vec![Vec::new(); self.blocks.len()];
        for (b, block) in self.blocks.iter().enumerate() {
            for &succ in &block.successors {
                if !predecessors[succ].contains(&b) {
                    predecessors[succ].push(b);
                }
            }
        }
        predecessors
    }
}

/// Index of the instruction a branch at `offset` lands on.
fn branch_index(
    index_at: &[Option<usize>],
    offset: usize,
    instr: Instruction,
) -> Result<Option<usize>, LayoutError> {
    let (Instruction::Br { offset: rel }
    | Instruction::BrTrue { offset: rel }
    | Instruction::BrFalse { offset: rel }) = instr
    else {
        return Ok(None);
    };
    instr
        .branch_target(offset)
        .and_then(|target| index_at.get(target).copied().flatten())
        .map(Some)
        .ok_or(LayoutError::BadBranchTarget { at: offset, offset: rel })
}
