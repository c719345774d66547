//! Human-readable dump of packed units and their Code objects.

use std::fmt::Write;

use crate::{CodeRef, LayoutError, PackedUnit, UNIT_MAGIC};

/// Render the unit header followed by every Code object in layout order.
pub fn disassemble_unit(unit: &PackedUnit) -> Result<String, LayoutError> {
    let mut out = String::new();
    let origin = unit
        .origin()
        .map_or_else(|| "none".to_owned(), |o| o.to_string());
    let _ = writeln!(
        out,
        "unit 0x{UNIT_MAGIC:08X} ({} bytes, origin {origin}, {} code objects)",
        unit.size(),
        unit.code_count(),
    );
    for code in unit.codes() {
        out.push_str(&disassemble(&code)?);
    }
    Ok(out)
}

/// Render every instruction of `code` on its own line.
///
/// Each line shows the byte offset of the instruction; instructions with a
/// non-zero source index are preceded by a `# (idx N)` marker line. Jumps
/// also show their absolute target.
pub fn disassemble(code: &CodeRef<'_>) -> Result<String, LayoutError> {
    let mut out = String::new();
    let header = code.header();
    // Writing into a String cannot fail.
    let _ = writeln!(
        out,
        "code #{} (src {}, stack {}/{}, {} bytes, {} instrs)",
        code.index(),
        header.source,
        header.stack_depth,
        header.aux_stack_depth,
        header.code_size,
        header.instruction_count,
    );

    for (n, (offset, instr)) in code.decode()?.into_iter().enumerate() {
        let source = code.source_index(n).unwrap_or(0);
        if source != 0 {
            let _ = writeln!(out, "          # (idx {source})");
        }
        let _ = write!(out, " {offset:5x} {instr}");
        if let Some(target) = instr.branch_target(offset) {
            let _ = write!(out, "  -> {target:x}");
        }
        out.push('\n');
    }

    Ok(out)
}
