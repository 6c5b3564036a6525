use crate::bytecode::table::SymbolTable;

/// A compiled script.
///
/// Layout: callable bodies first, then top-level code ending in `HALT`;
/// `entry` is the byte offset where top-level execution begins. The buffer
/// and table are immutable once compilation finishes, so any number of VM
/// instances may share one unit read-only.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    /// Flat instruction bytes.
    pub code: Vec<u8>,

    /// Offset of the first top-level instruction.
    pub entry: u16,

    /// Constant pool and variable slots referenced by the instructions.
    pub table: SymbolTable,
}

impl CompiledUnit {
    pub fn entry_pc(&self) -> usize {
        self.entry as usize
    }
}
