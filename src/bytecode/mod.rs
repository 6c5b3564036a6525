pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod op;
pub mod scope;
pub mod table;
pub mod unit;

pub use compile::{Compiler, compile};
pub use compile_error::CompileError;
pub use disasm::disassemble;
pub use op::{Instr, OpCode};
pub use table::{SymbolTable, TableError};
pub use unit::CompiledUnit;
