//! # Chartbuild bytecode core
//!
//! The compilation and execution engine for the Chartbuild scripting
//! language used to script chart content. The host's front end produces an
//! AST ([`lang::ast`]); this crate turns it into a flat instruction buffer
//! ([`compile`]) and executes that buffer on a stack-based virtual machine
//! ([`Vm`]).
//!
//! ```
//! use chartbuild::{compile, create_vm, Expr, NativeRegistry, Stmt, Value};
//!
//! let program = vec![Stmt::Let {
//!     name: "bpm".to_string(),
//!     value: Expr::Int(180),
//! }];
//!
//! let natives = NativeRegistry::new();
//! let unit = compile(&program, &natives).unwrap();
//! let result = create_vm(&unit, &natives).run().unwrap();
//! assert_eq!(result, Value::Null);
//! ```
//!
//! Compilation and execution are single-threaded and synchronous. A compiled
//! unit is immutable after [`compile`] returns, so independent VM instances
//! may share one unit (and one native registry) read-only.

pub mod bytecode;
pub mod lang;
pub mod runtime;

pub use bytecode::compile::{Compiler, compile};
pub use bytecode::compile_error::CompileError;
pub use bytecode::disasm::disassemble;
pub use bytecode::table::SymbolTable;
pub use bytecode::unit::CompiledUnit;
pub use lang::ast::{BinOp, Expr, Stmt, UnOp};
pub use lang::value::Value;
pub use runtime::native::{NativeRegistry, TypeTag};
pub use runtime::runtime_error::{FaultKind, RuntimeError};
pub use runtime::vm::{Vm, VmConfig};

/// Create a virtual machine over a compiled unit.
pub fn create_vm<'a>(unit: &'a CompiledUnit, natives: &'a NativeRegistry) -> Vm<'a> {
    Vm::new(unit, natives)
}
