//! # Chartbuild language data model
//!
//! This module defines the data the bytecode core exchanges with the host:
//! the AST node shapes produced by the host's front end and the runtime
//! `Value` tags that flow through the virtual machine.
//!
//! The AST is consumed read-only; the compiler never rewrites a tree it was
//! handed.

pub mod ast;
pub mod value;
