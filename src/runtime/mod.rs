pub mod native;
pub mod runtime_error;
pub mod vm;

pub use native::{NativeRegistry, TypeTag};
pub use runtime_error::{FaultKind, RuntimeError};
pub use vm::{Vm, VmConfig};
