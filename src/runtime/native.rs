use crate::lang::value::Value;
use crate::runtime::runtime_error::RuntimeError;

// =============================================================================
// NATIVE - Host-provided function bindings
// =============================================================================
//
// Natives are registered once, before compilation begins, and the registry is
// passed into the compiler explicitly - never held as ambient global state -
// so compilation stays pure and testable. The compiler installs each entry
// as a variable in the outermost scope whose initial value is a
// `Value::Native` handle; call sites then reach natives through ordinary
// variable loads.

/// Argument type descriptor for a native binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Any,
    Int,
    Float,
    /// Either numeric tag.
    Number,
    Bool,
    Str,
    Array,
    Callable,
}

impl TypeTag {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            TypeTag::Any => true,
            TypeTag::Int => matches!(value, Value::Int(_)),
            TypeTag::Float => matches!(value, Value::Float(_)),
            TypeTag::Number => matches!(value, Value::Int(_) | Value::Float(_)),
            TypeTag::Bool => matches!(value, Value::Bool(_)),
            TypeTag::Str => matches!(value, Value::Str(_)),
            TypeTag::Array => matches!(value, Value::Array(_)),
            TypeTag::Callable => value.is_callable(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Any => "any",
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::Number => "number",
            TypeTag::Bool => "bool",
            TypeTag::Str => "string",
            TypeTag::Array => "array",
            TypeTag::Callable => "callable",
        }
    }
}

type NativeFn = Box<dyn Fn(&[Value]) -> Result<Value, RuntimeError>>;

/// One registered binding: name, argument descriptors, implementation.
pub struct NativeDef {
    pub name: String,
    pub params: Vec<TypeTag>,
    func: NativeFn,
}

impl NativeDef {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn invoke(&self, args: &[Value]) -> Result<Value, RuntimeError> {
        (self.func)(args)
    }
}

impl std::fmt::Debug for NativeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeDef({}/{})", self.name, self.arity())
    }
}

/// The set of native bindings available to one compilation.
#[derive(Debug, Default)]
pub struct NativeRegistry {
    defs: Vec<NativeDef>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        NativeRegistry::default()
    }

    /// Registry pre-loaded with a `print` debug binding that writes each
    /// argument's display form to stdout and returns null.
    pub fn with_debug_print() -> Self {
        let mut registry = NativeRegistry::new();
        registry.register("print", vec![TypeTag::Any], |args| {
            println!("{}", args[0]);
            Ok(Value::Null)
        });
        registry
    }

    /// Register a binding; at most 255 parameters. Returns its index.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        params: Vec<TypeTag>,
        func: impl Fn(&[Value]) -> Result<Value, RuntimeError> + 'static,
    ) -> u16 {
        let idx = self.defs.len() as u16;
        self.defs.push(NativeDef {
            name: name.into(),
            params,
            func: Box::new(func),
        });
        idx
    }

    pub fn get(&self, idx: u16) -> Option<&NativeDef> {
        self.defs.get(idx as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NativeDef> {
        self.defs.iter()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}
