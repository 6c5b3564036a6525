use std::cell::RefCell;
use std::rc::Rc;

/// Runtime value in the Chartbuild language.
///
/// Values are the only data that can exist on the VM's operand stack or in a
/// variable slot. Strings and arrays are reference values: cloning a `Value`
/// clones the handle, and writes through one array handle are visible through
/// every other handle to the same array.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 32-bit signed integer.
    Int(i32),

    /// 64-bit floating-point number.
    Float(f64),

    /// Boolean value.
    Bool(bool),

    /// The null / unset value.
    Null,

    /// UTF-8 string reference.
    Str(Rc<String>),

    /// Mutable array reference.
    Array(Rc<RefCell<Vec<Value>>>),

    /// A user-defined callable: entry address into the instruction buffer
    /// plus the declared parameter count.
    Fn { entry: u16, arity: u8 },

    /// A host-provided callable, by index into the native registry.
    Native(u16),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(Rc::new(s.into()))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    /// Human-readable tag name, used in fault messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Null => "null",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Fn { .. } => "function",
            Value::Native(_) => "native function",
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Fn { .. } | Value::Native(_))
    }
}

impl std::fmt::Display for Value {
    /// Format a value using Chartbuild surface syntax.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Null => write!(f, "null"),
            Value::Str(s) => write!(f, "{}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Fn { entry, .. } => write!(f, "<fn @{:04}>", entry),
            Value::Native(idx) => write!(f, "<native #{}>", idx),
        }
    }
}
