use crate::lang::value::Value;

// =============================================================================
// TABLE - Constant pool and variable slots
// =============================================================================
//
// One table per compilation unit. Constants are interned by value equality;
// variable slots are append-only and never reused, so an address stays valid
// for the program's whole lifetime. Several chunks may declare same-named
// locals - each gets its own slot; name-level bookkeeping belongs to the
// scope chunks, not to this table.

/// Errors raised by table lookups and appends.
#[derive(Debug, Clone, PartialEq)]
pub enum TableError {
    /// An index that was never issued.
    OutOfRange {
        what: &'static str,
        index: u16,
        len: usize,
    },
    /// A 16-bit index space overflowed.
    Exhausted { what: &'static str },
}

impl std::fmt::Display for TableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableError::OutOfRange { what, index, len } => {
                write!(f, "{} index {} out of range (have {})", what, index, len)
            }
            TableError::Exhausted { what } => {
                write!(f, "{} space exhausted (65536 entries)", what)
            }
        }
    }
}

impl std::error::Error for TableError {}

#[derive(Debug, Clone)]
struct VarSlot {
    name: String,
    init: Value,
}

/// The constant pool and variable-slot table of one compilation unit.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    consts: Vec<Value>,
    vars: Vec<VarSlot>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    /// Intern a constant, returning the existing index when an equal value is
    /// already pooled. Equality is by value, never by handle identity.
    pub fn intern_const(&mut self, value: Value) -> Result<u16, TableError> {
        if let Some(idx) = self.consts.iter().position(|c| *c == value) {
            return Ok(idx as u16);
        }

        let idx = self.consts.len();
        if idx > u16::MAX as usize {
            return Err(TableError::Exhausted { what: "constant" });
        }

        self.consts.push(value);
        Ok(idx as u16)
    }

    /// Append a fresh variable slot. Never rejects on name alone: duplicate
    /// detection is the declaring scope chunk's responsibility.
    pub fn declare_var(&mut self, name: &str, init: Value) -> Result<u16, TableError> {
        let addr = self.vars.len();
        if addr > u16::MAX as usize {
            return Err(TableError::Exhausted { what: "variable" });
        }

        self.vars.push(VarSlot {
            name: name.to_string(),
            init,
        });
        Ok(addr as u16)
    }

    pub fn const_at(&self, index: u16) -> Result<&Value, TableError> {
        self.consts
            .get(index as usize)
            .ok_or(TableError::OutOfRange {
                what: "constant",
                index,
                len: self.consts.len(),
            })
    }

    pub fn var_name(&self, addr: u16) -> Result<&str, TableError> {
        self.vars
            .get(addr as usize)
            .map(|slot| slot.name.as_str())
            .ok_or(TableError::OutOfRange {
                what: "variable",
                index: addr,
                len: self.vars.len(),
            })
    }

    pub fn const_count(&self) -> usize {
        self.consts.len()
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    /// Initial slot contents for a fresh VM run, in address order.
    pub fn initial_slots(&self) -> Vec<Value> {
        self.vars.iter().map(|slot| slot.init.clone()).collect()
    }
}
