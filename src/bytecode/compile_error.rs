use crate::bytecode::table::TableError;

#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    /// A name declared twice in the same namespace.
    DuplicateIdentifier { name: String },

    /// A name used outside any reachable scope.
    MissingIdentifier { name: String },

    /// An AST shape the generator does not handle. A compiler defect, not a
    /// user error; surfaced loudly rather than skipped.
    NotImplemented { what: String },

    /// `break`/`continue` outside a loop, `return` outside a function.
    MisplacedControl {
        what: &'static str,
        context: &'static str,
    },

    /// A 16-bit address space or operand range overflowed.
    TooLarge { what: String },

    /// Constant pool / variable table failure.
    Table(TableError),

    /// Internal generator error (shouldn't happen in normal use).
    Internal(String),
}

impl CompileError {
    pub fn duplicate(name: impl Into<String>) -> Self {
        CompileError::DuplicateIdentifier { name: name.into() }
    }

    pub fn missing(name: impl Into<String>) -> Self {
        CompileError::MissingIdentifier { name: name.into() }
    }

    pub fn not_implemented(what: impl Into<String>) -> Self {
        CompileError::NotImplemented { what: what.into() }
    }

    pub fn misplaced(what: &'static str, context: &'static str) -> Self {
        CompileError::MisplacedControl { what, context }
    }

    pub fn too_large(what: impl Into<String>) -> Self {
        CompileError::TooLarge { what: what.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::DuplicateIdentifier { name } => {
                write!(f, "compile error: duplicate identifier '{}'", name)
            }
            CompileError::MissingIdentifier { name } => {
                write!(f, "compile error: unknown identifier '{}'", name)
            }
            CompileError::NotImplemented { what } => {
                write!(f, "compile error: cannot compile {} (not implemented)", what)
            }
            CompileError::MisplacedControl { what, context } => {
                write!(f, "compile error: '{}' {}", what, context)
            }
            CompileError::TooLarge { what } => {
                write!(f, "compile error: {} too large", what)
            }
            CompileError::Table(err) => write!(f, "compile error: {}", err),
            CompileError::Internal(msg) => {
                write!(f, "compile error: internal error: {}", msg)
            }
        }
    }
}

impl std::error::Error for CompileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CompileError::Table(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TableError> for CompileError {
    fn from(err: TableError) -> Self {
        CompileError::Table(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_display() {
        let err = CompileError::duplicate("total");
        let msg = err.to_string();

        assert!(msg.contains("duplicate identifier"));
        assert!(msg.contains("total"));
    }

    #[test]
    fn test_missing_display() {
        let err = CompileError::missing("ghost");
        assert!(err.to_string().contains("unknown identifier 'ghost'"));
    }

    #[test]
    fn test_not_implemented_display() {
        let err = CompileError::not_implemented("assignment to a call result");
        let msg = err.to_string();

        assert!(msg.contains("not implemented"));
        assert!(msg.contains("assignment to a call result"));
    }

    #[test]
    fn test_misplaced_control_display() {
        let err = CompileError::misplaced("break", "outside a loop");
        assert_eq!(err.to_string(), "compile error: 'break' outside a loop");
    }

    #[test]
    fn test_table_error_wraps() {
        let err: CompileError = TableError::Exhausted { what: "constant" }.into();

        assert!(matches!(err, CompileError::Table(_)));
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn test_error_implements_std_error() {
        let err = CompileError::internal("test");
        let _: &dyn std::error::Error = &err;
    }
}
