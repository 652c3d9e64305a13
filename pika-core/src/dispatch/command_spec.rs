/// Arity constraints for a command, counting the command name itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandArity {
    /// Command must have exactly this many tokens.
    Exact(usize),
    /// Command must have at least this many tokens.
    AtLeast(usize),
}

impl CommandArity {
    /// Returns `true` when `argc` tokens satisfy this constraint.
    #[must_use]
    pub const fn accepts(self, argc: usize) -> bool {
        match self {
            Self::Exact(expected) => argc == expected,
            Self::AtLeast(minimum) => argc >= minimum,
        }
    }
}

/// Effect class of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Reads the store.
    Read,
    /// Mutates the store; rejected on readonly nodes and appended to the binlog.
    Write,
    /// Server administration; runs without the storage lock.
    Admin,
}

/// Metadata and callback for one command table entry.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec<H> {
    /// Canonical uppercase command name.
    pub name: &'static str,
    /// Arity constraint used for lightweight input validation.
    pub arity: CommandArity,
    /// Effect class.
    pub kind: CommandKind,
    /// Handler callback.
    pub handler: H,
}
