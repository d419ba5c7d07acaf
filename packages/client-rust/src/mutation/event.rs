//! Settlement notifications published after a mutation commits or rolls back.

use std::fmt;

/// Kind of write a mutation performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    /// Whether settling this kind invalidates accumulated page offsets.
    ///
    /// Inserts and removals shift every later row; updates do not.
    #[must_use]
    pub fn resets_pagination(self) -> bool {
        matches!(self, Self::Create | Self::Delete)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published once per mutation, after its cache effects are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettledMutation {
    pub kind: MutationKind,
    /// `false` if the mutation was rolled back.
    pub succeeded: bool,
}
