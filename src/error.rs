//! Typed failures for the non-hot-path surface of the page allocator
//! core.  The hot `alloc`/`dalloc` entry points keep returning
//! `Option`, matching "return null on any unrecoverable failure";
//! construction, configuration, and hook registration return
//! `Result<_, PacError>` so embedders can tell failures apart.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacError {
    /// The hooks implementation failed to obtain VM from the OS.
    OsAllocFailed,
    /// The descriptor pool had no free descriptors left.
    DescriptorPoolExhausted,
    /// The hooks implementation rejected a split.
    SplitRejected,
    /// The hooks implementation rejected a merge.
    MergeRejected,
    /// The hooks implementation failed to commit a range.
    CommitFailed,
    /// A configuration value failed validation.
    InvalidConfig(&'static str),
}

impl fmt::Display for PacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacError::OsAllocFailed => write!(f, "OS allocation failed"),
            PacError::DescriptorPoolExhausted => write!(f, "descriptor pool exhausted"),
            PacError::SplitRejected => write!(f, "split rejected by hooks"),
            PacError::MergeRejected => write!(f, "merge rejected by hooks"),
            PacError::CommitFailed => write!(f, "commit failed"),
            PacError::InvalidConfig(why) => write!(f, "invalid configuration: {}", why),
        }
    }
}

impl std::error::Error for PacError {}
