use std::fmt;

/// Errors surfaced by the core engine (spec.md §7).
///
/// Propagation never retries except in the task supervisor's attach loop,
/// which retries on thread-creation races, not on errors.
#[derive(Debug)]
pub enum DynhookError {
    /// The kernel debug interface (`ptrace`) rejected an operation.
    DebugIo { errno: i32 },
    /// A `/proc/<pid>/maps` line or an object file was structurally unusable.
    Parse(String),
    /// A symbol name was absent, or present but not a function.
    SymbolNotFound(String),
    /// The target function is shorter than the absolute-jump hook sequence.
    TargetTooSmall { have: usize, need: usize },
    /// The prologue contains a relative branch that lands inside the region
    /// about to be overwritten.
    UnrelocatableJumpInto,
    /// The prologue begins with an indirect jump that cannot be bypassed.
    IndirectJump,
    /// A stub reported a failure status code from the remote side.
    StubFailure { code: i64 },
    /// The remote allocator could not grow either pool.
    AllocationFailed,
    /// The target symbol is already patched in this session.
    DuplicatePatch(String),
    /// Ambient I/O failure (opening an object file, reading `/proc`, …).
    Io(std::io::Error),
    /// Ambient `nix` syscall failure not covered by `DebugIo`.
    Nix(nix::Error),
}

impl fmt::Display for DynhookError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DynhookError::DebugIo { errno } => {
                write!(f, "ptrace operation failed, errno {}", errno)
            }
            DynhookError::Parse(msg) => write!(f, "parse error: {}", msg),
            DynhookError::SymbolNotFound(name) => write!(f, "symbol not found: {}", name),
            DynhookError::TargetTooSmall { have, need } => write!(
                f,
                "target function is {} bytes, need at least {} to install the hook",
                have, need
            ),
            DynhookError::UnrelocatableJumpInto => {
                write!(f, "prologue contains a branch into the hook region")
            }
            DynhookError::IndirectJump => {
                write!(f, "prologue begins with an unbypassable indirect jump")
            }
            DynhookError::StubFailure { code } => write!(f, "stub reported failure code {}", code),
            DynhookError::AllocationFailed => write!(f, "remote allocation failed"),
            DynhookError::DuplicatePatch(name) => {
                write!(f, "{} is already patched in this session", name)
            }
            DynhookError::Io(e) => write!(f, "{}", e),
            DynhookError::Nix(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DynhookError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DynhookError::Io(e) => Some(e),
            DynhookError::Nix(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DynhookError {
    fn from(e: std::io::Error) -> Self {
        DynhookError::Io(e)
    }
}

impl From<nix::Error> for DynhookError {
    fn from(e: nix::Error) -> Self {
        match e {
            nix::Error::Sys(errno) => DynhookError::DebugIo {
                errno: errno as i32,
            },
            other => DynhookError::Nix(other),
        }
    }
}

impl From<goblin::error::Error> for DynhookError {
    fn from(e: goblin::error::Error) -> Self {
        DynhookError::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DynhookError>;
