/// Lightweight error kind - one byte.
/// The error value itself lives on the raising thread
/// (`LuaState::error_object`) so that it stays visible to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LuaError {
    /// Runtime error raised by code or by the host
    #[error("runtime error")]
    Runtime,
    /// Chunk could not be loaded
    #[error("syntax error")]
    Syntax,
    /// Allocation refused
    #[error("not enough memory")]
    Memory,
    /// Error raised while running a message handler
    #[error("error in error handling")]
    ErrorHandling,
    /// Coroutine yield unwinding to its resume point
    #[error("coroutine yield")]
    Yield,
}

pub type LuaResult<T> = Result<T, LuaError>;

/// Status codes crossing the embedding boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LuaStatus {
    Ok = 0,
    Yield = 1,
    ErrRun = 2,
    ErrSyntax = 3,
    ErrMem = 4,
    ErrErr = 5,
}

impl LuaStatus {
    pub fn is_ok(self) -> bool {
        self == LuaStatus::Ok
    }
}

impl From<LuaError> for LuaStatus {
    fn from(e: LuaError) -> Self {
        match e {
            LuaError::Runtime => LuaStatus::ErrRun,
            LuaError::Syntax => LuaStatus::ErrSyntax,
            LuaError::Memory => LuaStatus::ErrMem,
            LuaError::ErrorHandling => LuaStatus::ErrErr,
            LuaError::Yield => LuaStatus::Yield,
        }
    }
}
