use std::result;

/// The error type used on the read side of this crate.
///
/// Reader input is untrusted bytes from disk or memory, so every structural
/// problem is reported as a recoverable, typed error. The builder is
/// different: its preconditions are caller contracts and violating them
/// panics.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    #[error("Invalid unwind table version {0}")]
    BadVersion(u32),

    #[error("Common encodings table out of range")]
    CommonEncodingsOutOfRange,

    #[error("Personality table out of range")]
    PersonalityTableOutOfRange,

    #[error("First-level index table out of range")]
    IndexTableOutOfRange,

    #[error("Second-level page offset out of range")]
    SecondLevelPageOutOfRange,

    #[error("First-level table function offsets not ascending")]
    NonMonotonicFirstLevel,

    #[error("Second-level page has unknown kind {0}")]
    BadPageKind(u32),

    #[error("Compressed entry function offset overflows")]
    FunctionOffsetOverflow,

    #[error("Personality index out of range")]
    BadPersonalityIndex,

    #[error("{0}")]
    Generic(&'static str),
}

/// The result type used on the read side of this crate.
pub type Result<T> = result::Result<T, ReadError>;

pub(crate) trait ReadErrorExt<T> {
    fn read_error(self, error: &'static str) -> Result<T>;
}

impl<T> ReadErrorExt<T> for Option<T> {
    fn read_error(self, error: &'static str) -> Result<T> {
        self.ok_or(ReadError::Generic(error))
    }
}
