use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for tailspace operations.
///
/// Structured variants for the allocation/truncation failure classes, plus
/// the container-level failures that surround them.
#[derive(Error, Debug)]
pub enum TailspaceError {
    // === Allocation Errors ===
    /// The address space of a member file is exhausted.
    #[error("allocation overflow in member {member}: eoa {eoa} + {size} exceeds the address space")]
    AllocationOverflow { member: u8, eoa: u64, size: u64 },

    /// A free request does not lie inside the freeable space of a member.
    #[error("invalid free in member {member}: [{offset}, +{size}) is outside the freeable range below eoa {eoa}")]
    InvalidRange {
        member: u8,
        offset: u64,
        size: u64,
        eoa: u64,
    },

    /// A free request overlaps space a live object still uses.
    #[error("invalid free in member {member}: [{offset}, +{size}) overlaps object {object}")]
    ExtentInUse {
        member: u8,
        offset: u64,
        size: u64,
        object: String,
    },

    /// Recorded or derived EOA lies beyond the physical end of file.
    #[error("member {member}: allocation {eoa} exceeds file length {eof}")]
    AllocationExceedsFile { member: u8, eoa: u64, eof: u64 },

    /// Legacy rule: a read-write open requires EOA to equal EOF.
    #[error("member {member}: eoa {eoa} does not match eof {eof}")]
    EoaMismatch { member: u8, eoa: u64, eof: u64 },

    // === Record Errors ===
    /// The persisted extension record cannot be parsed.
    #[error("member {member}: corrupt extension record: {detail}")]
    CorruptRecord { member: u8, detail: String },

    /// The extension record has the wrong byte length.
    #[error("extension record length mismatch: expected {expected} bytes, got {actual}")]
    UnexpectedLength { expected: usize, actual: usize },

    /// A message this implementation does not understand forbids the open.
    #[error("member {member}: unknown message type {type_id} forbids this open")]
    UnknownMessage { member: u8, type_id: u8 },

    // === Container Errors ===
    /// The container metadata region is damaged.
    #[error("container metadata is malformed: {detail}")]
    CorruptMetadata { detail: String },

    /// The file was written with a different member layout.
    #[error("layout mismatch: file uses {found}, opener requested {requested}")]
    LayoutMismatch { found: String, requested: String },

    /// No free slot left in the object directory.
    #[error("object directory is full (max {max})")]
    DirectoryFull { max: usize },

    /// An object with this name already exists.
    #[error("object {name} already exists")]
    ObjectExists { name: String },

    /// No object with this name.
    #[error("no such object: {name}")]
    NoSuchObject { name: String },

    /// Object name does not fit the directory entry.
    #[error("object name too long: {name} (max {max} bytes)")]
    NameTooLong { name: String, max: usize },

    /// Attempt to mutate a session opened read-only.
    #[error("attempt to write a read-only file")]
    ReadOnly,

    // === I/O Errors ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cannot open file.
    #[error("unable to open file: '{path}'")]
    CannotOpen { path: PathBuf },

    // === Internal Errors ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error classes, stable across releases for CLI exit codes and
/// callers that match on numbers rather than variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Address space exhausted.
    Full = 3,
    /// Persisted state is malformed.
    Corrupt = 4,
    /// Allocation state disagrees with the physical file.
    Mismatch = 5,
    /// Attempt to write a read-only file.
    ReadOnly = 6,
    /// Disk I/O error.
    IoErr = 7,
    /// Unable to open file.
    CantOpen = 8,
    /// Incompatible format feature.
    Format = 9,
    /// Misuse of the API (bad name, bad range).
    Misuse = 10,
}

impl TailspaceError {
    /// Map this error to its coarse class.
    #[allow(clippy::match_same_arms)]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::AllocationOverflow { .. } | Self::DirectoryFull { .. } => ErrorCode::Full,
            Self::CorruptRecord { .. }
            | Self::UnexpectedLength { .. }
            | Self::CorruptMetadata { .. } => ErrorCode::Corrupt,
            Self::AllocationExceedsFile { .. } | Self::EoaMismatch { .. } => ErrorCode::Mismatch,
            Self::UnknownMessage { .. } | Self::LayoutMismatch { .. } => ErrorCode::Format,
            Self::InvalidRange { .. }
            | Self::ExtentInUse { .. }
            | Self::ObjectExists { .. }
            | Self::NoSuchObject { .. }
            | Self::NameTooLong { .. } => ErrorCode::Misuse,
            Self::ReadOnly => ErrorCode::ReadOnly,
            Self::Io(_) => ErrorCode::IoErr,
            Self::CannotOpen { .. } => ErrorCode::CantOpen,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether this error blocks a read-write open while a read-only open of
    /// the same file may still succeed.
    pub const fn is_fatal_for_read_write(&self) -> bool {
        matches!(
            self,
            Self::AllocationExceedsFile { .. }
                | Self::EoaMismatch { .. }
                | Self::CorruptRecord { .. }
                | Self::UnexpectedLength { .. }
                | Self::UnknownMessage { .. }
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::AllocationExceedsFile { .. } | Self::EoaMismatch { .. } => {
                Some("Open the file read-only, or run tailspace-extend on it")
            }
            Self::UnknownMessage { .. } => {
                Some("Open with a newer library, or run tailspace-extend on it")
            }
            Self::CorruptRecord { .. } => Some("Open the file read-only to recover its contents"),
            Self::DirectoryFull { .. } => Some("Delete unused objects before creating new ones"),
            _ => None,
        }
    }

    /// Get the process exit code for this error (for CLI use).
    pub const fn exit_code(&self) -> i32 {
        self.error_code() as i32
    }

    /// Create a corrupt-record error.
    pub fn corrupt_record(member: u8, detail: impl Into<String>) -> Self {
        Self::CorruptRecord {
            member,
            detail: detail.into(),
        }
    }

    /// Create a corrupt-metadata error.
    pub fn corrupt_metadata(detail: impl Into<String>) -> Self {
        Self::CorruptMetadata {
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `TailspaceError`.
pub type Result<T> = std::result::Result<T, TailspaceError>;
