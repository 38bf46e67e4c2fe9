//! The persisted avoid-truncate extension record and its codec.
//!
//! Layout (12 bytes, little-endian):
//! ```text
//! Offset  Size  Description
//!   0       2   Record format version (1)
//!   2       1   Compat flag: 0 known, 1 was-unknown
//!   3       1   Truncation mode: 1 extend-only, 2 all (0 reads as all)
//!   4       8   Recorded EOA
//! ```

use tailspace_error::{Result, TailspaceError};
use tailspace_types::{CompatFlag, MemberId, TruncationMode};

/// Encoded size of an [`ExtensionRecord`].
pub const RECORD_LEN: usize = 12;
pub(crate) const RECORD_LEN_U16: u16 = 12;

/// The only record version this implementation reads or writes.
pub const RECORD_FORMAT_VERSION: u16 = 1;

const MODE_UNSPECIFIED: u8 = 0;
const MODE_EXTEND_ONLY: u8 = 1;
const MODE_ALL: u8 = 2;

/// Allocation state persisted for one member file across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExtensionRecord {
    pub recorded_eoa: u64,
    pub flag: CompatFlag,
    pub format_version: u16,
    pub mode: TruncationMode,
}

impl ExtensionRecord {
    /// A freshly validated record, as an aware writer produces it.
    #[must_use]
    pub const fn known(recorded_eoa: u64, mode: TruncationMode) -> Self {
        Self {
            recorded_eoa,
            flag: CompatFlag::Known,
            format_version: RECORD_FORMAT_VERSION,
            mode,
        }
    }

    /// Serialize into the fixed 12-byte slot body.
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        debug_assert!(
            self.mode.avoids_truncate(),
            "records exist only for avoid-truncate modes"
        );
        let mut buf = [0u8; RECORD_LEN];
        buf[0..2].copy_from_slice(&self.format_version.to_le_bytes());
        buf[2] = self.flag.to_byte();
        buf[3] = match self.mode {
            TruncationMode::ExtendOnly => MODE_EXTEND_ONLY,
            TruncationMode::All => MODE_ALL,
            TruncationMode::Disabled => MODE_UNSPECIFIED,
        };
        buf[4..12].copy_from_slice(&self.recorded_eoa.to_le_bytes());
        buf
    }

    /// Parse a slot body. `member` only labels errors.
    pub fn decode(member: MemberId, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_LEN {
            return Err(TailspaceError::UnexpectedLength {
                expected: RECORD_LEN,
                actual: bytes.len(),
            });
        }
        let format_version = u16::from_le_bytes([bytes[0], bytes[1]]);
        if format_version != RECORD_FORMAT_VERSION {
            return Err(TailspaceError::corrupt_record(
                member.get(),
                format!(
                    "unsupported record version {format_version} (expected {RECORD_FORMAT_VERSION})"
                ),
            ));
        }
        let flag = CompatFlag::from_byte(bytes[2]).ok_or_else(|| {
            TailspaceError::corrupt_record(member.get(), format!("invalid flag {:#04x}", bytes[2]))
        })?;
        let mode = match bytes[3] {
            MODE_EXTEND_ONLY => TruncationMode::ExtendOnly,
            MODE_UNSPECIFIED | MODE_ALL => TruncationMode::All,
            other => {
                return Err(TailspaceError::corrupt_record(
                    member.get(),
                    format!("invalid truncation mode {other:#04x}"),
                ));
            }
        };
        let mut eoa = [0u8; 8];
        eoa.copy_from_slice(&bytes[4..12]);
        Ok(Self {
            recorded_eoa: u64::from_le_bytes(eoa),
            flag,
            format_version,
            mode,
        })
    }
}
