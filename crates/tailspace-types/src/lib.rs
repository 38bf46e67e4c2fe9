//! Plain value types shared by the tailspace crates.

pub mod flags;

pub use flags::{MessageFlags, OpenFlags};

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Number of allocation classes (and therefore the maximum member count).
pub const ALLOC_CLASS_COUNT: usize = 6;

/// Close-time truncation policy for a file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum TruncationMode {
    /// Always truncate to EOA on close.
    #[default]
    Disabled,
    /// Never shrink below the physical EOF; growth extends immediately.
    ExtendOnly,
    /// Never shrink; the persisted record is authoritative for EOA.
    All,
}

impl TruncationMode {
    /// Whether closes in this mode keep an extension record.
    #[must_use]
    pub const fn avoids_truncate(self) -> bool {
        !matches!(self, Self::Disabled)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::ExtendOnly => "extend-only",
            Self::All => "all",
        }
    }
}

impl fmt::Display for TruncationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TruncationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(Self::Disabled),
            "extend-only" | "extend_only" | "extend" => Ok(Self::ExtendOnly),
            "all" => Ok(Self::All),
            other => Err(format!("unknown truncation mode: {other}")),
        }
    }
}

/// Whether the last writer of an extension record understood it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub enum CompatFlag {
    /// Written (and validated) by an aware implementation.
    #[default]
    Known,
    /// Passed through unmodified by an implementation that did not
    /// understand it; `recorded_eoa` is unverified.
    WasUnknown,
}

impl CompatFlag {
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Known => 0,
            Self::WasUnknown => 1,
        }
    }

    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Known),
            1 => Some(Self::WasUnknown),
            _ => None,
        }
    }
}

/// Kind of space being allocated. Multi-member layouts route each class to
/// its own member file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum AllocClass {
    Super,
    Btree,
    RawData,
    GlobalHeap,
    LocalHeap,
    ObjectHeader,
}

impl AllocClass {
    pub const ALL: [Self; ALLOC_CLASS_COUNT] = [
        Self::Super,
        Self::Btree,
        Self::RawData,
        Self::GlobalHeap,
        Self::LocalHeap,
        Self::ObjectHeader,
    ];

    #[must_use]
    pub const fn index(self) -> u8 {
        match self {
            Self::Super => 0,
            Self::Btree => 1,
            Self::RawData => 2,
            Self::GlobalHeap => 3,
            Self::LocalHeap => 4,
            Self::ObjectHeader => 5,
        }
    }

    /// File-name suffix used by the multi-member layout.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Super => "s",
            Self::Btree => "b",
            Self::RawData => "r",
            Self::GlobalHeap => "g",
            Self::LocalHeap => "l",
            Self::ObjectHeader => "o",
        }
    }
}

/// Identifier of one physical member file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct MemberId(u8);

impl MemberId {
    /// The member holding the superblock and all container metadata.
    pub const SUPER: Self = Self(0);

    /// Create a member id, rejecting indices past the class table.
    #[must_use]
    pub const fn new(index: u8) -> Option<Self> {
        if (index as usize) < ALLOC_CLASS_COUNT {
            Some(Self(index))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How allocation classes map onto physical files.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    /// Every class lives in one file.
    #[default]
    Single,
    /// One member file per allocation class.
    Multi,
}

impl Layout {
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Single => 0,
            Self::Multi => 1,
        }
    }

    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Single),
            1 => Some(Self::Multi),
            _ => None,
        }
    }

    #[must_use]
    pub const fn member_count(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Multi => ALLOC_CLASS_COUNT,
        }
    }

    /// The member file that serves allocations of `class`.
    #[must_use]
    pub const fn member_for(self, class: AllocClass) -> MemberId {
        match self {
            Self::Single => MemberId::SUPER,
            Self::Multi => MemberId(class.index()),
        }
    }

    /// All members of this layout, in ascending order.
    pub fn members(self) -> impl Iterator<Item = MemberId> {
        (0..self.member_count()).filter_map(|i| u8::try_from(i).ok().and_then(MemberId::new))
    }

    /// Physical path of `member` for a container named `base`.
    #[must_use]
    pub fn member_path(self, base: &Path, member: MemberId) -> PathBuf {
        match self {
            Self::Single => base.to_path_buf(),
            Self::Multi => {
                let suffix = AllocClass::ALL[member.as_usize()].suffix();
                let mut name = base.as_os_str().to_os_string();
                name.push("-");
                name.push(suffix);
                PathBuf::from(name)
            }
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multi => "multi",
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When an object's data extent is allocated.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub enum AllocTime {
    /// Deferred until data is first written.
    #[default]
    Late,
    /// Allocated when the object is created.
    Early,
}

impl AllocTime {
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Late => 0,
            Self::Early => 1,
        }
    }

    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Late),
            1 => Some(Self::Early),
            _ => None,
        }
    }
}

/// A contiguous allocated range in one member file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Extent {
    pub member: MemberId,
    pub addr: u64,
    pub size: u64,
}

impl Extent {
    /// One past the last byte; saturates instead of wrapping.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.addr.saturating_add(self.size)
    }

    /// Both extents are in the same member and share at least one byte.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.member.get() == other.member.get()
            && self.size > 0
            && other.size > 0
            && self.addr < other.end()
            && other.addr < self.end()
    }
}
