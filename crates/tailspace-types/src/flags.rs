//! Bit-flag types for open modes and metadata messages.

bitflags::bitflags! {
    /// Flags passed to `Vfs::open` and carried in `OpenOptions`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Open for reading only.
        const READONLY = 0x01;
        /// Open for reading and writing.
        const READWRITE = 0x02;
        /// Create the file if it does not exist.
        const CREATE = 0x04;
        /// Discard existing contents.
        const TRUNCATE = 0x08;
    }
}

impl OpenFlags {
    /// Whether this open may mutate the file.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.contains(Self::READWRITE)
    }
}

impl serde::Serialize for OpenFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for OpenFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Self::from_bits(bits)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid open flags: {bits:#x}")))
    }
}

bitflags::bitflags! {
    /// Generic per-message flags of the container's metadata messages.
    ///
    /// These govern what an implementation that does not recognize a
    /// message type must do with it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u8 {
        /// Unknown readers must refuse read-write opens.
        const FAIL_IF_UNKNOWN_AND_OPEN_FOR_WRITE = 0x01;
        /// Unknown writers must set `WAS_UNKNOWN` when passing it through.
        const MARK_IF_UNKNOWN = 0x02;
        /// Some writer passed this message through without understanding it.
        const WAS_UNKNOWN = 0x04;
        /// Unknown readers must refuse every open.
        const FAIL_IF_UNKNOWN_ALWAYS = 0x08;
    }
}
