//! Session configuration.

use serde::{Deserialize, Serialize};
use tailspace_types::{Layout, OpenFlags, TruncationMode};

use crate::message::Capabilities;
use crate::metadata::METADATA_REGION_SIZE;

/// How a [`FileSession`](crate::FileSession) opens or creates a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    /// Read-only or read-write. `CREATE`/`TRUNCATE` are implied by
    /// `FileSession::create`.
    pub access: OpenFlags,

    /// Explicit truncation mode. `None` keeps the mode persisted in the
    /// file's records, or `Disabled` if there are none.
    pub mode: Option<TruncationMode>,

    /// Member layout the container uses.
    pub layout: Layout,

    /// Which metadata messages the opener understands.
    ///
    /// Default: aware. `Capabilities::legacy()` reproduces an
    /// implementation that predates avoid-truncate.
    pub capabilities: Capabilities,

    /// Ceiling on any member's EOA.
    ///
    /// Default: `u64::MAX`.
    pub address_limit: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            access: OpenFlags::READWRITE,
            mode: None,
            layout: Layout::Single,
            capabilities: Capabilities::aware(),
            address_limit: u64::MAX,
        }
    }
}

impl OpenOptions {
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.access = OpenFlags::READONLY;
        self
    }

    #[must_use]
    pub fn read_write(mut self) -> Self {
        self.access = OpenFlags::READWRITE;
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: TruncationMode) -> Self {
        self.mode = Some(mode);
        self
    }

    #[must_use]
    pub fn layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    #[must_use]
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn address_limit(mut self, limit: u64) -> Self {
        self.address_limit = limit;
        self
    }

    /// Whether the session may mutate the container.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.access.is_writable()
    }

    /// Validate and clamp configuration values.
    ///
    /// Read-write wins over read-only when both are set; a read-only
    /// access never carries `CREATE` or `TRUNCATE`. The address limit
    /// always leaves room for the metadata region. A legacy opener has no
    /// notion of truncation modes, so any explicit mode is dropped.
    #[must_use]
    pub fn validated(mut self) -> Self {
        if self.access.contains(OpenFlags::READWRITE) {
            self.access.remove(OpenFlags::READONLY);
        } else {
            self.access = OpenFlags::READONLY;
        }
        if self.address_limit < METADATA_REGION_SIZE {
            self.address_limit = METADATA_REGION_SIZE;
        }
        if !self.capabilities.avoid_truncate {
            self.mode = None;
        }
        self
    }
}
