//! Allocation tracking and close-time truncation policy for tailspace
//! containers.
//!
//! A [`FileSession`] owns one open container. During the session every
//! allocation and free goes through a per-member [`AllocationTracker`]; on
//! close the [`policy`] resolver decides, per member file, whether the
//! physical file is truncated, extended or left alone, and whether the
//! avoid-truncate [`ExtensionRecord`] is written or removed.
//!
//! Files written with avoid-truncate stay legible to implementations that
//! predate it: the record travels in a metadata message slot governed by the
//! generic unknown-message flags in [`message`], and [`compat`] tracks how
//! trustworthy a record is after such an implementation touched it.

pub mod compat;
pub mod message;
pub mod metadata;
pub mod options;
pub mod policy;
pub mod record;
pub mod repair;
pub mod session;
pub mod tracker;

pub use compat::{CompatEvent, CompatState, EoaSource, Reconciliation};
pub use message::{Capabilities, Message, RawMessage};
pub use metadata::{ContainerMetadata, METADATA_REGION_SIZE, ObjectEntry};
pub use options::OpenOptions;
pub use policy::{CloseAction, EofAction, RecordAction, resolve};
pub use record::{ExtensionRecord, RECORD_FORMAT_VERSION, RECORD_LEN};
pub use repair::{Inspection, MemberInspection, MemberRepair, RepairReport, inspect, repair};
pub use session::{CloseReport, FileSession, MemberCloseReport};
pub use tracker::{AllocationTracker, FreeOutcome};
