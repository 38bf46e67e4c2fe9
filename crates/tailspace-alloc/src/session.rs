//! One open container and the allocation state of its member files.
//!
//! A [`FileSession`] owns every member handle for its lifetime. Mutations
//! lock the session once; [`FileSession::close`] runs the close policy for
//! each member in `MemberId` order, writes the metadata region, then
//! applies the physical length changes. A session that changed no
//! allocation and found every record current writes no bytes.
//! Dropping a session that was never closed runs the same path.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tailspace_error::{Result, TailspaceError};
use tailspace_types::{
    AllocClass, AllocTime, Extent, Layout, MemberId, MessageFlags, OpenFlags, TruncationMode,
};
use tailspace_vfd::{VfdFile, Vfs};
use tracing::{debug, error, warn};

use crate::compat::{self, CompatEvent, CompatState, Reconciliation};
use crate::message::{Capabilities, MSG_TYPE_AVOID_TRUNCATE, Message, RawMessage};
use crate::metadata::{
    ContainerMetadata, MAX_OBJECTS, METADATA_REGION_SIZE, OBJECT_HEADER_SIZE, OBJECT_NAME_MAX,
    ObjectEntry,
};
use crate::options::OpenOptions;
use crate::policy::{self, CloseAction, EofAction, RecordAction};
use crate::record::ExtensionRecord;
use crate::tracker::{AllocationTracker, FreeOutcome};

/// What close did to one member file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberCloseReport {
    pub member: MemberId,
    /// Tracked EOA at close.
    pub eoa: u64,
    /// Physical length measured before the close action.
    pub eof_before: u64,
    /// Physical length after the close action.
    pub eof_after: u64,
    /// `None` for read-only sessions, which change nothing.
    pub action: Option<CloseAction>,
    /// The session allocated or freed space in this member.
    pub dirty: bool,
    /// The written record asks unaware openers to refuse read-write.
    pub writer_guard: bool,
    /// A message this session did not understand was carried forward.
    pub passed_through: bool,
    pub compat: CompatState,
}

/// Outcome of closing a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReport {
    pub mode: TruncationMode,
    pub members: Vec<MemberCloseReport>,
    /// The metadata region was rewritten. A session that changed nothing
    /// leaves every member file untouched.
    pub metadata_written: bool,
}

impl CloseReport {
    #[must_use]
    pub fn member(&self, member: MemberId) -> Option<&MemberCloseReport> {
        self.members.iter().find(|m| m.member == member)
    }
}

struct MemberState<F> {
    file: F,
    tracker: AllocationTracker,
    /// Physical length when the session opened the member.
    eof_at_open: u64,
    compat: CompatState,
    /// Record as interpreted at open.
    record: Option<ExtensionRecord>,
    /// Slot contents this session does not understand.
    foreign: Option<RawMessage>,
    seeded: Option<Reconciliation>,
}

struct SessionInner<F> {
    members: BTreeMap<MemberId, MemberState<F>>,
    meta: ContainerMetadata,
    closed: bool,
}

impl<F: VfdFile> SessionInner<F> {
    fn member(&self, member: MemberId) -> Result<&MemberState<F>> {
        self.members.get(&member).ok_or_else(|| not_a_member(member))
    }

    fn member_mut(&mut self, member: MemberId) -> Result<&mut MemberState<F>> {
        self.members
            .get_mut(&member)
            .ok_or_else(|| not_a_member(member))
    }

    fn allocate(&mut self, member: MemberId, size: u64, mode: TruncationMode) -> Result<u64> {
        let state = self.member_mut(member)?;
        let addr = state.tracker.allocate(size)?;
        if mode == TruncationMode::ExtendOnly {
            let eoa = state.tracker.eoa();
            if eoa > state.file.get_eof()? {
                state.file.set_eof(eoa)?;
                debug!(member = member.get(), eoa, "extended member on allocation");
            }
        }
        Ok(addr)
    }

    fn free(&mut self, extent: Extent) -> Result<FreeOutcome> {
        self.member_mut(extent.member)?
            .tracker
            .free(extent.addr, extent.size)
    }

    /// Name of a live object whose header or data overlaps `extent`.
    fn owner_of(&self, extent: &Extent) -> Option<&str> {
        self.meta
            .objects
            .iter()
            .find(|o| {
                o.header.overlaps(extent) || o.data.is_some_and(|d| d.overlaps(extent))
            })
            .map(|o| o.name.as_str())
    }
}

fn member_tracker(member: MemberId, eoa: u64, limit: u64) -> AllocationTracker {
    let tracker = AllocationTracker::new(member, eoa, limit);
    if member == MemberId::SUPER {
        tracker.with_floor(METADATA_REGION_SIZE)
    } else {
        tracker
    }
}

fn not_a_member(member: MemberId) -> TailspaceError {
    TailspaceError::internal(format!("member {member} is not part of this container"))
}

/// An open container.
pub struct FileSession<F: VfdFile> {
    path: PathBuf,
    layout: Layout,
    mode: TruncationMode,
    writable: bool,
    capabilities: Capabilities,
    /// The session created the container; nothing on disk predates it.
    created: bool,
    inner: Mutex<SessionInner<F>>,
}

impl<F: VfdFile> fmt::Debug for FileSession<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSession")
            .field("path", &self.path)
            .field("layout", &self.layout)
            .field("mode", &self.mode)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

impl<F: VfdFile> FileSession<F> {
    /// Create a new container at `path`, discarding any existing member
    /// files.
    pub fn create<V: Vfs<File = F>>(vfs: &V, path: &Path, options: OpenOptions) -> Result<Self> {
        let options = options.validated();
        if !options.is_writable() {
            return Err(TailspaceError::ReadOnly);
        }
        let layout = options.layout;
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        let files = open_members(vfs, path, layout, flags)?;

        let mut members = BTreeMap::new();
        for (id, file) in files {
            let mut tracker = member_tracker(id, 0, options.address_limit);
            if id == MemberId::SUPER {
                tracker.allocate(METADATA_REGION_SIZE)?;
            }
            members.insert(
                id,
                MemberState {
                    file,
                    tracker,
                    eof_at_open: 0,
                    compat: CompatState::NoRecord,
                    record: None,
                    foreign: None,
                    seeded: None,
                },
            );
        }

        let mode = session_mode(&options, None);
        debug!(path = %path.display(), layout = %layout, mode = %mode, "created container");
        Ok(Self {
            path: path.to_path_buf(),
            layout,
            mode,
            writable: true,
            capabilities: options.capabilities,
            created: true,
            inner: Mutex::new(SessionInner {
                members,
                meta: ContainerMetadata::new(layout),
                closed: false,
            }),
        })
    }

    /// Open an existing container.
    ///
    /// Every member's EOA is seeded before the session is returned; any
    /// member that cannot be opened in the requested access fails the
    /// whole open.
    pub fn open<V: Vfs<File = F>>(vfs: &V, path: &Path, options: OpenOptions) -> Result<Self> {
        let options = options.validated();
        let layout = options.layout;
        let writable = options.is_writable();
        let capabilities = options.capabilities;

        let mut files = open_members(vfs, path, layout, options.access)?;
        let meta = match files.get_mut(&MemberId::SUPER) {
            Some(file) => ContainerMetadata::read_from(file)?,
            None => return Err(not_a_member(MemberId::SUPER)),
        };
        if meta.layout != layout {
            return Err(TailspaceError::LayoutMismatch {
                found: meta.layout.to_string(),
                requested: layout.to_string(),
            });
        }

        let mut members = BTreeMap::new();
        for (id, file) in files {
            let eof = file.get_eof()?;
            let seed = if capabilities.avoid_truncate {
                seed_aware(id, &meta, eof, capabilities, writable)?
            } else {
                seed_legacy(id, &meta, eof, writable)?
            };
            members.insert(
                id,
                MemberState {
                    file,
                    tracker: member_tracker(id, seed.eoa, options.address_limit),
                    eof_at_open: eof,
                    compat: seed.compat,
                    record: seed.record,
                    foreign: seed.foreign,
                    seeded: seed.reconciliation,
                },
            );
        }

        let persisted = members
            .values()
            .find_map(|m| m.record.map(|r| r.mode));
        let mode = session_mode(&options, persisted);
        debug!(
            path = %path.display(),
            layout = %layout,
            mode = %mode,
            writable,
            aware = capabilities.avoid_truncate,
            "opened container"
        );
        Ok(Self {
            path: path.to_path_buf(),
            layout,
            mode,
            writable,
            capabilities,
            created: false,
            inner: Mutex::new(SessionInner {
                members,
                meta,
                closed: false,
            }),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn layout(&self) -> Layout {
        self.layout
    }

    /// Truncation mode applied at close.
    #[must_use]
    pub const fn mode(&self) -> TruncationMode {
        self.mode
    }

    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.writable
    }

    /// Tracked EOA of `member`.
    pub fn eoa(&self, member: MemberId) -> Result<u64> {
        Ok(self.inner.lock().member(member)?.tracker.eoa())
    }

    /// Current physical length of `member`.
    pub fn eof(&self, member: MemberId) -> Result<u64> {
        self.inner.lock().member(member)?.file.get_eof()
    }

    pub fn compat_state(&self, member: MemberId) -> Result<CompatState> {
        Ok(self.inner.lock().member(member)?.compat)
    }

    /// The record found for `member` at open, as this session interpreted
    /// it.
    pub fn record(&self, member: MemberId) -> Result<Option<ExtensionRecord>> {
        Ok(self.inner.lock().member(member)?.record)
    }

    /// How `member`'s EOA was seeded. `None` for created containers and
    /// legacy openers.
    pub fn reconciliation(&self, member: MemberId) -> Result<Option<Reconciliation>> {
        Ok(self.inner.lock().member(member)?.seeded)
    }

    /// Reserve `size` bytes of `class` space at its member's EOA.
    pub fn allocate(&self, class: AllocClass, size: u64) -> Result<Extent> {
        self.ensure_writable()?;
        let member = self.layout.member_for(class);
        let addr = self.inner.lock().allocate(member, size, self.mode)?;
        Ok(Extent { member, addr, size })
    }

    /// Release an extent returned by [`allocate`](Self::allocate).
    ///
    /// Space still owned by a live object is released only through
    /// [`delete_object`](Self::delete_object).
    pub fn free(&self, extent: Extent) -> Result<FreeOutcome> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        if let Some(object) = inner.owner_of(&extent) {
            return Err(TailspaceError::ExtentInUse {
                member: extent.member.get(),
                offset: extent.addr,
                size: extent.size,
                object: object.to_owned(),
            });
        }
        inner.free(extent)
    }

    /// Add a named object: a header in the object-header class and, for
    /// early allocation, its data in the raw-data class.
    pub fn create_object(
        &self,
        name: &str,
        data_size: u64,
        alloc_time: AllocTime,
    ) -> Result<ObjectEntry> {
        self.ensure_writable()?;
        if name.len() > OBJECT_NAME_MAX {
            return Err(TailspaceError::NameTooLong {
                name: name.to_owned(),
                max: OBJECT_NAME_MAX,
            });
        }
        let mut inner = self.inner.lock();
        if inner.meta.object(name).is_some() {
            return Err(TailspaceError::ObjectExists {
                name: name.to_owned(),
            });
        }
        if inner.meta.objects.len() >= MAX_OBJECTS {
            return Err(TailspaceError::DirectoryFull { max: MAX_OBJECTS });
        }

        let header_member = self.layout.member_for(AllocClass::ObjectHeader);
        let header = Extent {
            member: header_member,
            addr: inner.allocate(header_member, OBJECT_HEADER_SIZE, self.mode)?,
            size: OBJECT_HEADER_SIZE,
        };
        let data = if alloc_time == AllocTime::Early && data_size > 0 {
            let data_member = self.layout.member_for(AllocClass::RawData);
            match inner.allocate(data_member, data_size, self.mode) {
                Ok(addr) => Some(Extent {
                    member: data_member,
                    addr,
                    size: data_size,
                }),
                Err(err) => {
                    inner.free(header)?;
                    return Err(err);
                }
            }
        } else {
            None
        };

        let entry = ObjectEntry {
            name: name.to_owned(),
            header,
            data,
            data_size,
            alloc_time,
        };
        debug!(
            object = name,
            header_addr = header.addr,
            data_addr = data.map(|d| d.addr),
            data_size,
            "created object"
        );
        inner.meta.objects.push(entry.clone());
        Ok(entry)
    }

    /// Remove an object, freeing its data before its header so trailing
    /// blocks are reclaimed in allocation order.
    pub fn delete_object(&self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        let idx = inner
            .meta
            .objects
            .iter()
            .position(|o| o.name == name)
            .ok_or_else(|| TailspaceError::NoSuchObject {
                name: name.to_owned(),
            })?;
        let entry = inner.meta.objects.remove(idx);
        if let Some(data) = entry.data {
            inner.free(data)?;
        }
        let outcome = inner.free(entry.header)?;
        debug!(object = name, ?outcome, "deleted object");
        Ok(())
    }

    #[must_use]
    pub fn object(&self, name: &str) -> Option<ObjectEntry> {
        self.inner.lock().meta.object(name).cloned()
    }

    #[must_use]
    pub fn objects(&self) -> Vec<ObjectEntry> {
        self.inner.lock().meta.objects.clone()
    }

    /// Close the session, applying the truncation policy to every member.
    pub fn close(self) -> Result<CloseReport> {
        self.finish()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(TailspaceError::ReadOnly)
        }
    }

    fn finish(&self) -> Result<CloseReport> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TailspaceError::internal("session already closed"));
        }
        inner.closed = true;
        if self.writable {
            self.close_writable(&mut *inner)
        } else {
            close_read_only(&mut *inner, self.mode)
        }
    }

    fn close_writable(&self, inner: &mut SessionInner<F>) -> Result<CloseReport> {
        let SessionInner { members, meta, .. } = inner;
        let mut reports = Vec::with_capacity(members.len());

        let mut changed = Vec::with_capacity(members.len());

        for (&id, state) in members.iter_mut() {
            let eoa = state.tracker.eoa();
            let eof = state.file.get_eof()?;
            let dirty = state.tracker.is_dirty();
            let idx = id.as_usize();
            let foreign = state.foreign;

            let (action, slot, writer_guard, passed_through, compat) =
                if self.capabilities.avoid_truncate {
                    let action = policy::resolve(self.mode, eoa, eof);
                    // Growth applied during the session counts as divergence
                    // even when the file already caught up.
                    let writer_guard =
                        !self.created && (action.diverged || eoa != state.eof_at_open);
                    match action.record {
                        RecordAction::Write(record) => {
                            if let Some(raw) = foreign {
                                warn!(
                                    member = id.get(),
                                    type_id = raw.type_id,
                                    "extension record replaces an unknown message"
                                );
                            }
                            (
                                action,
                                Some(Message::avoid_truncate(record, writer_guard)),
                                writer_guard,
                                false,
                                state.compat.transition(CompatEvent::AwareClose {
                                    record_written: true,
                                }),
                            )
                        }
                        RecordAction::Remove => (
                            action,
                            foreign.map(RawMessage::pass_through),
                            false,
                            foreign.is_some(),
                            state.compat.transition(CompatEvent::AwareClose {
                                record_written: false,
                            }),
                        ),
                    }
                } else {
                    let marked =
                        foreign.is_some_and(|raw| raw.flags.contains(MessageFlags::MARK_IF_UNKNOWN));
                    (
                        policy::resolve(TruncationMode::Disabled, eoa, eof),
                        foreign.map(RawMessage::pass_through),
                        false,
                        foreign.is_some(),
                        state
                            .compat
                            .transition(CompatEvent::UnawarePassThrough { marked }),
                    )
                };

            let member_changed = self.created
                || dirty
                || action.eof != EofAction::Leave
                || meta.member_eoa[idx] != eoa
                || meta.messages[idx] != slot;
            meta.member_eoa[idx] = eoa;
            meta.messages[idx] = slot;
            state.compat = compat;
            debug!(
                member = id.get(),
                eoa,
                eof,
                mode = %self.mode,
                action = ?action.eof,
                dirty,
                writer_guard,
                compat = %compat,
                "close decision"
            );
            changed.push(member_changed);
            reports.push(MemberCloseReport {
                member: id,
                eoa,
                eof_before: eof,
                eof_after: eof,
                action: Some(action),
                dirty,
                writer_guard,
                passed_through,
                compat,
            });
        }

        let metadata_written = changed.iter().any(|&c| c);
        if metadata_written {
            let super_member = members
                .get_mut(&MemberId::SUPER)
                .ok_or_else(|| not_a_member(MemberId::SUPER))?;
            meta.write_to(&mut super_member.file)?;
        } else {
            debug!(path = %self.path.display(), "session left the container unchanged");
        }

        for (report, member_changed) in reports.iter_mut().zip(changed) {
            let state = members
                .get_mut(&report.member)
                .ok_or_else(|| not_a_member(report.member))?;
            if let Some(len) = report.action.and_then(|a| a.eof.target()) {
                state.file.set_eof(len)?;
            }
            if member_changed || (metadata_written && report.member == MemberId::SUPER) {
                state.file.sync()?;
            }
            report.eof_after = state.file.get_eof()?;
            state.file.close()?;
        }

        Ok(CloseReport {
            mode: self.mode,
            members: reports,
            metadata_written,
        })
    }
}

impl<F: VfdFile> Drop for FileSession<F> {
    fn drop(&mut self) {
        if self.inner.lock().closed {
            return;
        }
        if let Err(err) = self.finish() {
            error!(path = %self.path.display(), error = %err, "close on drop failed");
        }
    }
}

fn close_read_only<F: VfdFile>(
    inner: &mut SessionInner<F>,
    mode: TruncationMode,
) -> Result<CloseReport> {
    let mut reports = Vec::with_capacity(inner.members.len());
    for (&id, state) in &mut inner.members {
        let eof = state.file.get_eof()?;
        state.file.close()?;
        reports.push(MemberCloseReport {
            member: id,
            eoa: state.tracker.eoa(),
            eof_before: eof,
            eof_after: eof,
            action: None,
            dirty: false,
            writer_guard: false,
            passed_through: false,
            compat: state.compat,
        });
    }
    Ok(CloseReport {
        mode,
        members: reports,
        metadata_written: false,
    })
}

fn open_members<V: Vfs>(
    vfs: &V,
    path: &Path,
    layout: Layout,
    flags: OpenFlags,
) -> Result<BTreeMap<MemberId, V::File>> {
    layout
        .members()
        .map(|id| Ok((id, vfs.open(&layout.member_path(path, id), flags)?)))
        .collect()
}

/// Legacy openers know only `Disabled`; aware ones prefer the explicit
/// option, then the persisted mode.
fn session_mode(options: &OpenOptions, persisted: Option<TruncationMode>) -> TruncationMode {
    if !options.capabilities.avoid_truncate {
        return TruncationMode::Disabled;
    }
    options.mode.or(persisted).unwrap_or_default()
}

struct Seed {
    eoa: u64,
    compat: CompatState,
    record: Option<ExtensionRecord>,
    foreign: Option<RawMessage>,
    reconciliation: Option<Reconciliation>,
}

fn seed_aware(
    member: MemberId,
    meta: &ContainerMetadata,
    eof: u64,
    capabilities: Capabilities,
    writable: bool,
) -> Result<Seed> {
    let mut record = None;
    let mut foreign = None;
    if let Some(raw) = meta.messages[member.as_usize()] {
        match Message::interpret(raw, capabilities, member) {
            Ok(Message::AvoidTruncate { record: found, .. }) => record = Some(found),
            Ok(Message::Unknown(raw)) => {
                raw.check_unknown(member, writable)?;
                foreign = Some(raw);
            }
            Err(err @ (TailspaceError::CorruptRecord { .. } | TailspaceError::UnexpectedLength { .. }))
                if !writable =>
            {
                warn!(
                    member = member.get(),
                    error = %err,
                    "unreadable extension record; treating member as legacy"
                );
            }
            Err(err) => return Err(err),
        }
    }

    let derived_eoa = meta.derived_eoa(member);
    let reconciliation = compat::reconcile(member, record.as_ref(), derived_eoa, eof, writable)?;
    let compat = CompatState::from_record(record.as_ref())
        .transition(CompatEvent::AwareOpen { writable });
    debug!(
        member = member.get(),
        eoa = reconciliation.eoa,
        eof,
        derived_eoa,
        source = ?reconciliation.source,
        compat = %compat,
        "seeded member"
    );
    Ok(Seed {
        eoa: reconciliation.eoa,
        compat,
        record,
        foreign,
        reconciliation: Some(reconciliation),
    })
}

/// Seed a member the way an implementation without avoid-truncate does:
/// the member table is the only EOA, and it must agree with the file.
fn seed_legacy(member: MemberId, meta: &ContainerMetadata, eof: u64, writable: bool) -> Result<Seed> {
    let foreign = meta.messages[member.as_usize()];
    if let Some(raw) = foreign {
        raw.check_unknown(member, writable)?;
    }
    let eoa = meta.member_eoa[member.as_usize()];
    if writable && eoa != eof {
        return Err(TailspaceError::EoaMismatch {
            member: member.get(),
            eoa,
            eof,
        });
    }
    if eoa > eof {
        return Err(TailspaceError::AllocationExceedsFile {
            member: member.get(),
            eoa,
            eof,
        });
    }
    debug!(member = member.get(), eoa, eof, "seeded member (legacy)");
    Ok(Seed {
        eoa,
        compat: observed_state(foreign.as_ref()),
        record: None,
        foreign,
        reconciliation: None,
    })
}

/// The record's state as seen from outside; a legacy opener cannot
/// interpret the slot itself.
fn observed_state(slot: Option<&RawMessage>) -> CompatState {
    match slot {
        Some(raw) if raw.type_id == MSG_TYPE_AVOID_TRUNCATE => {
            if raw.flags.contains(MessageFlags::WAS_UNKNOWN) {
                CompatState::RecordWasUnknown
            } else {
                CompatState::RecordKnown
            }
        }
        _ => CompatState::NoRecord,
    }
}
