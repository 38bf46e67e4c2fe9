//! Offline inspection and repair.
//!
//! Repair turns any container into one indistinguishable from a file
//! written with `TruncationMode::Disabled`: every member is set to its true
//! EOA and the avoid-truncate records are dropped. A container that is
//! already in that shape is left byte-for-byte untouched.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tailspace_error::{Result, TailspaceError};
use tailspace_types::{CompatFlag, Layout, MemberId, MessageFlags, OpenFlags};
use tailspace_vfd::{VfdFile, Vfs};
use tracing::{debug, info, warn};

use crate::compat::CompatState;
use crate::message::{Capabilities, MSG_TYPE_AVOID_TRUNCATE, Message, RawMessage};
use crate::metadata::ContainerMetadata;
use crate::record::ExtensionRecord;

/// Read-only view of one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInspection {
    pub member: MemberId,
    /// EOA in the member table.
    pub table_eoa: u64,
    /// EOA re-derived from live metadata.
    pub derived_eoa: u64,
    pub eof: u64,
    pub record: Option<ExtensionRecord>,
    /// Why the avoid-truncate slot could not be decoded.
    pub record_error: Option<String>,
    /// Raw flags of the slot, if any.
    pub message_flags: Option<u8>,
    /// Type of a slot that is not an avoid-truncate record.
    pub unknown_type: Option<u8>,
    pub compat: CompatState,
}

impl MemberInspection {
    /// EOA repair would settle on.
    #[must_use]
    pub fn true_eoa(&self) -> u64 {
        match self.record {
            Some(rec) if rec.flag == CompatFlag::Known => rec.recorded_eoa.max(self.derived_eoa),
            _ => self.derived_eoa,
        }
    }

    fn has_avoid_truncate_slot(&self) -> bool {
        self.record.is_some() || self.record_error.is_some()
    }

    /// Whether repair would change anything for this member.
    #[must_use]
    pub fn needs_repair(&self) -> bool {
        let eoa = self.true_eoa();
        self.has_avoid_truncate_slot() || eoa != self.eof || eoa != self.table_eoa
    }
}

/// Read-only view of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inspection {
    pub layout: Layout,
    pub objects: usize,
    pub members: Vec<MemberInspection>,
}

impl Inspection {
    #[must_use]
    pub fn needs_repair(&self) -> bool {
        self.members.iter().any(MemberInspection::needs_repair)
    }
}

/// What repair did, or would do, to one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemberRepair {
    pub member: MemberId,
    pub eof_before: u64,
    pub eoa: u64,
    pub record_removed: bool,
    pub compat_before: CompatState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Whether anything was (or would be) written.
    pub changed: bool,
    pub dry_run: bool,
    pub members: Vec<MemberRepair>,
}

/// Describe a container without modifying it.
pub fn inspect<V: Vfs>(vfs: &V, path: &Path, layout: Layout) -> Result<Inspection> {
    let mut files = open_members(vfs, path, layout, OpenFlags::READONLY)?;
    let meta = read_metadata(&mut files, layout)?;
    let inspection = inspect_members(&files, &meta)?;
    for file in files.values_mut() {
        file.close()?;
    }
    Ok(inspection)
}

/// Repair `path` in place, or with `dry_run` only report what would change.
pub fn repair<V: Vfs>(vfs: &V, path: &Path, layout: Layout, dry_run: bool) -> Result<RepairReport> {
    let flags = if dry_run {
        OpenFlags::READONLY
    } else {
        OpenFlags::READWRITE
    };
    let mut files = open_members(vfs, path, layout, flags)?;
    let mut meta = read_metadata(&mut files, layout)?;
    let inspection = inspect_members(&files, &meta)?;

    let changed = inspection.needs_repair();
    let members = inspection
        .members
        .iter()
        .map(|m| MemberRepair {
            member: m.member,
            eof_before: m.eof,
            eoa: m.true_eoa(),
            record_removed: m.has_avoid_truncate_slot(),
            compat_before: m.compat,
        })
        .collect::<Vec<_>>();

    if changed && !dry_run {
        for plan in &members {
            let idx = plan.member.as_usize();
            meta.member_eoa[idx] = plan.eoa;
            if plan.record_removed {
                meta.messages[idx] = None;
            } else if let Some(raw) = meta.messages[idx] {
                meta.messages[idx] = Some(raw.pass_through());
            }
        }
        if let Some(file) = files.get_mut(&MemberId::SUPER) {
            meta.write_to(file)?;
        }
        for plan in &members {
            if let Some(file) = files.get_mut(&plan.member) {
                file.set_eof(plan.eoa)?;
                file.sync()?;
            }
            debug!(
                member = plan.member.get(),
                eof_before = plan.eof_before,
                eoa = plan.eoa,
                record_removed = plan.record_removed,
                "repaired member"
            );
        }
        info!(path = %path.display(), "container repaired");
    } else if !changed {
        debug!(path = %path.display(), "container already consistent");
    }

    for file in files.values_mut() {
        file.close()?;
    }
    Ok(RepairReport {
        changed,
        dry_run,
        members,
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

fn read_metadata<F: VfdFile>(
    files: &mut BTreeMap<MemberId, F>,
    layout: Layout,
) -> Result<ContainerMetadata> {
    let file = files
        .get_mut(&MemberId::SUPER)
        .ok_or_else(|| TailspaceError::internal("layout has no super member"))?;
    let meta = ContainerMetadata::read_from(file)?;
    if meta.layout != layout {
        return Err(TailspaceError::LayoutMismatch {
            found: meta.layout.to_string(),
            requested: layout.to_string(),
        });
    }
    Ok(meta)
}

fn inspect_members<F: VfdFile>(
    files: &BTreeMap<MemberId, F>,
    meta: &ContainerMetadata,
) -> Result<Inspection> {
    let mut members = Vec::with_capacity(files.len());
    for (&id, file) in files {
        let slot = meta.messages[id.as_usize()];
        let mut record = None;
        let mut record_error = None;
        let mut unknown_type = None;
        if let Some(raw) = slot {
            match Message::interpret(raw, Capabilities::aware(), id) {
                Ok(Message::AvoidTruncate { record: found, .. }) => record = Some(found),
                Ok(Message::Unknown(raw)) => unknown_type = Some(raw.type_id),
                Err(err) => {
                    warn!(member = id.get(), error = %err, "unreadable extension record");
                    record_error = Some(err.to_string());
                }
            }
        }
        let compat = match (record, slot) {
            (Some(rec), _) => CompatState::from_record(Some(&rec)),
            (None, Some(raw)) if raw.type_id == MSG_TYPE_AVOID_TRUNCATE => {
                if raw.flags.contains(MessageFlags::WAS_UNKNOWN) {
                    CompatState::RecordWasUnknown
                } else {
                    CompatState::RecordKnown
                }
            }
            _ => CompatState::NoRecord,
        };
        members.push(MemberInspection {
            member: id,
            table_eoa: meta.member_eoa[id.as_usize()],
            derived_eoa: meta.derived_eoa(id),
            eof: file.get_eof()?,
            record,
            record_error,
            message_flags: slot.map(|raw: RawMessage| raw.flags.bits()),
            unknown_type,
            compat,
        });
    }
    Ok(Inspection {
        layout: meta.layout,
        objects: meta.objects.len(),
        members,
    })
}
