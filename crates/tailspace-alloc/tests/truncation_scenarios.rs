//! Divergence scenarios between EOA and EOF, exercised on disk and in
//! memory, in both member layouts.
//!
//! Baseline: a container created with `TruncationMode::All` holding three
//! objects without data.
//!
//! - trailing free: deleting the newest object leaves `eoa < eof`;
//! - growth: an early-allocated 64x128 4-byte region leaves `eoa > eof`
//!   until close extends the file;
//! - repair: rewrites the trailing-free result into a legacy-compatible
//!   file.

use std::path::{Path, PathBuf};

use tailspace_alloc::{
    Capabilities, CompatState, EofAction, FileSession, OpenOptions, RecordAction, repair,
};
use tailspace_error::TailspaceError;
use tailspace_types::{AllocClass, AllocTime, CompatFlag, Layout, MemberId, TruncationMode};
use tailspace_vfd::{MemoryVfs, UnixVfs, VfdFile, Vfs};
use tempfile::tempdir;

const GROWTH_BYTES: u64 = 64 * 128 * 4;

fn aware(layout: Layout) -> OpenOptions {
    OpenOptions::default().layout(layout)
}

fn legacy(layout: Layout) -> OpenOptions {
    OpenOptions::default()
        .layout(layout)
        .capabilities(Capabilities::legacy())
}

fn header_member(layout: Layout) -> MemberId {
    layout.member_for(AllocClass::ObjectHeader)
}

fn data_member(layout: Layout) -> MemberId {
    layout.member_for(AllocClass::RawData)
}

fn member_len<V: Vfs>(vfs: &V, path: &Path, layout: Layout, member: MemberId) -> u64 {
    let mut file = vfs
        .open(
            &layout.member_path(path, member),
            tailspace_types::OpenFlags::READONLY,
        )
        .unwrap();
    let len = file.get_eof().unwrap();
    file.close().unwrap();
    len
}

fn baseline<V: Vfs>(vfs: &V, path: &Path, layout: Layout) {
    let session =
        FileSession::create(vfs, path, aware(layout).mode(TruncationMode::All)).unwrap();
    for name in ["Dataset1", "Dataset2", "Dataset3"] {
        session.create_object(name, 0, AllocTime::Early).unwrap();
    }
    let report = session.close().unwrap();
    for member in &report.members {
        assert_eq!(member.eof_after, member.eoa, "member {}", member.member);
        assert!(!member.writer_guard);
    }
}

/// Delete the trailing object; returns the header member's (eoa, eof).
fn trailing_free<V: Vfs>(vfs: &V, path: &Path, layout: Layout) -> (u64, u64) {
    baseline(vfs, path, layout);
    let session = FileSession::open(vfs, path, aware(layout)).unwrap();
    assert_eq!(session.mode(), TruncationMode::All);
    session.delete_object("Dataset3").unwrap();
    let report = session.close().unwrap();

    let member = *report.member(header_member(layout)).unwrap();
    let action = member.action.unwrap();
    assert_eq!(action.eof, EofAction::Leave);
    assert!(matches!(action.record, RecordAction::Write(_)));
    assert!(member.writer_guard);
    (member.eoa, member.eof_after)
}

fn check_trailing_free<V: Vfs>(vfs: &V, path: &Path, layout: Layout) {
    let (eoa, eof) = trailing_free(vfs, path, layout);
    assert!(eoa < eof, "eoa {eoa} should trail eof {eof}");

    let session = FileSession::open(vfs, path, aware(layout).read_only()).unwrap();
    let record = session.record(header_member(layout)).unwrap().unwrap();
    assert_eq!(record.flag, CompatFlag::Known);
    assert_eq!(record.recorded_eoa, eoa);
    session.close().unwrap();

    let err = FileSession::open(vfs, path, legacy(layout)).unwrap_err();
    assert!(
        matches!(
            err,
            TailspaceError::UnknownMessage { .. } | TailspaceError::EoaMismatch { .. }
        ),
        "unexpected error: {err}"
    );
    let session = FileSession::open(vfs, path, legacy(layout).read_only()).unwrap();
    assert_eq!(session.eoa(header_member(layout)).unwrap(), eoa);
    session.close().unwrap();
}

fn check_growth<V: Vfs>(vfs: &V, path: &Path, layout: Layout) {
    trailing_free(vfs, path, layout);
    let member = data_member(layout);
    let eof_before = member_len(vfs, path, layout, member);

    let session = FileSession::open(vfs, path, aware(layout)).unwrap();
    let entry = session
        .create_object("Dataset4", GROWTH_BYTES, AllocTime::Early)
        .unwrap();
    assert_eq!(entry.data.unwrap().size, GROWTH_BYTES);
    let report = session.close().unwrap();

    let data = *report.member(member).unwrap();
    assert!(data.eoa > eof_before);
    assert_eq!(data.action.unwrap().eof, EofAction::Extend(data.eoa));
    assert!(data.writer_guard);
    assert_eq!(member_len(vfs, path, layout, member), data.eoa);

    let session = FileSession::open(vfs, path, aware(layout).read_only()).unwrap();
    assert_eq!(
        session.record(member).unwrap().unwrap().recorded_eoa,
        data.eoa
    );
    session.close().unwrap();

    assert!(FileSession::open(vfs, path, legacy(layout)).is_err());
    FileSession::open(vfs, path, legacy(layout).read_only())
        .unwrap()
        .close()
        .unwrap();
}

fn check_repair<V: Vfs>(vfs: &V, path: &Path, layout: Layout) {
    let (eoa, _) = trailing_free(vfs, path, layout);
    let report = repair(vfs, path, layout, false).unwrap();
    assert!(report.changed);
    assert!(report.members.iter().all(|m| m.record_removed));

    assert_eq!(member_len(vfs, path, layout, header_member(layout)), eoa);

    let session = FileSession::open(vfs, path, legacy(layout)).unwrap();
    assert_eq!(session.eoa(header_member(layout)).unwrap(), eoa);
    session.close().unwrap();

    let session = FileSession::open(vfs, path, aware(layout)).unwrap();
    assert_eq!(session.mode(), TruncationMode::Disabled);
    for member in layout.members() {
        assert_eq!(session.record(member).unwrap(), None);
        assert_eq!(session.compat_state(member).unwrap(), CompatState::NoRecord);
    }
    session.close().unwrap();
}

fn disk_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("scenario.tsc")
}

#[test]
fn trailing_free_single_memory() {
    check_trailing_free(&MemoryVfs::new(), Path::new("/a.tsc"), Layout::Single);
}

#[test]
fn trailing_free_multi_disk() {
    let dir = tempdir().unwrap();
    check_trailing_free(&UnixVfs::new(), &disk_path(&dir), Layout::Multi);
}

#[test]
fn growth_single_disk() {
    let dir = tempdir().unwrap();
    check_growth(&UnixVfs::new(), &disk_path(&dir), Layout::Single);
}

#[test]
fn growth_multi_memory() {
    check_growth(&MemoryVfs::new(), Path::new("/b.tsc"), Layout::Multi);
}

#[test]
fn repair_single_disk() {
    let dir = tempdir().unwrap();
    check_repair(&UnixVfs::new(), &disk_path(&dir), Layout::Single);
}

#[test]
fn repair_multi_memory() {
    check_repair(&MemoryVfs::new(), Path::new("/c.tsc"), Layout::Multi);
}

#[test]
fn multi_layout_creates_one_file_per_class() {
    let dir = tempdir().unwrap();
    let path = disk_path(&dir);
    baseline(&UnixVfs::new(), &path, Layout::Multi);
    for suffix in ["s", "b", "r", "g", "l", "o"] {
        let member = dir.path().join(format!("scenario.tsc-{suffix}"));
        assert!(member.exists(), "missing {}", member.display());
    }
    assert!(!path.exists());
}

#[test]
fn recorded_eoa_round_trips() {
    for mode in [TruncationMode::ExtendOnly, TruncationMode::All] {
        let vfs = MemoryVfs::new();
        let path = Path::new("/rt.tsc");
        let session = FileSession::create(&vfs, path, aware(Layout::Multi).mode(mode)).unwrap();
        session.create_object("x", 1000, AllocTime::Early).unwrap();
        session.create_object("y", 0, AllocTime::Late).unwrap();
        let extent = session.allocate(AllocClass::Btree, 512).unwrap();
        session.free(extent).unwrap();
        session.allocate(AllocClass::GlobalHeap, 96).unwrap();
        let report = session.close().unwrap();

        let session = FileSession::open(&vfs, path, aware(Layout::Multi).read_only()).unwrap();
        assert_eq!(session.mode(), mode);
        for member in &report.members {
            let record = session.record(member.member).unwrap().unwrap();
            assert_eq!(record.recorded_eoa, member.eoa, "{mode} member {}", member.member);
            assert_eq!(record.mode, mode);
        }
        session.close().unwrap();
    }
}

#[test]
fn allocation_beyond_address_limit_overflows() {
    let vfs = MemoryVfs::new();
    let path = Path::new("/limit.tsc");
    let session = FileSession::create(
        &vfs,
        path,
        aware(Layout::Multi).address_limit(1 << 16),
    )
    .unwrap();
    session.allocate(AllocClass::RawData, 1 << 15).unwrap();
    let err = session.allocate(AllocClass::RawData, (1 << 15) + 1).unwrap_err();
    assert!(matches!(
        err,
        TailspaceError::AllocationOverflow { member: 2, .. }
    ));
    assert_eq!(err.error_code(), tailspace_error::ErrorCode::Full);
    session.allocate(AllocClass::Btree, 1 << 15).unwrap();
    session.close().unwrap();
}
