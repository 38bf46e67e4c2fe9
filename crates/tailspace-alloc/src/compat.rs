//! Compatibility-flag state machine for the avoid-truncate record.
//!
//! ```text
//! NoRecord ──aware close (avoid-truncate)──▶ RecordKnown
//! RecordKnown ──unaware read-write close──▶ RecordWasUnknown
//! RecordWasUnknown ──aware read-write open──▶ RecordKnown
//! any ──aware close (disabled) / repair──▶ NoRecord
//! ```
//! Aware implementations never move a record into `RecordWasUnknown`.

use std::fmt;

use tailspace_error::{Result, TailspaceError};
use tailspace_types::{CompatFlag, MemberId};
use tracing::warn;

use crate::record::ExtensionRecord;

/// Trust level of one member's persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CompatState {
    /// Legacy or freshly created file: no record.
    NoRecord,
    /// Last written by an implementation that understood it.
    RecordKnown,
    /// Passed through by an implementation that did not understand it.
    RecordWasUnknown,
}

/// Something that happened to a file that may move its [`CompatState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatEvent {
    /// An aware implementation opened the file.
    AwareOpen { writable: bool },
    /// An aware implementation closed read-write and either rewrote the
    /// record or removed it.
    AwareClose { record_written: bool },
    /// An unaware implementation closed read-write, carrying the record
    /// forward; `marked` is whether the slot asked to be marked.
    UnawarePassThrough { marked: bool },
}

impl CompatState {
    /// Initial state for what was found in the slot at open.
    #[must_use]
    pub fn from_record(record: Option<&ExtensionRecord>) -> Self {
        match record.map(|r| r.flag) {
            None => Self::NoRecord,
            Some(CompatFlag::Known) => Self::RecordKnown,
            Some(CompatFlag::WasUnknown) => Self::RecordWasUnknown,
        }
    }

    #[must_use]
    pub const fn transition(self, event: CompatEvent) -> Self {
        match (self, event) {
            (Self::RecordWasUnknown, CompatEvent::AwareOpen { writable: true }) => {
                Self::RecordKnown
            }
            (_, CompatEvent::AwareClose { record_written: true }) => Self::RecordKnown,
            (_, CompatEvent::AwareClose {
                record_written: false,
            }) => Self::NoRecord,
            (Self::RecordKnown, CompatEvent::UnawarePassThrough { marked: true }) => {
                Self::RecordWasUnknown
            }
            (state, _) => state,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoRecord => "no-record",
            Self::RecordKnown => "known",
            Self::RecordWasUnknown => "was-unknown",
        }
    }
}

impl fmt::Display for CompatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a seeded EOA came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EoaSource {
    /// No record: the physical length.
    MeasuredEof,
    /// A known record's `recorded_eoa`.
    Recorded,
    /// Re-derived from the container's live metadata.
    Derived,
}

/// Outcome of open-time reconciliation for one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub eoa: u64,
    pub source: EoaSource,
    /// The record disagreed with live metadata and was replaced.
    pub corrected: bool,
}

/// Seed a member's EOA at an aware open.
///
/// `derived_eoa` is the high-water mark recomputed from live metadata. A
/// record below it is stale and is replaced; a `WasUnknown` record is never
/// trusted. A read-write open additionally requires the result to fit in
/// the physical file.
pub fn reconcile(
    member: MemberId,
    record: Option<&ExtensionRecord>,
    derived_eoa: u64,
    eof: u64,
    writable: bool,
) -> Result<Reconciliation> {
    let reconciliation = match record {
        None => Reconciliation {
            eoa: eof,
            source: EoaSource::MeasuredEof,
            corrected: false,
        },
        Some(rec) if rec.flag == CompatFlag::WasUnknown => {
            warn!(
                member = member.get(),
                recorded_eoa = rec.recorded_eoa,
                derived_eoa,
                "record passed through by an unaware writer; using derived eoa"
            );
            Reconciliation {
                eoa: derived_eoa,
                source: EoaSource::Derived,
                corrected: rec.recorded_eoa != derived_eoa,
            }
        }
        Some(rec) if rec.recorded_eoa < derived_eoa => {
            warn!(
                member = member.get(),
                recorded_eoa = rec.recorded_eoa,
                derived_eoa,
                "known record is below live allocations; using derived eoa"
            );
            Reconciliation {
                eoa: derived_eoa,
                source: EoaSource::Derived,
                corrected: true,
            }
        }
        Some(rec) => Reconciliation {
            eoa: rec.recorded_eoa,
            source: EoaSource::Recorded,
            corrected: false,
        },
    };

    if writable && reconciliation.eoa > eof {
        return Err(TailspaceError::AllocationExceedsFile {
            member: member.get(),
            eoa: reconciliation.eoa,
            eof,
        });
    }
    Ok(reconciliation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tailspace_types::TruncationMode;

    fn was_unknown(eoa: u64) -> ExtensionRecord {
        ExtensionRecord {
            flag: CompatFlag::WasUnknown,
            ..ExtensionRecord::known(eoa, TruncationMode::All)
        }
    }

    #[test]
    fn first_avoid_truncate_close_creates_known() {
        let state = CompatState::from_record(None);
        assert_eq!(state, CompatState::NoRecord);
        assert_eq!(
            state.transition(CompatEvent::AwareClose {
                record_written: true
            }),
            CompatState::RecordKnown
        );
    }

    #[test]
    fn unaware_pass_through_marks_known() {
        let state = CompatState::RecordKnown;
        assert_eq!(
            state.transition(CompatEvent::UnawarePassThrough { marked: true }),
            CompatState::RecordWasUnknown
        );
        assert_eq!(
            state.transition(CompatEvent::UnawarePassThrough { marked: false }),
            CompatState::RecordKnown
        );
        assert_eq!(
            CompatState::NoRecord.transition(CompatEvent::UnawarePassThrough { marked: true }),
            CompatState::NoRecord
        );
    }

    #[test]
    fn aware_read_write_open_repairs_was_unknown() {
        let state = CompatState::from_record(Some(&was_unknown(1)));
        assert_eq!(state, CompatState::RecordWasUnknown);
        assert_eq!(
            state.transition(CompatEvent::AwareOpen { writable: false }),
            CompatState::RecordWasUnknown
        );
        assert_eq!(
            state.transition(CompatEvent::AwareOpen { writable: true }),
            CompatState::RecordKnown
        );
    }

    #[test]
    fn disabled_close_removes_record() {
        assert_eq!(
            CompatState::RecordKnown.transition(CompatEvent::AwareClose {
                record_written: false
            }),
            CompatState::NoRecord
        );
    }

    #[test]
    fn no_record_seeds_from_eof() {
        let r = reconcile(MemberId::SUPER, None, 100, 4096, true).unwrap();
        assert_eq!(r.eoa, 4096);
        assert_eq!(r.source, EoaSource::MeasuredEof);
    }

    #[test]
    fn known_record_is_trusted() {
        let rec = ExtensionRecord::known(3000, TruncationMode::All);
        let r = reconcile(MemberId::SUPER, Some(&rec), 2800, 3500, true).unwrap();
        assert_eq!(r.eoa, 3000);
        assert_eq!(r.source, EoaSource::Recorded);
        assert!(!r.corrected);
    }

    #[test]
    fn stale_known_record_is_corrected() {
        let rec = ExtensionRecord::known(2000, TruncationMode::All);
        let r = reconcile(MemberId::SUPER, Some(&rec), 2800, 3500, true).unwrap();
        assert_eq!(r.eoa, 2800);
        assert!(r.corrected);
    }

    #[test]
    fn was_unknown_uses_derived() {
        let r = reconcile(MemberId::SUPER, Some(&was_unknown(5000)), 2800, 3000, true).unwrap();
        assert_eq!(r.eoa, 2800);
        assert_eq!(r.source, EoaSource::Derived);
        assert!(r.corrected);
    }

    #[test]
    fn exceeding_eof_fails_only_read_write() {
        let rec = ExtensionRecord::known(8192, TruncationMode::All);
        let err = reconcile(MemberId::SUPER, Some(&rec), 0, 4096, true).unwrap_err();
        assert!(matches!(
            err,
            TailspaceError::AllocationExceedsFile {
                eoa: 8192,
                eof: 4096,
                ..
            }
        ));
        let r = reconcile(MemberId::SUPER, Some(&rec), 0, 4096, false).unwrap();
        assert_eq!(r.eoa, 8192);
    }

    fn aware_event() -> impl Strategy<Value = CompatEvent> {
        prop_oneof![
            any::<bool>().prop_map(|writable| CompatEvent::AwareOpen { writable }),
            any::<bool>().prop_map(|record_written| CompatEvent::AwareClose { record_written }),
        ]
    }

    proptest! {
        #[test]
        fn aware_events_never_regress_known(events in prop::collection::vec(aware_event(), 0..24)) {
            let mut state = CompatState::RecordKnown;
            for event in events {
                state = state.transition(event);
                prop_assert_ne!(state, CompatState::RecordWasUnknown);
            }
        }
    }
}
