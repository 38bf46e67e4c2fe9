//! Close-time truncation decision.
//!
//! | mode        | eoa vs eof | physical file   | record  |
//! |-------------|------------|-----------------|---------|
//! | Disabled    | any        | set to eoa      | removed |
//! | ExtendOnly  | eoa > eof  | extended to eoa | written |
//! | ExtendOnly  | eoa <= eof | unchanged       | written |
//! | All         | eoa > eof  | extended to eoa | written |
//! | All         | eoa <= eof | unchanged       | written |
//!
//! Growth is never deferred past close: no reader, aware or not, may be
//! able to address bytes beyond the physical end of file.

use tailspace_types::TruncationMode;

use crate::record::ExtensionRecord;

/// What happens to the physical length of a member file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EofAction {
    /// Leave the file as it is.
    Leave,
    /// Shrink the file to the given length.
    Truncate(u64),
    /// Zero-extend the file to the given length.
    Extend(u64),
}

impl EofAction {
    /// The target length, if the file is resized.
    #[must_use]
    pub const fn target(self) -> Option<u64> {
        match self {
            Self::Leave => None,
            Self::Truncate(len) | Self::Extend(len) => Some(len),
        }
    }
}

/// What happens to a member's extension record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    Write(ExtensionRecord),
    Remove,
}

/// The full close decision for one member file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseAction {
    pub eof: EofAction,
    pub record: RecordAction,
    /// EOA and EOF disagreed when the decision was made.
    pub diverged: bool,
}

/// Decide the close action for one member from its mode, tracked EOA and
/// freshly measured EOF.
#[must_use]
pub fn resolve(mode: TruncationMode, eoa: u64, eof: u64) -> CloseAction {
    let eof_action = match (mode, eoa.cmp(&eof)) {
        (_, std::cmp::Ordering::Equal) => EofAction::Leave,
        (_, std::cmp::Ordering::Greater) => EofAction::Extend(eoa),
        (TruncationMode::Disabled, std::cmp::Ordering::Less) => EofAction::Truncate(eoa),
        (TruncationMode::ExtendOnly | TruncationMode::All, std::cmp::Ordering::Less) => {
            EofAction::Leave
        }
    };
    let record = if mode.avoids_truncate() {
        RecordAction::Write(ExtensionRecord::known(eoa, mode))
    } else {
        RecordAction::Remove
    };
    CloseAction {
        eof: eof_action,
        record,
        diverged: eoa != eof,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn disabled_always_matches_eoa() {
        let shrink = resolve(TruncationMode::Disabled, 100, 200);
        assert_eq!(shrink.eof, EofAction::Truncate(100));
        assert_eq!(shrink.record, RecordAction::Remove);

        let grow = resolve(TruncationMode::Disabled, 300, 200);
        assert_eq!(grow.eof, EofAction::Extend(300));

        let same = resolve(TruncationMode::Disabled, 200, 200);
        assert_eq!(same.eof, EofAction::Leave);
        assert!(!same.diverged);
    }

    #[test]
    fn avoid_modes_never_shrink() {
        for mode in [TruncationMode::ExtendOnly, TruncationMode::All] {
            let action = resolve(mode, 100, 200);
            assert_eq!(action.eof, EofAction::Leave);
            assert!(action.diverged);
            assert_eq!(
                action.record,
                RecordAction::Write(ExtensionRecord::known(100, mode))
            );
        }
    }

    #[test]
    fn avoid_modes_extend_on_growth() {
        for mode in [TruncationMode::ExtendOnly, TruncationMode::All] {
            let action = resolve(mode, 300, 200);
            assert_eq!(action.eof, EofAction::Extend(300));
            assert_eq!(action.eof.target(), Some(300));
            assert!(matches!(action.record, RecordAction::Write(r) if r.recorded_eoa == 300));
        }
    }

    proptest! {
        #[test]
        fn resolved_eof_never_below_eoa(eoa in 0u64..1 << 40, eof in 0u64..1 << 40,
                                        mode_idx in 0usize..3) {
            let mode = [TruncationMode::Disabled, TruncationMode::ExtendOnly, TruncationMode::All][mode_idx];
            let action = resolve(mode, eoa, eof);
            let after = action.eof.target().unwrap_or(eof);
            prop_assert!(after >= eoa);
            if mode.avoids_truncate() {
                prop_assert!(after >= eof);
            } else {
                prop_assert_eq!(after, eoa);
            }
        }
    }
}
