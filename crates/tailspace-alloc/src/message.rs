//! Metadata message slots and the unknown-message pass-through rules.
//!
//! Each member file owns one 16-byte slot in the container metadata:
//! ```text
//! Offset  Size  Description
//!   0       1   Message type (0 empty, 1 avoid-truncate)
//!   1       1   MessageFlags
//!   2       2   Body size (LE)
//!   4      12   Body
//! ```
//! Which types an opener understands is an explicit [`Capabilities`]
//! value. Anything it does not understand decodes as [`Message::Unknown`]
//! and is carried forward byte-for-byte.

use tailspace_error::{Result, TailspaceError};
use tailspace_types::{CompatFlag, MemberId, MessageFlags};

use crate::record::{ExtensionRecord, RECORD_LEN, RECORD_LEN_U16};

/// Encoded size of one message slot.
pub const MESSAGE_SLOT_LEN: usize = 4 + RECORD_LEN;

/// Slot type of an empty slot.
pub const MSG_TYPE_NONE: u8 = 0;
/// Slot type of the avoid-truncate extension record.
pub const MSG_TYPE_AVOID_TRUNCATE: u8 = 1;

/// Message types an implementation understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Capabilities {
    pub avoid_truncate: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::aware()
    }
}

impl Capabilities {
    /// An implementation that understands the avoid-truncate record.
    #[must_use]
    pub const fn aware() -> Self {
        Self {
            avoid_truncate: true,
        }
    }

    /// An implementation that predates avoid-truncate.
    #[must_use]
    pub const fn legacy() -> Self {
        Self {
            avoid_truncate: false,
        }
    }

    #[must_use]
    pub const fn understands(self, type_id: u8) -> bool {
        match type_id {
            MSG_TYPE_AVOID_TRUNCATE => self.avoid_truncate,
            _ => false,
        }
    }
}

/// A message slot exactly as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMessage {
    pub type_id: u8,
    pub flags: MessageFlags,
    pub size: u16,
    pub body: [u8; RECORD_LEN],
}

impl RawMessage {
    /// Parse a slot; an empty slot is `None`.
    pub fn decode_slot(bytes: &[u8]) -> Result<Option<Self>> {
        if bytes.len() != MESSAGE_SLOT_LEN {
            return Err(TailspaceError::UnexpectedLength {
                expected: MESSAGE_SLOT_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] == MSG_TYPE_NONE {
            return Ok(None);
        }
        let mut body = [0u8; RECORD_LEN];
        body.copy_from_slice(&bytes[4..]);
        Ok(Some(Self {
            type_id: bytes[0],
            flags: MessageFlags::from_bits_retain(bytes[1]),
            size: u16::from_le_bytes([bytes[2], bytes[3]]),
            body,
        }))
    }

    /// Serialize a slot; `None` is the empty slot.
    #[must_use]
    pub fn encode_slot(slot: Option<&Self>) -> [u8; MESSAGE_SLOT_LEN] {
        let mut buf = [0u8; MESSAGE_SLOT_LEN];
        if let Some(msg) = slot {
            buf[0] = msg.type_id;
            buf[1] = msg.flags.bits();
            buf[2..4].copy_from_slice(&msg.size.to_le_bytes());
            buf[4..].copy_from_slice(&msg.body);
        }
        buf
    }

    /// Refuse the open if this unknown message forbids it.
    pub fn check_unknown(&self, member: MemberId, writable: bool) -> Result<()> {
        let forbidden = self.flags.contains(MessageFlags::FAIL_IF_UNKNOWN_ALWAYS)
            || (writable
                && self
                    .flags
                    .contains(MessageFlags::FAIL_IF_UNKNOWN_AND_OPEN_FOR_WRITE));
        if forbidden {
            return Err(TailspaceError::UnknownMessage {
                member: member.get(),
                type_id: self.type_id,
            });
        }
        Ok(())
    }

    /// The bytes an unaware writer stores back: body untouched, marked if
    /// the message asks for it.
    #[must_use]
    pub fn pass_through(mut self) -> Self {
        if self.flags.contains(MessageFlags::MARK_IF_UNKNOWN) {
            self.flags.insert(MessageFlags::WAS_UNKNOWN);
        }
        self
    }
}

/// A decoded message slot, as seen by one opener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    AvoidTruncate {
        record: ExtensionRecord,
        flags: MessageFlags,
    },
    Unknown(RawMessage),
}

impl Message {
    /// Decode `raw` with the opener's capabilities.
    ///
    /// A `WAS_UNKNOWN` marker in the slot header downgrades the record's
    /// flag, since a pass-through can never rewrite the body.
    pub fn interpret(raw: RawMessage, caps: Capabilities, member: MemberId) -> Result<Self> {
        if !caps.understands(raw.type_id) {
            return Ok(Self::Unknown(raw));
        }
        if usize::from(raw.size) != RECORD_LEN {
            return Err(TailspaceError::UnexpectedLength {
                expected: RECORD_LEN,
                actual: usize::from(raw.size),
            });
        }
        let mut record = ExtensionRecord::decode(member, &raw.body)?;
        if raw.flags.contains(MessageFlags::WAS_UNKNOWN) {
            record.flag = CompatFlag::WasUnknown;
        }
        Ok(Self::AvoidTruncate {
            record,
            flags: raw.flags,
        })
    }

    /// Slot contents an aware writer stores for `record`.
    ///
    /// `guard_writers` asks implementations that do not understand the
    /// record to refuse read-write opens.
    #[must_use]
    pub fn avoid_truncate(record: ExtensionRecord, guard_writers: bool) -> RawMessage {
        let mut flags = MessageFlags::MARK_IF_UNKNOWN;
        if guard_writers {
            flags |= MessageFlags::FAIL_IF_UNKNOWN_AND_OPEN_FOR_WRITE;
        }
        let record = ExtensionRecord {
            flag: CompatFlag::Known,
            ..record
        };
        RawMessage {
            type_id: MSG_TYPE_AVOID_TRUNCATE,
            flags,
            size: RECORD_LEN_U16,
            body: record.encode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tailspace_types::TruncationMode;

    fn record_message(guard: bool) -> RawMessage {
        Message::avoid_truncate(ExtensionRecord::known(4096, TruncationMode::All), guard)
    }

    #[test]
    fn empty_slot_decodes_as_none() {
        assert_eq!(RawMessage::decode_slot(&[0u8; MESSAGE_SLOT_LEN]).unwrap(), None);
        assert_eq!(RawMessage::encode_slot(None), [0u8; MESSAGE_SLOT_LEN]);
    }

    #[test]
    fn slot_bytes_survive_decode_encode() {
        let raw = record_message(true);
        let bytes = RawMessage::encode_slot(Some(&raw));
        assert_eq!(bytes[0], MSG_TYPE_AVOID_TRUNCATE);
        assert_eq!(bytes[1], 0x03);
        assert_eq!(RawMessage::decode_slot(&bytes).unwrap(), Some(raw));
    }

    #[test]
    fn aware_opener_decodes_record() {
        let msg = Message::interpret(record_message(false), Capabilities::aware(), MemberId::SUPER)
            .unwrap();
        match msg {
            Message::AvoidTruncate { record, flags } => {
                assert_eq!(record.recorded_eoa, 4096);
                assert_eq!(record.flag, CompatFlag::Known);
                assert_eq!(flags, MessageFlags::MARK_IF_UNKNOWN);
            }
            Message::Unknown(_) => panic!("aware opener must understand the record"),
        }
    }

    #[test]
    fn legacy_opener_sees_unknown() {
        let raw = record_message(false);
        let msg = Message::interpret(raw, Capabilities::legacy(), MemberId::SUPER).unwrap();
        assert_eq!(msg, Message::Unknown(raw));
    }

    #[test]
    fn pass_through_marks_but_keeps_body() {
        let raw = record_message(false);
        let passed = raw.pass_through();
        assert_eq!(passed.body, raw.body);
        assert!(passed.flags.contains(MessageFlags::WAS_UNKNOWN));

        let msg = Message::interpret(passed, Capabilities::aware(), MemberId::SUPER).unwrap();
        assert!(matches!(
            msg,
            Message::AvoidTruncate { record, .. } if record.flag == CompatFlag::WasUnknown
        ));
    }

    #[test]
    fn pass_through_without_mark_flag_is_verbatim() {
        let mut raw = record_message(false);
        raw.flags = MessageFlags::empty();
        assert_eq!(raw.pass_through(), raw);
    }

    #[test]
    fn unknown_fail_flags() {
        let guarded = record_message(true);
        assert!(guarded.check_unknown(MemberId::SUPER, false).is_ok());
        assert!(matches!(
            guarded.check_unknown(MemberId::SUPER, true),
            Err(TailspaceError::UnknownMessage { type_id: 1, .. })
        ));

        let mut always = record_message(false);
        always.flags |= MessageFlags::FAIL_IF_UNKNOWN_ALWAYS;
        assert!(always.check_unknown(MemberId::SUPER, false).is_err());
    }

    #[test]
    fn aware_writer_clears_was_unknown() {
        let mut rec = ExtensionRecord::known(1, TruncationMode::All);
        rec.flag = CompatFlag::WasUnknown;
        let raw = Message::avoid_truncate(rec, false);
        assert!(!raw.flags.contains(MessageFlags::WAS_UNKNOWN));
        assert_eq!(raw.body[2], CompatFlag::Known.to_byte());
    }

    #[test]
    fn bad_declared_size_is_unexpected_length() {
        let mut raw = record_message(false);
        raw.size = 8;
        let err = Message::interpret(raw, Capabilities::aware(), MemberId::SUPER).unwrap_err();
        assert!(matches!(err, TailspaceError::UnexpectedLength { actual: 8, .. }));
    }
}
