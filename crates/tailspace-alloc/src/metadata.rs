//! The container metadata region at the start of the super member.
//!
//! Layout (2304 bytes, little-endian):
//! ```text
//! Offset  Size  Description
//!    0      8   Magic: \x89 T S C \r \n \x1a \n
//!    8      1   Container format version (0)
//!    9      1   Layout (0 single, 1 multi)
//!   10      1   Member count
//!   11      1   Reserved
//!   12      4   Live object count
//!   16     48   Member table: 6 x u64 EOA
//!   64     96   Message slots: 6 x 16 bytes
//!  160   2048   Object directory: 32 x 64-byte entries
//! 2208     88   Zero padding
//! 2296      8   xxh3_64 of bytes 0..2296
//! ```
//! The member table is the EOA every implementation understands; the
//! message slots carry the avoid-truncate records.

use tailspace_error::{Result, TailspaceError};
use tailspace_types::{ALLOC_CLASS_COUNT, AllocTime, Extent, Layout, MemberId};
use tailspace_vfd::VfdFile;
use xxhash_rust::xxh3::xxh3_64;

use crate::message::{MESSAGE_SLOT_LEN, RawMessage};

/// Size of the metadata region; it is the first allocation of the super
/// member.
pub const METADATA_REGION_SIZE: u64 = 2304;
const METADATA_REGION_LEN: usize = 2304;

/// Container magic bytes.
pub const CONTAINER_MAGIC: [u8; 8] = *b"\x89TSC\r\n\x1a\n";
/// Container format version written by this implementation.
pub const CONTAINER_FORMAT_VERSION: u8 = 0;

/// Maximum number of live objects in the directory.
pub const MAX_OBJECTS: usize = 32;
/// Maximum object name length in bytes.
pub const OBJECT_NAME_MAX: usize = 24;
/// Bytes reserved for each object header.
pub const OBJECT_HEADER_SIZE: u64 = 272;

const MEMBER_TABLE_OFFSET: usize = 16;
const MESSAGE_SLOTS_OFFSET: usize = 64;
const DIRECTORY_OFFSET: usize = 160;
const ENTRY_LEN: usize = 64;
const CHECKSUM_OFFSET: usize = METADATA_REGION_LEN - 8;

/// One live object: a header extent and, once allocated, a data extent.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ObjectEntry {
    pub name: String,
    pub header: Extent,
    pub data: Option<Extent>,
    /// Logical data size, whether or not it has been allocated.
    pub data_size: u64,
    pub alloc_time: AllocTime,
}

impl ObjectEntry {
    fn extents(&self) -> impl Iterator<Item = Extent> + '_ {
        std::iter::once(self.header).chain(self.data)
    }

    fn encode(&self, out: &mut [u8]) -> Result<()> {
        let name = self.name.as_bytes();
        if name.len() > OBJECT_NAME_MAX {
            return Err(TailspaceError::NameTooLong {
                name: self.name.clone(),
                max: OBJECT_NAME_MAX,
            });
        }
        out.fill(0);
        out[..name.len()].copy_from_slice(name);
        out[24] = self.header.member.get();
        out[25] = self.data.map_or(0, |d| d.member.get());
        out[26] = self.alloc_time.to_byte();
        out[27] = u8::from(self.data.is_some());
        out[32..40].copy_from_slice(&self.header.addr.to_le_bytes());
        out[40..48].copy_from_slice(&self.header.size.to_le_bytes());
        out[48..56].copy_from_slice(&self.data.map_or(0, |d| d.addr).to_le_bytes());
        out[56..64].copy_from_slice(&self.data_size.to_le_bytes());
        Ok(())
    }

    fn decode(buf: &[u8], member_count: usize) -> Result<Self> {
        let name_len = buf[..OBJECT_NAME_MAX]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(OBJECT_NAME_MAX);
        let name = std::str::from_utf8(&buf[..name_len])
            .map_err(|_| TailspaceError::corrupt_metadata("object name is not UTF-8"))?
            .to_owned();
        let member = |b: u8| {
            MemberId::new(b)
                .filter(|m| m.as_usize() < member_count)
                .ok_or_else(|| {
                    TailspaceError::corrupt_metadata(format!("object {name}: bad member {b}"))
                })
        };
        let alloc_time = AllocTime::from_byte(buf[26]).ok_or_else(|| {
            TailspaceError::corrupt_metadata(format!("object {name}: bad alloc time"))
        })?;
        let header = Extent {
            member: member(buf[24])?,
            addr: read_u64(buf, 32),
            size: read_u64(buf, 40),
        };
        let data_size = read_u64(buf, 56);
        let data = match buf[27] {
            0 => None,
            1 => Some(Extent {
                member: member(buf[25])?,
                addr: read_u64(buf, 48),
                size: data_size,
            }),
            other => {
                return Err(TailspaceError::corrupt_metadata(format!(
                    "object {name}: bad data marker {other}"
                )));
            }
        };
        Ok(Self {
            name,
            header,
            data,
            data_size,
            alloc_time,
        })
    }
}

/// Decoded container metadata region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMetadata {
    pub layout: Layout,
    /// Per-member EOA as last written; legacy readers rely on this alone.
    pub member_eoa: [u64; ALLOC_CLASS_COUNT],
    pub messages: [Option<RawMessage>; ALLOC_CLASS_COUNT],
    pub objects: Vec<ObjectEntry>,
}

impl ContainerMetadata {
    /// Empty metadata for a new container.
    #[must_use]
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            member_eoa: [0; ALLOC_CLASS_COUNT],
            messages: [None; ALLOC_CLASS_COUNT],
            objects: Vec::new(),
        }
    }

    #[must_use]
    pub fn object(&self, name: &str) -> Option<&ObjectEntry> {
        self.objects.iter().find(|o| o.name == name)
    }

    /// High-water allocation mark of `member` recomputed from live
    /// metadata: the member table, every live extent, and the metadata
    /// region itself.
    #[must_use]
    pub fn derived_eoa(&self, member: MemberId) -> u64 {
        let floor = if member == MemberId::SUPER {
            METADATA_REGION_SIZE
        } else {
            0
        };
        self.objects
            .iter()
            .flat_map(ObjectEntry::extents)
            .filter(|e| e.member == member)
            .map(|e| e.end())
            .fold(floor.max(self.member_eoa[member.as_usize()]), u64::max)
    }

    /// Serialize into a full metadata region, checksum included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.objects.len() > MAX_OBJECTS {
            return Err(TailspaceError::DirectoryFull { max: MAX_OBJECTS });
        }
        let mut buf = vec![0u8; METADATA_REGION_LEN];
        buf[0..8].copy_from_slice(&CONTAINER_MAGIC);
        buf[8] = CONTAINER_FORMAT_VERSION;
        buf[9] = self.layout.to_byte();
        buf[10] = u8::try_from(self.layout.member_count())
            .map_err(|_| TailspaceError::internal("member count exceeds u8"))?;
        let count = u32::try_from(self.objects.len())
            .map_err(|_| TailspaceError::internal("object count exceeds u32"))?;
        buf[12..16].copy_from_slice(&count.to_le_bytes());

        for (i, eoa) in self.member_eoa.iter().enumerate() {
            let off = MEMBER_TABLE_OFFSET + i * 8;
            buf[off..off + 8].copy_from_slice(&eoa.to_le_bytes());
        }
        for (i, slot) in self.messages.iter().enumerate() {
            let off = MESSAGE_SLOTS_OFFSET + i * MESSAGE_SLOT_LEN;
            buf[off..off + MESSAGE_SLOT_LEN].copy_from_slice(&RawMessage::encode_slot(slot.as_ref()));
        }
        for (i, object) in self.objects.iter().enumerate() {
            let off = DIRECTORY_OFFSET + i * ENTRY_LEN;
            object.encode(&mut buf[off..off + ENTRY_LEN])?;
        }

        let checksum = xxh3_64(&buf[..CHECKSUM_OFFSET]);
        buf[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());
        Ok(buf)
    }

    /// Parse a metadata region.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < METADATA_REGION_LEN {
            return Err(TailspaceError::corrupt_metadata(format!(
                "metadata region too small: expected {METADATA_REGION_LEN}, got {}",
                buf.len()
            )));
        }
        if buf[0..8] != CONTAINER_MAGIC {
            return Err(TailspaceError::corrupt_metadata("bad container magic"));
        }
        let stored = read_u64(buf, CHECKSUM_OFFSET);
        let computed = xxh3_64(&buf[..CHECKSUM_OFFSET]);
        if stored != computed {
            return Err(TailspaceError::corrupt_metadata(format!(
                "checksum mismatch: stored {stored:#018x}, computed {computed:#018x}"
            )));
        }
        if buf[8] != CONTAINER_FORMAT_VERSION {
            return Err(TailspaceError::corrupt_metadata(format!(
                "unsupported container version {}",
                buf[8]
            )));
        }
        let layout = Layout::from_byte(buf[9])
            .ok_or_else(|| TailspaceError::corrupt_metadata(format!("bad layout {}", buf[9])))?;
        if usize::from(buf[10]) != layout.member_count() {
            return Err(TailspaceError::corrupt_metadata(format!(
                "member count {} does not match {layout} layout",
                buf[10]
            )));
        }
        let count = usize::try_from(u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]))
            .map_err(|_| TailspaceError::corrupt_metadata("object count overflow"))?;
        if count > MAX_OBJECTS {
            return Err(TailspaceError::corrupt_metadata(format!(
                "object count {count} exceeds {MAX_OBJECTS}"
            )));
        }

        let mut member_eoa = [0u64; ALLOC_CLASS_COUNT];
        for (i, eoa) in member_eoa.iter_mut().enumerate() {
            *eoa = read_u64(buf, MEMBER_TABLE_OFFSET + i * 8);
        }
        let mut messages = [None; ALLOC_CLASS_COUNT];
        for (i, slot) in messages.iter_mut().enumerate() {
            let off = MESSAGE_SLOTS_OFFSET + i * MESSAGE_SLOT_LEN;
            *slot = RawMessage::decode_slot(&buf[off..off + MESSAGE_SLOT_LEN])?;
        }
        let objects = (0..count)
            .map(|i| {
                let off = DIRECTORY_OFFSET + i * ENTRY_LEN;
                ObjectEntry::decode(&buf[off..off + ENTRY_LEN], layout.member_count())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            layout,
            member_eoa,
            messages,
            objects,
        })
    }

    /// Read and parse the region from the super member.
    pub fn read_from<F: VfdFile>(file: &mut F) -> Result<Self> {
        let mut buf = vec![0u8; METADATA_REGION_LEN];
        let n = file.read_at(&mut buf, 0)?;
        if n < METADATA_REGION_LEN {
            return Err(TailspaceError::corrupt_metadata(format!(
                "file too small for metadata: {n} bytes (< {METADATA_REGION_LEN})"
            )));
        }
        Self::decode(&buf)
    }

    /// Serialize and write the region to the super member.
    pub fn write_to<F: VfdFile>(&self, file: &mut F) -> Result<()> {
        file.write_at(&self.encode()?, 0)
    }
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::record::ExtensionRecord;
    use tailspace_types::TruncationMode;

    fn member(i: u8) -> MemberId {
        MemberId::new(i).unwrap()
    }

    fn sample() -> ContainerMetadata {
        let mut meta = ContainerMetadata::new(Layout::Multi);
        meta.member_eoa[0] = METADATA_REGION_SIZE;
        meta.member_eoa[2] = 32768;
        meta.messages[2] = Some(Message::avoid_truncate(
            ExtensionRecord::known(32768, TruncationMode::All),
            true,
        ));
        meta.objects.push(ObjectEntry {
            name: "Dataset4".to_owned(),
            header: Extent {
                member: member(5),
                addr: 0,
                size: OBJECT_HEADER_SIZE,
            },
            data: Some(Extent {
                member: member(2),
                addr: 0,
                size: 32768,
            }),
            data_size: 32768,
            alloc_time: AllocTime::Early,
        });
        meta
    }

    #[test]
    fn encode_decode_preserves_everything() {
        let meta = sample();
        let buf = meta.encode().unwrap();
        assert_eq!(buf.len(), METADATA_REGION_LEN);
        assert_eq!(&buf[0..8], &CONTAINER_MAGIC);
        assert_eq!(ContainerMetadata::decode(&buf).unwrap(), meta);
    }

    #[test]
    fn checksum_detects_damage() {
        let mut buf = sample().encode().unwrap();
        buf[20] ^= 0xFF;
        let err = ContainerMetadata::decode(&buf).unwrap_err();
        assert!(matches!(err, TailspaceError::CorruptMetadata { .. }));
    }

    #[test]
    fn bad_magic_and_short_buffer() {
        let mut buf = sample().encode().unwrap();
        buf[1] = b'X';
        assert!(ContainerMetadata::decode(&buf).is_err());
        assert!(ContainerMetadata::decode(&[0u8; 64]).is_err());
    }

    #[test]
    fn derived_eoa_covers_live_extents() {
        let mut meta = sample();
        assert_eq!(meta.derived_eoa(MemberId::SUPER), METADATA_REGION_SIZE);
        assert_eq!(meta.derived_eoa(member(5)), OBJECT_HEADER_SIZE);
        assert_eq!(meta.derived_eoa(member(2)), 32768);

        meta.member_eoa[2] = 0;
        assert_eq!(meta.derived_eoa(member(2)), 32768);
        meta.member_eoa[2] = 40000;
        assert_eq!(meta.derived_eoa(member(2)), 40000);
        assert_eq!(meta.derived_eoa(member(1)), 0);
    }

    #[test]
    fn directory_overflow_is_rejected() {
        let mut meta = ContainerMetadata::new(Layout::Single);
        let template = ObjectEntry {
            name: String::new(),
            header: Extent {
                member: MemberId::SUPER,
                addr: METADATA_REGION_SIZE,
                size: OBJECT_HEADER_SIZE,
            },
            data: None,
            data_size: 0,
            alloc_time: AllocTime::Late,
        };
        for i in 0..=MAX_OBJECTS {
            meta.objects.push(ObjectEntry {
                name: format!("o{i}"),
                ..template.clone()
            });
        }
        assert!(matches!(
            meta.encode(),
            Err(TailspaceError::DirectoryFull { .. })
        ));
    }

    #[test]
    fn object_member_outside_layout_is_corrupt() {
        let mut meta = ContainerMetadata::new(Layout::Single);
        meta.objects.push(ObjectEntry {
            name: "x".to_owned(),
            header: Extent {
                member: member(5),
                addr: 0,
                size: 1,
            },
            data: None,
            data_size: 0,
            alloc_time: AllocTime::Late,
        });
        let buf = meta.encode().unwrap();
        assert!(ContainerMetadata::decode(&buf).is_err());
    }
}
