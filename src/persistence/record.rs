//! Fixed-size recovery records.
//!
//! Every mutation of a spool file is followed by one 20-byte record:
//!
//! ```text
//! 0            8            16        20
//! +------------+------------+---------+
//! |   count    |   rindex   |  crc32  |
//! +------------+------------+---------+
//! ```
//!
//! Fields are little endian. The checksum covers `count`, `rindex` and the
//! spool length at the time the record was written; the length itself is not
//! stored, so a record only validates against the spool it describes.

/// Size of one encoded record.
pub const RECORD_SIZE: usize = 20;

/// One decoded recovery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalRecord {
    /// Messages not yet committed as read.
    pub count: u64,
    /// Committed read offset into the spool.
    pub rindex: u64,
    checksum: u32,
}

impl JournalRecord {
    /// Creates a record describing a spool of `spool_size` bytes.
    #[must_use]
    pub fn new(count: u64, rindex: u64, spool_size: u64) -> Self {
        Self {
            count,
            rindex,
            checksum: checksum(count, rindex, spool_size),
        }
    }

    /// Encodes the record.
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        let (count, rest) = buf.split_at_mut(8);
        let (rindex, checksum) = rest.split_at_mut(8);
        count.copy_from_slice(&self.count.to_le_bytes());
        rindex.copy_from_slice(&self.rindex.to_le_bytes());
        checksum.copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Decodes a record, returning `None` if `buf` is not exactly
    /// [`RECORD_SIZE`] bytes long. The checksum is not verified here.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != RECORD_SIZE {
            return None;
        }
        Some(Self {
            count: u64::from_le_bytes(buf.get(0..8)?.try_into().ok()?),
            rindex: u64::from_le_bytes(buf.get(8..16)?.try_into().ok()?),
            checksum: u32::from_le_bytes(buf.get(16..20)?.try_into().ok()?),
        })
    }

    /// Whether this record consistently describes a spool of `spool_size`
    /// bytes.
    #[must_use]
    pub fn is_valid_for(&self, spool_size: u64) -> bool {
        self.rindex <= spool_size && self.checksum == checksum(self.count, self.rindex, spool_size)
    }
}

fn checksum(count: u64, rindex: u64, spool_size: u64) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&count.to_le_bytes());
    hasher.update(&rindex.to_le_bytes());
    hasher.update(&spool_size.to_le_bytes());
    hasher.finalize()
}
