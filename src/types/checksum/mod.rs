#![forbid(unsafe_code)]
//! Journal record checksums.

/// Running CRC32 (IEEE) of one journal record, seeded with the id of the
/// transaction that wrote it.
#[derive(Clone)]
pub struct RecordChecksum {
    hasher: crc32fast::Hasher,
}

impl RecordChecksum {
    /// Starts a checksum for a record of transaction `tx_id`.
    pub fn new(tx_id: u64) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&tx_id.to_le_bytes());
        Self { hasher }
    }

    /// Feeds one covered region of the record.
    pub fn update(&mut self, region: &[u8]) {
        self.hasher.update(region);
    }

    /// Value of the checksum over everything fed so far.
    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

/// Checksum of a record whose covered regions are `parts`. A stale record
/// left in a recycled file never validates under a newer transaction id.
pub fn record_crc32(tx_id: u64, parts: &[&[u8]]) -> u32 {
    let mut checksum = RecordChecksum::new(tx_id);
    parts.iter().for_each(|part| checksum.update(part));
    checksum.value()
}
