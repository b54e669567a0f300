use keystone_shm::{SegmentConfig, SegmentWriter, ShmError};
use keystone_state::SlotIndex;

pub fn temp_shm_path(label: &str) -> String {
    let pid = std::process::id();
    format!("/tmp/keystone_bench_{label}_{pid}")
}

/// A typical T=1 contact card answer-to-reset.
pub const SAMPLE_ATR: [u8; 20] = [
    0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03, 0x06, 0x03, 0x00, 0x01,
    0x00, 0x00, 0x00, 0x00, 0x6A,
];

/// A segment at `path` with `readers` attached readers, flushing only on
/// attach/detach unless `sync_on_publish` is set.
pub fn segment_with_readers(
    path: &str,
    readers: usize,
    sync_on_publish: bool,
) -> Result<(SegmentWriter, Vec<SlotIndex>), ShmError> {
    let cfg = SegmentConfig::new(readers.max(1)).sync_on_publish(sync_on_publish);
    let writer = SegmentWriter::create(path, cfg)?;
    let slots = (0..readers)
        .map(|i| writer.allocate_slot(&format!("Bench Reader {i:02} 00")))
        .collect::<Result<_, _>>()?;
    Ok((writer, slots))
}
