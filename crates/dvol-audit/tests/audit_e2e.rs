//! End-to-end audit scenarios: format a volume, drive mappings through the
//! engine, shut down cleanly, then audit the image — with and without
//! injected corruption.

use dvol_audit::{AuditOptions, audit_device, write_report};
use dvol_block::{BlockDevice, ByteBlockDevice, MemByteDevice};
use dvol_core::{Volume, VolumeConfig, compute_geometry};
use dvol_types::{
    BLOCK_SIZE, LogicalBlockNumber, MappingState, PACKED_JOURNAL_POINT_SIZE, SECTOR_SIZE,
};

type TestVolume = Volume<ByteBlockDevice<MemByteDevice>>;

fn build_volume(nonce: u64) -> TestVolume {
    let config = VolumeConfig::new(nonce, 2, 11);
    let geometry = compute_geometry(&config).unwrap();
    let device = ByteBlockDevice::new(MemByteDevice::new(
        geometry.physical_end().0 * BLOCK_SIZE as u64,
    ));
    Volume::format(device, &config).unwrap()
}

/// Byte offset of the stored counter for slab-block `sbn` of `slab`.
fn stored_counter_offset(volume: &TestVolume, slab: u16, sbn: usize) -> usize {
    let block = volume.geometry().reference_block_origin(slab).0 as usize;
    let sector = sbn / (SECTOR_SIZE - PACKED_JOURNAL_POINT_SIZE);
    let within = sbn % (SECTOR_SIZE - PACKED_JOURNAL_POINT_SIZE);
    block * BLOCK_SIZE + sector * SECTOR_SIZE + PACKED_JOURNAL_POINT_SIZE + within
}

#[test]
fn clean_volume_passes_audit() {
    let mut volume = build_volume(0xA11CE);

    // A handful of distinct mappings, one shared (deduplicated) block, and
    // one mapping that is later removed.
    let mut pbns = Vec::new();
    for lbn in 0..8_u64 {
        let pbn = volume.allocate_block().unwrap();
        volume
            .map_logical_block(LogicalBlockNumber(lbn), pbn, MappingState::Mapped)
            .unwrap();
        pbns.push(pbn);
    }
    volume
        .map_logical_block(LogicalBlockNumber(100), pbns[0], MappingState::Mapped)
        .unwrap();
    volume.unmap_logical_block(LogicalBlockNumber(7)).unwrap();
    volume.save_all().unwrap();

    let report = audit_device(volume.device(), AuditOptions::default()).unwrap();
    assert!(report.passed, "clean volume must audit clean: {report:?}");
    assert!(report.clean_shutdown);
    assert_eq!(report.lbn_count, 8); // 8 mapped + 1 dedup - 1 unmapped
    assert_eq!(report.lbn_count, report.saved_lbn_count);
    assert_eq!(report.bad_ref_counts, 0);
    assert_eq!(report.bad_block_mappings, 0);
    assert_eq!(report.bad_summary_hints, 0);
    for slab in &report.slabs {
        assert!(slab.delta_histogram.is_empty());
        assert_eq!(slab.first_error, None);
    }
}

#[test]
fn single_mapping_with_pristine_slab() {
    // One leaf mapping; slab 1 never touched. The audit must verify slab 1
    // as pristine (no stored counts to read) with an empty histogram.
    let mut volume = build_volume(0xB0B);
    let pbn = volume.allocate_block().unwrap();
    volume
        .map_logical_block(LogicalBlockNumber(0), pbn, MappingState::Mapped)
        .unwrap();
    volume.save_all().unwrap();

    assert!(volume.summary().must_load(0));
    assert!(!volume.summary().must_load(1));

    let report = audit_device(volume.device(), AuditOptions::default()).unwrap();
    assert!(report.passed);
    assert_eq!(report.lbn_count, 1);
    assert_eq!(report.slabs[1].bad_ref_counts, 0);
    assert!(report.slabs[1].delta_histogram.is_empty());
}

#[test]
fn corrupted_stored_counter_is_reported_with_delta() {
    let mut volume = build_volume(0xC0DE);
    let pbn = volume.allocate_block().unwrap();
    volume
        .map_logical_block(LogicalBlockNumber(3), pbn, MappingState::Mapped)
        .unwrap();
    volume.save_all().unwrap();

    // Inflate the stored counter for the mapped block: stored 3, audited 1.
    let sbn = (pbn.0 - volume.geometry().slab_origin_of(0).0) as usize;
    let offset = stored_counter_offset(&volume, 0, sbn);
    volume.device().inner().patch(offset, &[3]);

    let report = audit_device(volume.device(), AuditOptions { verbose: true }).unwrap();
    assert!(!report.passed);
    assert_eq!(report.bad_ref_counts, 1);
    assert_eq!(report.bad_slabs, 1);
    assert_eq!(report.slabs[0].bad_ref_counts, 1);
    assert_eq!(report.slabs[0].first_error, Some(sbn as u32));
    assert_eq!(report.slabs[0].last_error, Some(sbn as u32));
    assert_eq!(report.slabs[0].delta_histogram.len(), 1);
    assert_eq!(report.slabs[0].delta_histogram[0].delta, 2);
    assert_eq!(report.slabs[0].delta_histogram[0].count, 1);
    assert!(
        report
            .findings
            .iter()
            .any(|line| line.contains("reference mismatch")),
        "verbose mode must carry per-mismatch lines"
    );

    // The summary rendering includes the failing slab and its histogram.
    let mut out = Vec::new();
    write_report(&mut out, "test.img", &report).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("1 reference count error\n"));
    assert!(text.contains("1 error-containing slab\n"));
    assert!(text.contains("slab 0 at PBN"));
}

#[test]
fn compressed_interior_entry_is_one_mapping_error() {
    let mut volume = build_volume(0x5E5E);
    let pbn = volume.allocate_block().unwrap();
    volume
        .map_logical_block(LogicalBlockNumber(0), pbn, MappingState::Mapped)
        .unwrap();
    volume.save_all().unwrap();

    // Mark the root's only interior entry as compressed: the walker must
    // report it exactly once and carry on without descending.
    let root = volume.geometry().block_map_roots[0].0 as usize;
    let entry_offset = root * BLOCK_SIZE + 32;
    let raw = volume.device().inner().contents();
    let patched = (raw[entry_offset] & 0xF0) | 0x2;
    volume.device().inner().patch(entry_offset, &[patched]);

    let report = audit_device(volume.device(), AuditOptions::default()).unwrap();
    assert!(!report.passed);
    assert_eq!(report.bad_block_mappings, 1);
    // The now-unreachable leaf drops the logical count below the journal's.
    assert_eq!(report.lbn_count, 0);
    assert_eq!(report.saved_lbn_count, 1);
}

#[test]
fn stale_summary_hint_is_reported() {
    let mut volume = build_volume(0x41D);
    let pbn = volume.allocate_block().unwrap();
    volume
        .map_logical_block(LogicalBlockNumber(0), pbn, MappingState::Mapped)
        .unwrap();
    volume.save_all().unwrap();

    // Zero slab 0's free hint, keeping the clean bit.
    let summary_start = volume.geometry().summary.start.0 as usize;
    volume
        .device()
        .inner()
        .patch(summary_start * BLOCK_SIZE + 1, &[0x01]);

    let report = audit_device(volume.device(), AuditOptions::default()).unwrap();
    assert!(!report.passed);
    assert_eq!(report.bad_summary_hints, 1);
    assert_eq!(report.bad_ref_counts, 0);
}

#[test]
fn logical_count_mismatch_fails_audit() {
    let mut volume = build_volume(0x10CA1);
    let pbn = volume.allocate_block().unwrap();
    volume
        .map_logical_block(LogicalBlockNumber(0), pbn, MappingState::Mapped)
        .unwrap();
    volume.save_all().unwrap();

    // Rewrite the saved recovery header claiming two logical blocks used.
    let region = volume.geometry().recovery_journal;
    let nonce = volume.geometry().nonce;
    let mut header_block = vec![0_u8; BLOCK_SIZE];
    let tail = volume.recovery_journal().tail_sequence();
    dvol_ondisk::RecoveryBlockHeader {
        sequence_number: tail,
        nonce,
        entry_count: 0,
        logical_blocks_used: 2,
        block_map_data_blocks: 4,
    }
    .encode_into(&mut header_block)
    .unwrap();
    let slot = region.start.0 + tail % region.blocks;
    volume
        .device()
        .write_block(dvol_types::PhysicalBlockNumber(slot), &header_block)
        .unwrap();

    let report = audit_device(volume.device(), AuditOptions::default()).unwrap();
    assert!(!report.passed);
    assert_eq!(report.lbn_count, 1);
    assert_eq!(report.saved_lbn_count, 2);
    assert_eq!(report.bad_ref_counts, 0);
}

#[test]
fn unclean_shutdown_is_flagged_but_audited() {
    let mut volume = build_volume(0xD1271);
    let pbn = volume.allocate_block().unwrap();
    volume
        .map_logical_block(LogicalBlockNumber(0), pbn, MappingState::Mapped)
        .unwrap();
    volume.save_all().unwrap();

    // Clear slab 0's clean bit, preserving the hint bits.
    let summary_start = volume.geometry().summary.start.0 as usize;
    let raw = volume.device().inner().contents();
    let byte = raw[summary_start * BLOCK_SIZE + 1] & !0x01;
    volume.device().inner().patch(summary_start * BLOCK_SIZE + 1, &[byte]);

    let report = audit_device(volume.device(), AuditOptions::default()).unwrap();
    assert!(!report.clean_shutdown);
    // The shutdown warning alone does not fail the audit.
    assert!(report.passed);
}
