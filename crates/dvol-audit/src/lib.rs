#![forbid(unsafe_code)]
//! Offline audit: reconcile the block map against stored reference counts.
//!
//! The audit walks every reachable block-map page of a cleanly shut-down
//! image, accumulating its own per-slab reference counts, then compares
//! them counter-by-counter against the reference blocks on disk. It also
//! checks the logical-block total against the recovery journal and each
//! slab's summary free-block hint against the recomputed free count.
//!
//! Interior tree pages are tracked with a sentinel count: a stored value of
//! either 1 or the saturated maximum is accepted for them (the single-
//! reference convention predates saturation). A stored provisional counter
//! matches an audited zero, since a provisional reference that never
//! confirmed would have been discarded on recovery.

use dvol_block::BlockDevice;
use dvol_blockmap::BlockMap;
use dvol_error::Result;
use dvol_journal::RecoveryJournal;
use dvol_ondisk::{VolumeGeometry, approximate_free_blocks, unpack_reference_block};
use dvol_slab::{ReadOnlyNotifier, SlabSummaryZone};
use dvol_types::{
    BLOCK_SIZE, BlockCount, COUNTS_PER_BLOCK, EMPTY_REFERENCE_COUNT, Height,
    MAXIMUM_DATA_REFERENCES, MAXIMUM_REFERENCE_COUNT, MappingState, PROVISIONAL_REFERENCE_COUNT,
    PhysicalBlockNumber, SlabBlockNumber, SlabCount, ZERO_BLOCK,
};
use serde::Serialize;
use std::io::Write;
use tracing::warn;

// Reference counts are one byte, so the (stored - audited) delta spans
// [-255, 255].
const MIN_ERROR_DELTA: i32 = -255;
const MAX_ERROR_DELTA: i32 = 255;
const DELTA_BUCKETS: usize = (MAX_ERROR_DELTA - MIN_ERROR_DELTA + 1) as usize;

/// Sentinel planted in the audited counts for block-map tree pages.
const TREE_PAGE_SENTINEL: u8 = PROVISIONAL_REFERENCE_COUNT;

/// Audit options.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditOptions {
    /// Collect a line per individual inconsistency.
    pub verbose: bool,
}

/// One histogram bucket of reference-count deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeltaBucket {
    /// `stored - audited`.
    pub delta: i32,
    pub count: u32,
}

/// Per-slab audit results.
#[derive(Debug, Clone, Serialize)]
pub struct SlabReport {
    pub slab_number: SlabCount,
    pub origin: u64,
    pub bad_ref_counts: u32,
    /// Offset of the first mismatching block, if any.
    pub first_error: Option<SlabBlockNumber>,
    pub last_error: Option<SlabBlockNumber>,
    /// Non-empty delta buckets.
    pub delta_histogram: Vec<DeltaBucket>,
}

/// The full audit outcome.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub passed: bool,
    /// Whether every slab reported a clean shutdown.
    pub clean_shutdown: bool,
    pub bad_block_mappings: u64,
    pub bad_ref_counts: u64,
    pub bad_slabs: u64,
    pub bad_summary_hints: u64,
    /// Mapped leaf entries found in the block map.
    pub lbn_count: u64,
    /// Logical blocks used according to the recovery journal.
    pub saved_lbn_count: u64,
    pub slabs: Vec<SlabReport>,
    /// Per-inconsistency detail lines (verbose mode only).
    pub findings: Vec<String>,
}

struct SlabAudit {
    slab_number: SlabCount,
    origin: PhysicalBlockNumber,
    ref_counts: Vec<u8>,
    bad_ref_counts: u32,
    delta_counts: Vec<u32>,
    first_error: SlabBlockNumber,
    last_error: SlabBlockNumber,
}

impl SlabAudit {
    fn new(slab_number: SlabCount, origin: PhysicalBlockNumber, data_blocks: usize) -> Self {
        Self {
            slab_number,
            origin,
            ref_counts: vec![0_u8; data_blocks],
            bad_ref_counts: 0,
            delta_counts: vec![0_u32; DELTA_BUCKETS],
            // min-tracking starts above every valid offset
            first_error: SlabBlockNumber::MAX,
            last_error: 0,
        }
    }

    fn into_report(self) -> SlabReport {
        let delta_histogram = self
            .delta_counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(bucket, count)| DeltaBucket {
                delta: bucket as i32 + MIN_ERROR_DELTA,
                count: *count,
            })
            .collect();
        let had_errors = self.bad_ref_counts > 0;
        SlabReport {
            slab_number: self.slab_number,
            origin: self.origin.0,
            bad_ref_counts: self.bad_ref_counts,
            first_error: had_errors.then_some(self.first_error),
            last_error: had_errors.then_some(self.last_error),
            delta_histogram,
        }
    }
}

struct Auditor<'a> {
    device: &'a dyn BlockDevice,
    geometry: VolumeGeometry,
    options: AuditOptions,
    slabs: Vec<SlabAudit>,
    lbn_count: u64,
    bad_block_mappings: u64,
    bad_ref_counts: u64,
    bad_slabs: u64,
    bad_summary_hints: u64,
    findings: Vec<String>,
}

impl<'a> Auditor<'a> {
    fn new(device: &'a dyn BlockDevice, geometry: VolumeGeometry, options: AuditOptions) -> Self {
        let data_blocks = geometry.slab_config.data_blocks as usize;
        let slabs = (0..geometry.slab_count)
            .map(|slab| SlabAudit::new(slab, geometry.slab_origin_of(slab), data_blocks))
            .collect();
        Self {
            device,
            geometry,
            options,
            slabs,
            lbn_count: 0,
            bad_block_mappings: 0,
            bad_ref_counts: 0,
            bad_slabs: 0,
            bad_summary_hints: 0,
            findings: Vec::new(),
        }
    }

    fn note(&mut self, line: String) {
        warn!(target: "dvol::audit", "{line}");
        if self.options.verbose {
            self.findings.push(line);
        }
    }

    fn report_mapping(
        &mut self,
        message: &str,
        page: PhysicalBlockNumber,
        slot: u16,
        height: Height,
        pbn: PhysicalBlockNumber,
        state: MappingState,
    ) {
        self.bad_block_mappings += 1;
        self.note(format!(
            "mapping at (page {page}, slot {slot}) (height {height}) {message} (PBN {pbn}, state {state})"
        ));
    }

    fn report_ref_count(
        &mut self,
        slab_index: usize,
        sbn: SlabBlockNumber,
        tree_page: bool,
        pristine: bool,
        audited: u8,
        stored: u8,
    ) {
        self.bad_ref_counts += 1;
        let audit = &mut self.slabs[slab_index];
        if audit.bad_ref_counts == 0 {
            self.bad_slabs += 1;
        }
        audit.bad_ref_counts += 1;
        let delta = i32::from(stored) - i32::from(audited);
        audit.delta_counts[(delta - MIN_ERROR_DELTA) as usize] += 1;
        audit.first_error = audit.first_error.min(sbn);
        audit.last_error = audit.last_error.max(sbn);

        let pbn = audit.origin.0 + u64::from(sbn);
        let slab_number = audit.slab_number;
        let tree = if tree_page { " tree page" } else { "" };
        let uninit = if pristine { " (uninitialized)" } else { "" };
        self.note(format!(
            "reference mismatch for{tree} pbn {pbn}: block map had {audited} but{uninit} slab {slab_number} had {stored}"
        ));
    }

    /// The mapping examiner: validates one entry and accumulates audited
    /// counts. Errors are recorded, never propagated, so the walk covers
    /// the whole tree.
    fn examine_entry(
        &mut self,
        page: PhysicalBlockNumber,
        slot: u16,
        height: Height,
        pbn: PhysicalBlockNumber,
        state: MappingState,
    ) {
        if state.is_unmapped() {
            if pbn != ZERO_BLOCK {
                self.report_mapping(
                    "is unmapped but has a physical block",
                    page,
                    slot,
                    height,
                    pbn,
                    state,
                );
            }
            return;
        }
        if state.is_compressed() && pbn == ZERO_BLOCK {
            self.report_mapping(
                "is compressed but has no physical block",
                page,
                slot,
                height,
                pbn,
                state,
            );
            return;
        }

        if height == 0 {
            self.lbn_count += 1;
            if pbn == ZERO_BLOCK {
                return;
            }
        }

        let Ok(slab_number) = self.geometry.slab_number(pbn) else {
            self.report_mapping(
                "refers to out-of-range physical block",
                page,
                slot,
                height,
                pbn,
                state,
            );
            return;
        };
        let Ok((_, offset)) = self.geometry.slab_block_number(pbn) else {
            self.report_mapping(
                "refers to slab metadata block",
                page,
                slot,
                height,
                pbn,
                state,
            );
            return;
        };

        let slab_index = usize::from(slab_number);
        if height > 0 {
            if self.slabs[slab_index].ref_counts[offset as usize] != 0 {
                self.report_mapping(
                    "refers to previously referenced tree page",
                    page,
                    slot,
                    height,
                    pbn,
                    state,
                );
            }
            if state.is_compressed() {
                self.report_mapping(
                    "refers to compressed fragment",
                    page,
                    slot,
                    height,
                    pbn,
                    state,
                );
            }
            self.slabs[slab_index].ref_counts[offset as usize] = TREE_PAGE_SENTINEL;
        } else {
            let counter = self.slabs[slab_index].ref_counts[offset as usize];
            if counter == TREE_PAGE_SENTINEL {
                self.report_mapping(
                    "overflows reference count",
                    page,
                    slot,
                    height,
                    pbn,
                    state,
                );
            } else {
                self.slabs[slab_index].ref_counts[offset as usize] = counter + 1;
                if counter + 1 > MAXIMUM_DATA_REFERENCES {
                    self.report_mapping(
                        "overflows reference count",
                        page,
                        slot,
                        height,
                        pbn,
                        state,
                    );
                }
            }
        }
    }

    /// Compare one slab's audited counts against its stored reference
    /// blocks, returning the recomputed free-block count.
    fn verify_used_slab(&mut self, slab_index: usize) -> Result<BlockCount> {
        let slab_number = self.slabs[slab_index].slab_number;
        let raw = self.device.read_blocks(
            self.geometry.reference_block_origin(slab_number),
            self.geometry.slab_config.reference_blocks,
        )?;

        let data_blocks = self.geometry.slab_config.data_blocks as usize;
        let mut free_blocks: BlockCount = 0;
        let mut offset = 0_usize;
        for chunk in raw.chunks_exact(BLOCK_SIZE) {
            let unpacked = unpack_reference_block(chunk)?;
            let live = (data_blocks - offset).min(COUNTS_PER_BLOCK);
            for index in 0..live {
                let sbn = (offset + index) as SlabBlockNumber;
                let audited = self.slabs[slab_index].ref_counts[offset + index];
                let stored = unpacked.counters[index];

                if audited == TREE_PAGE_SENTINEL {
                    // Two valid stored values for a tree page.
                    if stored == 1 || stored == MAXIMUM_REFERENCE_COUNT {
                        continue;
                    }
                    self.report_ref_count(slab_index, sbn, true, false, audited, stored);
                    continue;
                }

                if audited != stored {
                    // A stored provisional with no audited reference is a
                    // crash leftover, not an inconsistency.
                    if audited == EMPTY_REFERENCE_COUNT && stored == PROVISIONAL_REFERENCE_COUNT
                    {
                        free_blocks += 1;
                        continue;
                    }
                    self.report_ref_count(slab_index, sbn, false, false, audited, stored);
                }
                if stored == EMPTY_REFERENCE_COUNT {
                    free_blocks += 1;
                }
            }
            offset += live;
            if offset >= data_blocks {
                break;
            }
        }
        Ok(free_blocks)
    }

    /// A pristine slab must have no audited references at all.
    fn verify_pristine_slab(&mut self, slab_index: usize) {
        let data_blocks = self.geometry.slab_config.data_blocks as usize;
        for sbn in 0..data_blocks {
            let audited = self.slabs[slab_index].ref_counts[sbn];
            if audited != 0 {
                self.report_ref_count(
                    slab_index,
                    sbn as SlabBlockNumber,
                    audited == TREE_PAGE_SENTINEL,
                    true,
                    audited,
                    0,
                );
            }
        }
    }

    fn verify_summary_hint(
        &mut self,
        summary: &SlabSummaryZone,
        slab_number: SlabCount,
        free_blocks: BlockCount,
    ) {
        let hint = approximate_free_blocks(
            summary.entry(slab_number).free_block_hint,
            summary.hint_shift(),
        );
        let hint_error: BlockCount = 1 << summary.hint_shift();
        if free_blocks < hint.max(hint_error) - hint_error || free_blocks >= hint + hint_error {
            self.bad_summary_hints += 1;
            self.note(format!(
                "slab summary reports roughly {hint} free blocks in slab {slab_number}, instead of {free_blocks} blocks"
            ));
        }
    }
}

/// Audit a volume image. Structural problems are tallied in the report;
/// only unreadable metadata aborts with an error.
pub fn audit_device(device: &dyn BlockDevice, options: AuditOptions) -> Result<AuditReport> {
    let geometry = VolumeGeometry::decode(device.read_block(PhysicalBlockNumber(0))?.as_slice())?;
    let (notifier, _sink) = ReadOnlyNotifier::new();
    let summary = SlabSummaryZone::load(
        0,
        geometry.hint_shift,
        geometry.summary.start,
        geometry.slab_count,
        device,
        notifier,
    )?;
    let journal = RecoveryJournal::load(device, geometry.nonce, geometry.recovery_journal)?;
    let block_map = BlockMap::new(geometry.nonce, geometry.block_map_roots.clone());

    let clean_shutdown = (0..geometry.slab_count).all(|slab| summary.entry(slab).is_clean);
    if !clean_shutdown {
        warn!(target: "dvol::audit", "volume was not cleanly shut down");
    }

    let mut auditor = Auditor::new(device, geometry, options);

    // Walk the block map, counting logical blocks and building the audited
    // per-slab reference counts.
    block_map.examine(device, &mut |slot, height, pbn, state| {
        auditor.examine_entry(slot.page, slot.slot, height, pbn, state);
        Ok(())
    })?;

    // Check stored counters slab by slab.
    for slab_index in 0..auditor.slabs.len() {
        let slab_number = auditor.slabs[slab_index].slab_number;
        if summary.must_load(slab_number) {
            let free_blocks = auditor.verify_used_slab(slab_index)?;
            auditor.verify_summary_hint(&summary, slab_number, free_blocks);
        } else {
            auditor.verify_pristine_slab(slab_index);
            let data_blocks = auditor.geometry.slab_config.data_blocks;
            auditor.verify_summary_hint(&summary, slab_number, data_blocks);
        }
    }

    let saved_lbn_count = journal.logical_blocks_used();
    if auditor.lbn_count == saved_lbn_count {
        warn!(
            target: "dvol::audit",
            count = saved_lbn_count,
            "logical block count matched"
        );
    } else {
        auditor.note(format!(
            "logical block count mismatch: expected {saved_lbn_count}, got {}",
            auditor.lbn_count
        ));
    }

    let passed = auditor.lbn_count == saved_lbn_count
        && auditor.bad_block_mappings == 0
        && auditor.bad_ref_counts == 0
        && auditor.bad_summary_hints == 0;

    Ok(AuditReport {
        passed,
        clean_shutdown,
        bad_block_mappings: auditor.bad_block_mappings,
        bad_ref_counts: auditor.bad_ref_counts,
        bad_slabs: auditor.bad_slabs,
        bad_summary_hints: auditor.bad_summary_hints,
        lbn_count: auditor.lbn_count,
        saved_lbn_count,
        slabs: auditor.slabs.into_iter().map(SlabAudit::into_report).collect(),
        findings: auditor.findings,
    })
}

// ── Report rendering ────────────────────────────────────────────────────────

fn plural(count: u64) -> &'static str {
    if count == 1 { "" } else { "s" }
}

fn write_error_count(out: &mut dyn Write, count: u64, name: &str) -> std::io::Result<()> {
    writeln!(out, "{count} {name}{}", plural(count))
}

/// Render the per-slab error summary and delta histogram.
fn write_slab_report(out: &mut dyn Write, slab: &SlabReport) -> std::io::Result<()> {
    if slab.bad_ref_counts == 0 {
        return Ok(());
    }

    write!(
        out,
        "slab {} at PBN {} had ",
        slab.slab_number, slab.origin
    )?;
    match (slab.first_error, slab.last_error) {
        (Some(first), Some(last)) if slab.bad_ref_counts > 1 => writeln!(
            out,
            "{} reference count errors in SBN range [{first} .. {last}]",
            slab.bad_ref_counts
        )?,
        (_, Some(last)) => writeln!(out, "1 reference count error in SBN {last}")?,
        _ => writeln!(out)?,
    }

    // 50 histogram dots, so each dot is 2% of the slab's errors; fractions
    // round up to a whole dot.
    const HISTOGRAM_BAR: &str = "**************************************************";
    let scale = HISTOGRAM_BAR.len() as u64;
    writeln!(out, "  error     delta   histogram")?;
    writeln!(out, "  delta     count   ({}% of errors in slab per dot)", 100 / scale)?;
    for bucket in &slab.delta_histogram {
        let width = (scale * u64::from(bucket.count)).div_ceil(u64::from(slab.bad_ref_counts));
        writeln!(
            out,
            "  {:5}  {:8}   {}",
            bucket.delta,
            bucket.count,
            &HISTOGRAM_BAR[..width as usize]
        )?;
    }
    writeln!(out)
}

/// Render the default (summary) report.
pub fn write_report(
    out: &mut dyn Write,
    label: &str,
    report: &AuditReport,
) -> std::io::Result<()> {
    if report.passed {
        writeln!(out, "all pbn references matched for volume '{label}'")?;
        return Ok(());
    }

    writeln!(out, "audit summary for volume '{label}':")?;
    write_error_count(out, report.bad_block_mappings, "block mapping error")?;
    write_error_count(out, report.bad_summary_hints, "free space hint error")?;
    write_error_count(out, report.bad_ref_counts, "reference count error")?;
    write_error_count(out, report.bad_slabs, "error-containing slab")?;
    if report.lbn_count != report.saved_lbn_count {
        writeln!(
            out,
            "logical block count mismatch: expected {}, got {}",
            report.saved_lbn_count, report.lbn_count
        )?;
    }
    for slab in &report.slabs {
        write_slab_report(out, slab)?;
    }
    for finding in &report.findings {
        writeln!(out, "{finding}")?;
    }
    Ok(())
}
