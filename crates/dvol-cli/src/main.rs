#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dvol_audit::{AuditOptions, audit_device, write_report};
use dvol_block::{ByteBlockDevice, FileByteDevice};
use dvol_core::{Volume, VolumeConfig, compute_geometry};
use dvol_ondisk::VolumeGeometry;
use dvol_types::PhysicalBlockNumber;
use std::path::{Path, PathBuf};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "dvol", version, about = "dvol — deduplicating block storage tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Confirm the reference counts of a volume image.
    ///
    /// Adds up the logical block references to all physical blocks found in
    /// the image, compares the total to the stored logical block count,
    /// confirms every stored reference count, and validates the slab
    /// summary free-block approximations. The default output is a summary
    /// of error categories and per-slab histograms. Exits 0 only on a
    /// fully consistent volume.
    Audit {
        /// Path to the volume image.
        image: PathBuf,
        /// Report a line for each individual inconsistency in addition to
        /// the summary.
        #[arg(long)]
        verbose: bool,
        /// Output the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the volume geometry.
    Inspect {
        /// Path to the volume image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Create and format a new volume image.
    Format {
        /// Path for the new image (truncated if it exists).
        image: PathBuf,
        /// Number of slabs.
        #[arg(long, default_value_t = 4)]
        slabs: u16,
        /// Slab size as a power of two (blocks).
        #[arg(long, default_value_t = 11)]
        slab_shift: u8,
        /// Provisioned logical address space, in blocks.
        #[arg(long, default_value_t = 1 << 20)]
        logical_blocks: u64,
        /// Volume nonce; derived from the clock when omitted.
        #[arg(long)]
        nonce: Option<u64>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("error: {error:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Audit {
            image,
            verbose,
            json,
        } => audit(&image, verbose, json),
        Command::Inspect { image, json } => inspect(&image, json),
        Command::Format {
            image,
            slabs,
            slab_shift,
            logical_blocks,
            nonce,
        } => format_volume(&image, slabs, slab_shift, logical_blocks, nonce),
    }
}

fn open_device(image: &Path) -> Result<ByteBlockDevice<FileByteDevice>> {
    let device = FileByteDevice::open_read_only(image)
        .with_context(|| format!("failed to open {}", image.display()))?;
    Ok(ByteBlockDevice::new(device))
}

fn audit(image: &Path, verbose: bool, json: bool) -> Result<i32> {
    let device = open_device(image)?;
    let report = audit_device(&device, AuditOptions { verbose })
        .with_context(|| format!("failed to audit {}", image.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        let label = image.display().to_string();
        write_report(&mut std::io::stdout().lock(), &label, &report)
            .context("write report")?;
    }
    Ok(if report.passed { 0 } else { 1 })
}

fn format_volume(
    image: &Path,
    slabs: u16,
    slab_shift: u8,
    logical_blocks: u64,
    nonce: Option<u64>,
) -> Result<i32> {
    let nonce = nonce.unwrap_or_else(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or(1)
    });
    let mut config = VolumeConfig::new(nonce, slabs, slab_shift);
    config.logical_blocks = logical_blocks;
    let geometry = compute_geometry(&config)?;

    let bytes = (geometry.physical_end().0) * dvol_types::BLOCK_SIZE as u64;
    let device = FileByteDevice::create(image, bytes)
        .with_context(|| format!("failed to create {}", image.display()))?;
    let mut volume = Volume::format(ByteBlockDevice::new(device), &config)?;
    volume.save_all()?;

    println!(
        "formatted '{}': {} slabs of {} blocks ({} data each), logical space {} blocks",
        image.display(),
        slabs,
        geometry.slab_blocks(),
        geometry.slab_config.data_blocks,
        logical_blocks
    );
    Ok(0)
}

fn inspect(image: &Path, json: bool) -> Result<i32> {
    let device = open_device(image)?;
    let geometry = VolumeGeometry::decode(
        dvol_block::BlockDevice::read_block(&device, PhysicalBlockNumber(0))?.as_slice(),
    )
    .with_context(|| format!("no dvol geometry in {}", image.display()))?;

    if json {
        let value = serde_json::json!({
            "nonce": geometry.nonce,
            "logical_blocks": geometry.logical_blocks,
            "logical_zone_count": geometry.logical_zone_count,
            "physical_zone_count": geometry.physical_zone_count,
            "slab_count": geometry.slab_count,
            "slab_blocks": geometry.slab_blocks(),
            "slab_data_blocks": geometry.slab_config.data_blocks,
            "slab_reference_blocks": geometry.slab_config.reference_blocks,
            "slab_journal_blocks": geometry.slab_config.journal_blocks,
            "slab_origin": geometry.slab_origin.0,
            "hint_shift": geometry.hint_shift,
        });
        println!("{}", serde_json::to_string_pretty(&value).context("serialize geometry")?);
    } else {
        println!("dvol volume geometry");
        println!("nonce: {:#x}", geometry.nonce);
        println!("logical_blocks: {}", geometry.logical_blocks);
        println!("logical_zones: {}", geometry.logical_zone_count);
        println!("slab_count: {}", geometry.slab_count);
        println!(
            "slab_blocks: {} ({} data, {} reference, {} journal)",
            geometry.slab_blocks(),
            geometry.slab_config.data_blocks,
            geometry.slab_config.reference_blocks,
            geometry.slab_config.journal_blocks
        );
        println!("slab_origin: {}", geometry.slab_origin);
        println!("hint_shift: {}", geometry.hint_shift);
    }
    Ok(0)
}
