//! Inspect command implementation.

use crate::OutputFormat;
use ringlog_core::format::{MasterBlock, StreamExtent};
use ringlog_core::{recover_physical_log, LogConfig, LogId, Lsn, RecoveryOutcome};
use ringlog_storage::FileDevice;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

/// Log inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Log file path.
    pub path: String,
    /// Identity of the log.
    pub log_id: LogId,
    /// Format version the file was created with.
    pub format_version: u32,
    /// File size in bytes.
    pub file_size: u64,
    /// Bytes of circular record space.
    pub lsn_space: u64,
    /// Maximum record size persisted in the master block.
    pub max_record_size: u32,
    /// False when the log holds no records.
    pub has_records: bool,
    /// Lowest LSN still in use.
    pub lowest_lsn: Lsn,
    /// LSN the next record would get.
    pub next_lsn: Lsn,
    /// Highest LSN known to be complete.
    pub highest_completed_lsn: Lsn,
    /// LSN of the newest physical checkpoint.
    pub highest_checkpoint_lsn: Lsn,
    /// Bytes of LSN space not in use.
    pub free_space: u64,
    /// Records found past the recovered head.
    pub stale_records: usize,
    /// Number of streams.
    pub stream_count: usize,
    /// Stream extents (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streams: Option<Vec<StreamExtent>>,
}

impl InspectResult {
    fn empty(path: &Path, master: &MasterBlock, lsn_space: u64) -> Self {
        Self {
            path: path.display().to_string(),
            log_id: master.log_id,
            format_version: master.format_version,
            file_size: master.file_size,
            lsn_space,
            max_record_size: master.max_record_size,
            has_records: false,
            lowest_lsn: Lsn::NULL,
            next_lsn: Lsn::ZERO,
            highest_completed_lsn: Lsn::NULL,
            highest_checkpoint_lsn: Lsn::NULL,
            free_space: lsn_space,
            stale_records: 0,
            stream_count: 0,
            streams: None,
        }
    }
}

/// Runs the inspect command.
pub async fn run(
    path: &Path,
    show_streams: bool,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No log file found at {:?}", path).into());
    }
    let device = FileDevice::open(path)?;
    let outcome = recover_physical_log(&device, &LogConfig::default()).await?;

    let result = match outcome {
        RecoveryOutcome::Empty { master, geometry } => {
            debug!(log_id = %master.log_id, "log holds no records");
            InspectResult::empty(path, &master, geometry.lsn_space())
        }
        RecoveryOutcome::Recovered(state) => {
            let mut result = InspectResult::empty(path, &state.master, state.geometry.lsn_space());
            result.has_records = true;
            result.lowest_lsn = state.lowest_lsn;
            result.next_lsn = state.next_lsn;
            result.highest_completed_lsn = state.highest_completed_lsn;
            result.highest_checkpoint_lsn = state.highest_checkpoint_lsn;
            result.free_space = state.free_space;
            result.stale_records = state.stale_records.len();
            result.stream_count = state.streams.len();
            if show_streams {
                result.streams = Some(state.streams);
            }
            result
        }
    };

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Text => print_text_output(&result),
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("ringlog File Inspection");
    println!("=======================");
    println!();
    println!("Path:    {}", result.path);
    println!("Log:     {}", result.log_id);
    println!("Format:  v{}", result.format_version);
    println!();
    println!("Space:");
    println!("  File size:   {}", format_size(result.file_size));
    println!("  LSN space:   {}", format_size(result.lsn_space));
    println!("  Free space:  {}", format_size(result.free_space));
    println!("  Max record:  {}", format_size(u64::from(result.max_record_size)));
    println!();

    if !result.has_records {
        println!("The log holds no records.");
        return;
    }

    println!("LSNs:");
    println!("  Lowest:              {}", result.lowest_lsn);
    println!("  Next:                {}", result.next_lsn);
    println!("  Highest completed:   {}", result.highest_completed_lsn);
    println!("  Last checkpoint:     {}", result.highest_checkpoint_lsn);
    if result.stale_records > 0 {
        println!(
            "  Stale records:       {} (removed on next open)",
            result.stale_records
        );
    }
    println!();
    println!("Streams: {}", result.stream_count);

    if let Some(streams) = &result.streams {
        for extent in streams {
            println!(
                "  {} type {} lsns [{}, {}] reserved {}",
                extent.stream_id,
                extent.stream_type,
                extent.lowest_lsn,
                extent.highest_lsn,
                format_size(extent.reservation)
            );
        }
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
