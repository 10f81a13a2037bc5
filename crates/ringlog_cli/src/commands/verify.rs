//! Verify command implementation.

use ringlog_core::format::StreamExtent;
use ringlog_core::{
    recover_physical_log, AsnIndex, LogConfig, LsnExtentTracker, RecoveredLogState,
    RecoveryOutcome, StreamRecovery, StreamRecoveryReport,
};
use ringlog_storage::{BlockDevice, FileDevice};
use std::path::Path;
use tracing::{info, warn};

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of streams checked.
    pub streams_checked: usize,
    /// Number of streams that recovered cleanly.
    pub valid_streams: usize,
    /// Number of records indexed across all streams.
    pub records_indexed: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub async fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying log at {:?}", path);
    println!();

    let device = FileDevice::open(path)?;
    let state = match recover_physical_log(&device, &LogConfig::default()).await {
        Ok(RecoveryOutcome::Recovered(state)) => state,
        Ok(RecoveryOutcome::Empty { .. }) => {
            println!("The log holds no records.");
            println!();
            println!("✓ Log verification passed");
            return Ok(());
        }
        Err(e) => {
            println!("  Physical recovery failed: {e}");
            println!();
            println!("✗ Log verification failed");
            return Err("Verification failed".into());
        }
    };
    println!(
        "Physical log: {} streams, head at {}",
        state.streams.len(),
        state.next_lsn
    );
    if !state.stale_records.is_empty() {
        println!(
            "  {} stale record(s) past the head would be scrubbed on open",
            state.stale_records.len()
        );
    }

    let result = verify_streams(&device, &state).await;
    print_result(&result);

    println!();
    if result.is_ok() {
        println!("✓ Log verification passed");
        Ok(())
    } else {
        println!("✗ Log verification failed");
        Err("Verification failed".into())
    }
}

async fn verify_streams(device: &dyn BlockDevice, state: &RecoveredLogState) -> VerifyResult {
    let config = state.master.apply_to(LogConfig::default());
    let recovery = StreamRecovery {
        device,
        master: &state.master,
        geometry: &state.geometry,
        config: &config,
        log_lowest_lsn: state.lowest_lsn,
        verifier: None,
    };

    let mut result = VerifyResult::default();
    for extent in &state.streams {
        result.streams_checked += 1;
        match verify_stream(&recovery, extent).await {
            Ok((report, records)) => {
                info!(
                    stream = %extent.stream_id,
                    records,
                    segments = report.checkpoint_segments,
                    replayed = report.replayed_records,
                    "stream verified"
                );
                result.valid_streams += 1;
                result.records_indexed += records;
                println!(
                    "  {}: {} records, truncation point {}, highest {}",
                    extent.stream_id, records, report.truncation_point, report.highest_asn
                );
            }
            Err(e) => {
                warn!(stream = %extent.stream_id, error = %e, "stream failed verification");
                result.errors.push(format!("{}: {}", extent.stream_id, e));
            }
        }
    }
    result
}

async fn verify_stream(
    recovery: &StreamRecovery<'_>,
    extent: &StreamExtent,
) -> ringlog_core::LogResult<(StreamRecoveryReport, usize)> {
    let index = AsnIndex::new();
    let tracker = LsnExtentTracker::new();
    let report = recovery.recover(extent, &index, &tracker).await?;
    if !index.validate() {
        return Err(ringlog_core::LogError::structural(
            "index bounds inconsistent after recovery",
        ));
    }
    Ok((report, index.len()))
}

fn print_result(result: &VerifyResult) {
    println!(
        "  Streams checked: {}, valid: {}, records indexed: {}",
        result.streams_checked, result.valid_streams, result.records_indexed
    );
    for error in &result.errors {
        println!("    ERROR: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringlog_core::{Asn, LogId, PhysicalLog, StreamId, StreamType};

    #[tokio::test]
    async fn clean_log_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        let log = PhysicalLog::create_file(
            &path,
            LogId::random(),
            16 * 1024 * 1024,
            LogConfig::default(),
        )
        .await
        .unwrap();
        let stream = log
            .create_stream(StreamId::random(), StreamType::random())
            .await
            .unwrap();
        for asn in 1..=10u64 {
            stream.write(Asn::new(asn), 1, b"", b"payload").await.unwrap();
        }
        stream.truncate(Asn::new(4)).await.unwrap();
        stream.close();
        log.close().await.unwrap();
        drop(log);

        let device = FileDevice::open(&path).unwrap();
        let RecoveryOutcome::Recovered(state) =
            recover_physical_log(&device, &LogConfig::default()).await.unwrap()
        else {
            panic!("log unexpectedly empty");
        };
        let result = verify_streams(&device, &state).await;
        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(result.streams_checked, 1);
        assert_eq!(result.records_indexed, 6);
    }
}
