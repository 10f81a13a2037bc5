//! Crash and fault-injection tests.
//!
//! Each test runs a log on a [`CrashableDevice`], injects a fault, and
//! reopens the log on the inner device.

use ringlog_core::format::LogGeometry;
use ringlog_core::{
    recover_physical_log, Asn, Disposition, LogError, ReadType, RecoveryOutcome,
};
use ringlog_storage::{BlockDevice, InMemoryDevice, BLOCK_SIZE};
use ringlog_testkit::scenarios::{payload_for, populated_stream};
use ringlog_testkit::{CrashableDevice, TestLog, TEST_FILE_SIZE};
use std::sync::Arc;
use std::time::Duration;

async fn crashable_log() -> (TestLog, Arc<CrashableDevice>) {
    let inner = Arc::new(InMemoryDevice::new());
    let device = Arc::new(CrashableDevice::new(inner.clone()));
    let test_log = TestLog::on_device(inner, device.clone()).await;
    (test_log, device)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition never held");
}

#[tokio::test]
async fn torn_header_is_discarded() {
    let (test_log, device) = crashable_log().await;
    let stream = populated_stream(&test_log, 3, 100).await;
    let id = stream.id();

    // 5000 bytes of metadata give a two-block header; only the first lands.
    device.crash_after(BLOCK_SIZE as u64);
    let result = stream
        .write(Asn::new(4), 1, &vec![0xAB; 5000], b"torn")
        .await;
    assert!(result.is_err());
    assert!(device.has_crashed());
    assert!(matches!(
        stream.write(Asn::new(5), 1, b"", b"refused").await,
        Err(LogError::Faulted { .. })
    ));
    drop(stream);

    let test_log = test_log.crash_and_reopen().await.unwrap();
    let stream = test_log.open_stream(id).await.unwrap();
    let range = stream.query_asn_range();
    assert_eq!(range.lowest, Asn::new(1));
    assert_eq!(range.highest, Asn::new(3));
    assert!(matches!(
        stream.read(Asn::new(4), ReadType::Exact).await,
        Err(LogError::NotFound)
    ));

    stream.write(Asn::new(4), 1, b"", b"retry").await.unwrap();
    let record = stream.read(Asn::new(4), ReadType::Exact).await.unwrap();
    assert_eq!(record.payload, b"retry");
}

#[tokio::test]
async fn failed_flush_faults_the_log() {
    let (test_log, device) = crashable_log().await;
    let stream = populated_stream(&test_log, 3, 100).await;
    let id = stream.id();

    device.set_fail_on_flush(true);
    assert!(stream.write(Asn::new(4), 1, b"", b"unflushed").await.is_err());
    assert!(matches!(
        test_log.checkpoint().await,
        Err(LogError::Faulted { .. })
    ));
    drop(stream);

    let test_log = test_log.crash_and_reopen().await.unwrap();
    let stream = test_log.open_stream(id).await.unwrap();
    for asn in 1..=3u64 {
        let record = stream.read(Asn::new(asn), ReadType::Exact).await.unwrap();
        assert_eq!(record.payload, payload_for(asn, 100));
    }
}

#[tokio::test]
async fn acknowledgement_waits_for_lower_records() {
    let (test_log, device) = crashable_log().await;
    let geometry = LogGeometry::new(TEST_FILE_SIZE).unwrap();
    let stream = Arc::new(populated_stream(&test_log, 3, 100).await);

    let slow_lsn = test_log.query_space_info().next_lsn;
    let slow_offset = geometry.physical_offset(slow_lsn);
    device.delay_write_at(slow_offset, Duration::from_millis(150));

    let slow = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.write(Asn::new(4), 1, b"", b"slow").await })
    };
    wait_until(|| test_log.query_space_info().next_lsn > slow_lsn).await;
    let fast = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.write(Asn::new(5), 1, b"", b"fast").await })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!fast.is_finished());

    let fast_lsn = fast.await.unwrap().unwrap();
    assert!(fast_lsn > slow_lsn);
    let landed = test_log.device.read_at(slow_offset, BLOCK_SIZE).await.unwrap();
    assert!(landed.iter().any(|&b| b != 0));
    assert!(test_log.query_space_info().highest_completed_lsn >= fast_lsn);

    let slow_lsn_written = slow.await.unwrap().unwrap();
    assert_eq!(slow_lsn_written, slow_lsn);
    let record = stream.read(Asn::new(4), ReadType::Exact).await.unwrap();
    assert_eq!(record.payload, b"slow");
}

#[tokio::test]
async fn abandoned_write_still_becomes_persisted() {
    let (test_log, device) = crashable_log().await;
    let geometry = LogGeometry::new(TEST_FILE_SIZE).unwrap();
    let stream = populated_stream(&test_log, 3, 100).await;

    let slow_lsn = test_log.query_space_info().next_lsn;
    device.delay_write_at(geometry.physical_offset(slow_lsn), Duration::from_millis(100));
    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        stream.write(Asn::new(4), 1, b"", b"abandoned"),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(
        stream.query_record(Asn::new(4)).unwrap().disposition,
        Disposition::Pending
    );

    wait_until(|| {
        stream
            .query_record(Asn::new(4))
            .is_ok_and(|info| info.disposition == Disposition::Persisted)
    })
    .await;
    assert!(test_log.query_space_info().highest_completed_lsn >= slow_lsn);
    let record = stream.read(Asn::new(4), ReadType::Exact).await.unwrap();
    assert_eq!(record.payload, b"abandoned");

    stream.truncate(Asn::new(4)).await.unwrap();
    assert_eq!(stream.query_asn_range().truncation_point, Asn::new(4));
}

#[tokio::test]
async fn stalled_write_leaves_stale_record_that_is_scrubbed() {
    let (test_log, device) = crashable_log().await;
    let geometry = LogGeometry::new(TEST_FILE_SIZE).unwrap();
    let stream = Arc::new(populated_stream(&test_log, 3, 100).await);
    let id = stream.id();

    let lost_lsn = test_log.query_space_info().next_lsn;
    device.stall_write_at(geometry.physical_offset(lost_lsn));
    let lost = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.write(Asn::new(4), 1, b"", b"lost").await })
    };
    wait_until(|| test_log.query_space_info().next_lsn > lost_lsn).await;

    // This record reaches the disk but is never acknowledged.
    let before = device.bytes_written();
    let stale = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.write(Asn::new(5), 1, b"", b"stale").await })
    };
    wait_until(|| device.bytes_written() > before).await;

    lost.abort();
    stale.abort();
    let _ = lost.await;
    let _ = stale.await;
    drop(stream);

    let test_log = test_log.crash_and_reopen().await.unwrap();
    let RecoveryOutcome::Recovered(state) =
        recover_physical_log(test_log.device.as_ref(), &test_log.config)
            .await
            .unwrap()
    else {
        panic!("log unexpectedly empty");
    };
    assert!(state.stale_records.is_empty());
    assert_eq!(state.next_lsn, lost_lsn);

    let stream = test_log.open_stream(id).await.unwrap();
    assert_eq!(stream.query_asn_range().highest, Asn::new(3));
    assert!(stream.read(Asn::new(5), ReadType::Exact).await.is_err());

    stream.write(Asn::new(4), 1, b"", b"again").await.unwrap();
    stream.write(Asn::new(5), 1, b"", b"again").await.unwrap();
    drop(stream);

    let test_log = test_log.crash_and_reopen().await.unwrap();
    let stream = test_log.open_stream(id).await.unwrap();
    assert_eq!(stream.query_asn_range().highest, Asn::new(5));
    let record = stream.read(Asn::new(5), ReadType::Exact).await.unwrap();
    assert_eq!(record.payload, b"again");
}

#[tokio::test]
async fn crash_after_each_write_keeps_a_prefix() {
    for budget_blocks in [1u64, 3, 7, 12] {
        let (test_log, device) = crashable_log().await;
        let stream = populated_stream(&test_log, 2, 100).await;
        let id = stream.id();

        device.crash_after(budget_blocks * BLOCK_SIZE as u64);
        let mut acknowledged = 2u64;
        for asn in 3..=20u64 {
            match stream
                .write(Asn::new(asn), 1, b"", &payload_for(asn, 3000))
                .await
            {
                Ok(_) => acknowledged = asn,
                Err(_) => break,
            }
        }
        drop(stream);

        let test_log = test_log.crash_and_reopen().await.unwrap();
        let stream = test_log.open_stream(id).await.unwrap();
        let highest = stream.query_asn_range().highest.as_u64();
        assert!(highest >= acknowledged, "lost acknowledged record {acknowledged}");
        for asn in 3..=acknowledged {
            let record = stream.read(Asn::new(asn), ReadType::Exact).await.unwrap();
            assert_eq!(record.payload, payload_for(asn, 3000));
        }
    }
}
