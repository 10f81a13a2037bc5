//! Recovery integration tests.

use ringlog_core::format::LogGeometry;
use ringlog_core::{
    recover_physical_log, Asn, AsnIndex, LsnExtentTracker, ReadType, RecoveryOutcome,
    StreamRecovery,
};
use ringlog_storage::BLOCK_SIZE;
use ringlog_testkit::scenarios::{payload_for, populated_stream};
use ringlog_testkit::{small_config, TestLog};

async fn recovered_state(test_log: &TestLog) -> ringlog_core::RecoveredLogState {
    match recover_physical_log(test_log.device.as_ref(), &test_log.config)
        .await
        .unwrap()
    {
        RecoveryOutcome::Recovered(state) => state,
        RecoveryOutcome::Empty { .. } => panic!("log unexpectedly empty"),
    }
}

#[tokio::test]
async fn recovery_is_idempotent() {
    let test_log = TestLog::new().await;
    let a = populated_stream(&test_log, 20, 300).await;
    let b = populated_stream(&test_log, 7, 5000).await;
    let (a_id, b_id) = (a.id(), b.id());
    drop((a, b));

    let test_log = test_log.crash_and_reopen().await.unwrap();
    let first = recovered_state(&test_log).await;
    let second = recovered_state(&test_log).await;
    assert_eq!(first, second);
    assert!(first.stale_records.is_empty());

    let space = test_log.query_space_info();
    let a = test_log.open_stream(a_id).await.unwrap();
    let a_range = a.query_asn_range();
    drop(a);

    let test_log = test_log.crash_and_reopen().await.unwrap();
    assert_eq!(test_log.query_space_info(), space);
    let a = test_log.open_stream(a_id).await.unwrap();
    assert_eq!(a.query_asn_range(), a_range);
    let b = test_log.open_stream(b_id).await.unwrap();
    assert_eq!(b.query_asn_range().highest, Asn::new(7));
}

#[tokio::test]
async fn multi_segment_checkpoint_recovers() {
    let test_log = TestLog::new().await;
    let stream = populated_stream(&test_log, 300, 64).await;
    let id = stream.id();
    let checkpoint_lsn = stream.checkpoint().await.unwrap();
    drop(stream);

    let test_log = test_log.crash_and_reopen().await.unwrap();
    let state = recovered_state(&test_log).await;
    let extent = state
        .streams
        .iter()
        .find(|extent| extent.stream_id == id)
        .copied()
        .unwrap();
    let config = state.master.apply_to(test_log.config.clone());
    let recovery = StreamRecovery {
        device: test_log.device.as_ref(),
        master: &state.master,
        geometry: &state.geometry,
        config: &config,
        log_lowest_lsn: state.lowest_lsn,
        verifier: None,
    };
    let index = AsnIndex::new();
    let tracker = LsnExtentTracker::new();
    let report = recovery.recover(&extent, &index, &tracker).await.unwrap();

    assert!(report.checkpoint_segments >= 3);
    assert_eq!(report.last_checkpoint_lsn, checkpoint_lsn);
    assert_eq!(report.replayed_records, 0);
    assert_eq!(index.len(), 300);
    assert!(index.validate());

    let stream = test_log.open_stream(id).await.unwrap();
    for asn in [1u64, 150, 300] {
        let record = stream.read(Asn::new(asn), ReadType::Exact).await.unwrap();
        assert_eq!(record.metadata, asn.to_le_bytes());
        assert_eq!(record.payload, payload_for(asn, 64));
    }
}

#[tokio::test]
async fn wrapped_log_recovers() {
    let file_size = 128 * BLOCK_SIZE as u64;
    let test_log = TestLog::with_config(small_config(), file_size).await;
    let geometry = LogGeometry::new(file_size).unwrap();
    let stream = populated_stream(&test_log, 0, 0).await;
    let id = stream.id();

    let mut asn = 0u64;
    for _round in 0..6 {
        for _ in 0..10 {
            asn += 1;
            stream
                .write(Asn::new(asn), 1, b"", &payload_for(asn, 8000))
                .await
                .unwrap();
        }
        stream.truncate(Asn::new(asn - 1)).await.unwrap();
    }
    for _ in 0..10 {
        asn += 1;
        stream
            .write(Asn::new(asn), 1, b"", &payload_for(asn, 8000))
            .await
            .unwrap();
    }
    let space = test_log.query_space_info();
    assert!(space.next_lsn.as_i64() as u64 > geometry.lsn_space());
    drop(stream);

    let test_log = test_log.crash_and_reopen().await.unwrap();
    assert_eq!(test_log.query_space_info().next_lsn, space.next_lsn);
    let stream = test_log.open_stream(id).await.unwrap();
    let range = stream.query_asn_range();
    assert_eq!(range.truncation_point, Asn::new(asn - 11));
    assert_eq!(range.lowest, Asn::new(asn - 10));
    assert_eq!(range.highest, Asn::new(asn));
    for asn in range.lowest.as_u64()..=range.highest.as_u64() {
        let record = stream.read(Asn::new(asn), ReadType::Exact).await.unwrap();
        assert_eq!(record.payload, payload_for(asn, 8000));
    }
}

#[tokio::test]
async fn streams_recover_independently() {
    let test_log = TestLog::new().await;
    let kept = populated_stream(&test_log, 12, 700).await;
    let truncated = populated_stream(&test_log, 12, 700).await;
    let deleted = populated_stream(&test_log, 12, 700).await;
    let (kept_id, truncated_id, deleted_id) = (kept.id(), truncated.id(), deleted.id());

    truncated.truncate(Asn::new(8)).await.unwrap();
    deleted.close();
    test_log.delete_stream(deleted_id).await.unwrap();
    drop((kept, truncated));

    let test_log = test_log.crash_and_reopen().await.unwrap();
    let mut ids = test_log.query_stream_ids();
    ids.sort();
    let mut expected = vec![kept_id, truncated_id];
    expected.sort();
    assert_eq!(ids, expected);

    let kept = test_log.open_stream(kept_id).await.unwrap();
    assert_eq!(kept.query_asn_range().lowest, Asn::new(1));
    assert_eq!(kept.query_asn_range().highest, Asn::new(12));

    let truncated = test_log.open_stream(truncated_id).await.unwrap();
    let range = truncated.query_asn_range();
    assert_eq!(range.truncation_point, Asn::new(8));
    assert_eq!(range.lowest, Asn::new(9));
    let record = truncated.read(Asn::new(9), ReadType::Exact).await.unwrap();
    assert_eq!(record.payload, payload_for(9, 700));
}

#[tokio::test]
async fn overwritten_versions_recover_latest() {
    let test_log = TestLog::new().await;
    let stream = populated_stream(&test_log, 5, 100).await;
    let id = stream.id();
    stream.write(Asn::new(3), 2, b"v2", b"second").await.unwrap();
    stream.checkpoint().await.unwrap();
    stream.write(Asn::new(3), 3, b"v3", b"third").await.unwrap();
    drop(stream);

    let test_log = test_log.crash_and_reopen().await.unwrap();
    let stream = test_log.open_stream(id).await.unwrap();
    let record = stream.read(Asn::new(3), ReadType::Exact).await.unwrap();
    assert_eq!(record.version, 3);
    assert_eq!(record.payload, b"third");
    assert!(stream.write(Asn::new(3), 3, b"", b"stale").await.is_err());
}
