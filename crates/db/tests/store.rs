//! Integration tests for the state store against real temp-file SQLite
//! databases: chunk partitioning on submit, the guarded state
//! transitions, blacklist and tag eligibility, dead-worker recovery,
//! pause/resume visibility, retry-failed, and snapshot/restore.

use std::collections::BTreeMap;

use midrender_core::chunking::compute_chunks;
use midrender_core::manifest::JobManifest;
use midrender_core::types::{ChunkRange, JobState};
use midrender_db::models::JobRow;
use midrender_db::repositories::{ChunkRepo, JobRepo};
use midrender_db::DbPool;
use tempfile::TempDir;

async fn test_pool() -> (DbPool, TempDir) {
    let dir = TempDir::new().unwrap();
    let pool = midrender_db::open(&dir.path().join("state.db"))
        .await
        .unwrap();
    (pool, dir)
}

fn manifest(job_id: &str, frame_start: i32, frame_end: i32, chunk_size: i32) -> JobManifest {
    JobManifest {
        job_id: job_id.into(),
        template_id: "blender-cycles".into(),
        submitted_by: "node-a".into(),
        submitted_at_ms: 1_700_000_000_000,
        frame_start,
        frame_end,
        chunk_size,
        max_retries: 3,
        timeout_seconds: None,
        output_dir: None,
        tags_required: vec![],
        cmd: BTreeMap::new(),
        flags: vec![],
        env: BTreeMap::new(),
        working_dir: None,
        progress_regex: None,
        frame_regex: None,
    }
}

/// Insert a job row plus its chunk partition, the way submission does.
async fn submit(pool: &DbPool, m: &JobManifest, priority: i32) {
    let row = JobRow {
        job_id: m.job_id.clone(),
        manifest_json: serde_json::to_string(m).unwrap(),
        current_state: "active".into(),
        priority,
        submitted_at_ms: m.submitted_at_ms,
    };
    JobRepo::insert(pool, &row).await.unwrap();
    let chunks = compute_chunks(m.frame_start, m.frame_end, m.chunk_size);
    ChunkRepo::insert_many(pool, &m.job_id, &chunks).await.unwrap();
}

#[tokio::test]
async fn submission_partitions_frame_range() {
    let (pool, _dir) = test_pool().await;
    submit(&pool, &manifest("shot-a", 1, 10, 5), 50).await;

    let chunks = ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!((chunks[0].frame_start, chunks[0].frame_end), (1, 5));
    assert_eq!((chunks[1].frame_start, chunks[1].frame_end), (6, 10));
    assert!(chunks.iter().all(|c| c.state == "pending"));
}

#[tokio::test]
async fn assign_is_pending_only() {
    let (pool, _dir) = test_pool().await;
    submit(&pool, &manifest("shot-a", 1, 5, 5), 50).await;
    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];

    assert!(ChunkRepo::assign(&pool, chunk.id, "n1", 1000).await.unwrap());
    // Second assign must not steal the chunk.
    assert!(!ChunkRepo::assign(&pool, chunk.id, "n2", 2000).await.unwrap());

    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
    assert_eq!(chunk.state, "assigned");
    assert_eq!(chunk.assigned_to.as_deref(), Some("n1"));
    assert_eq!(chunk.assigned_at_ms, Some(1000));
}

#[tokio::test]
async fn complete_is_idempotent() {
    let (pool, _dir) = test_pool().await;
    submit(&pool, &manifest("shot-a", 1, 5, 5), 50).await;
    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
    ChunkRepo::assign(&pool, chunk.id, "n1", 1000).await.unwrap();

    let range = ChunkRange::new(1, 5);
    assert!(ChunkRepo::complete(&pool, "shot-a", range, 2000).await.unwrap());
    // Duplicate report: no state change, no timestamp churn.
    assert!(!ChunkRepo::complete(&pool, "shot-a", range, 9999).await.unwrap());

    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
    assert_eq!(chunk.state, "completed");
    assert_eq!(chunk.completed_at_ms, Some(2000));
    assert!(chunk.assigned_to.is_none());
}

#[tokio::test]
async fn retry_count_stays_bounded_and_blacklist_grows() {
    let (pool, _dir) = test_pool().await;
    let m = manifest("shot-a", 1, 1, 1); // max_retries = 3
    submit(&pool, &m, 50).await;
    let range = ChunkRange::new(1, 1);

    for (attempt, node) in ["n1", "n2", "n3"].iter().enumerate() {
        let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
        assert_eq!(chunk.state, "pending");
        ChunkRepo::assign(&pool, chunk.id, node, 1000).await.unwrap();
        assert!(ChunkRepo::fail(&pool, "shot-a", range, m.max_retries, node)
            .await
            .unwrap());

        let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
        assert!(chunk.retry_count <= m.max_retries);
        assert_eq!(chunk.retry_count, attempt as i32 + 1);
        if attempt < 2 {
            assert_eq!(chunk.state, "pending");
        } else {
            // Exactly max_retries failures observed -- terminal.
            assert_eq!(chunk.state, "failed");
            assert_eq!(chunk.retry_count, 3);
        }
    }

    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
    let blacklist: Vec<&str> = chunk.failed_on.iter().map(String::as_str).collect();
    assert_eq!(blacklist, vec!["n1", "n2", "n3"]);
    assert!(chunk.assigned_to.is_none());
}

#[tokio::test]
async fn zero_max_retries_fails_terminally_on_first_failure() {
    let (pool, _dir) = test_pool().await;
    let mut m = manifest("shot-a", 1, 1, 1);
    m.max_retries = 0;
    submit(&pool, &m, 50).await;

    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
    ChunkRepo::assign(&pool, chunk.id, "n1", 1000).await.unwrap();
    ChunkRepo::fail(&pool, "shot-a", ChunkRange::new(1, 1), 0, "n1")
        .await
        .unwrap();

    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
    assert_eq!(chunk.state, "failed");
    assert_eq!(chunk.retry_count, 0);
}

#[tokio::test]
async fn duplicate_failure_report_is_absorbed() {
    let (pool, _dir) = test_pool().await;
    let m = manifest("shot-a", 1, 1, 1);
    submit(&pool, &m, 50).await;
    let range = ChunkRange::new(1, 1);

    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
    ChunkRepo::assign(&pool, chunk.id, "n1", 1000).await.unwrap();
    assert!(ChunkRepo::fail(&pool, "shot-a", range, 3, "n1").await.unwrap());
    // The chunk is back to pending; a replayed failure report is a no-op.
    assert!(!ChunkRepo::fail(&pool, "shot-a", range, 3, "n1").await.unwrap());

    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
    assert_eq!(chunk.retry_count, 1);
}

#[tokio::test]
async fn find_next_skips_blacklisted_node() {
    let (pool, _dir) = test_pool().await;
    let m = manifest("shot-a", 1, 1, 1);
    submit(&pool, &m, 50).await;
    let range = ChunkRange::new(1, 1);

    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
    ChunkRepo::assign(&pool, chunk.id, "n1", 1000).await.unwrap();
    ChunkRepo::fail(&pool, "shot-a", range, 3, "n1").await.unwrap();

    // n1 is blacklisted for this chunk; n2 is not.
    let for_n1 = ChunkRepo::find_next_pending_for_node(&pool, &[], "n1")
        .await
        .unwrap();
    assert!(for_n1.is_none());

    let for_n2 = ChunkRepo::find_next_pending_for_node(&pool, &[], "n2")
        .await
        .unwrap()
        .expect("n2 should get the chunk");
    assert_eq!(for_n2.job_id, "shot-a");
    assert_eq!(for_n2.range, range);
}

#[tokio::test]
async fn find_next_respects_required_tags() {
    let (pool, _dir) = test_pool().await;
    let mut m = manifest("gpu-job", 1, 5, 5);
    m.tags_required = vec!["gpu".into()];
    submit(&pool, &m, 50).await;

    let untagged = ChunkRepo::find_next_pending_for_node(&pool, &["cpu".into()], "n1")
        .await
        .unwrap();
    assert!(untagged.is_none());

    let tagged =
        ChunkRepo::find_next_pending_for_node(&pool, &["cpu".into(), "gpu".into()], "n1")
            .await
            .unwrap();
    assert!(tagged.is_some());
}

#[tokio::test]
async fn find_next_honours_job_priority_then_frame_order() {
    let (pool, _dir) = test_pool().await;
    submit(&pool, &manifest("low", 1, 10, 5), 80).await;
    submit(&pool, &manifest("high", 1, 10, 5), 20).await;

    let next = ChunkRepo::find_next_pending_for_node(&pool, &[], "n1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.job_id, "high");
    assert_eq!(next.range, ChunkRange::new(1, 5));
}

#[tokio::test]
async fn priority_update_reorders_dispatch() {
    let (pool, _dir) = test_pool().await;
    submit(&pool, &manifest("first", 1, 5, 5), 50).await;
    submit(&pool, &manifest("second", 1, 5, 5), 50).await;

    // Equal priority: submission order (timestamps are equal here, so
    // either is acceptable) -- after boosting "second", it must win.
    assert!(JobRepo::update_priority(&pool, "second", 10).await.unwrap());

    let next = ChunkRepo::find_next_pending_for_node(&pool, &[], "n1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.job_id, "second");
}

#[tokio::test]
async fn reset_all_wipes_every_chunk_to_a_clean_slate() {
    let (pool, _dir) = test_pool().await;
    submit(&pool, &manifest("shot-a", 1, 2, 1), 50).await;
    let chunks = ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap();

    ChunkRepo::assign(&pool, chunks[0].id, "n1", 1000).await.unwrap();
    ChunkRepo::fail(&pool, "shot-a", chunks[0].range(), 0, "n1")
        .await
        .unwrap();
    ChunkRepo::assign(&pool, chunks[1].id, "n1", 1000).await.unwrap();
    ChunkRepo::complete(&pool, "shot-a", chunks[1].range(), 2000)
        .await
        .unwrap();
    ChunkRepo::add_completed_frame(&pool, "shot-a", 2).await.unwrap();

    let count = ChunkRepo::reset_all(&pool, "shot-a").await.unwrap();
    assert_eq!(count, 2);

    for chunk in ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap() {
        assert_eq!(chunk.state, "pending");
        assert_eq!(chunk.retry_count, 0);
        assert!(chunk.assigned_to.is_none());
        assert!(chunk.completed_at_ms.is_none());
        assert!(chunk.completed_frames.is_empty());
        assert!(chunk.failed_on.is_empty());
    }
}

#[tokio::test]
async fn paused_job_is_invisible_to_dispatch() {
    let (pool, _dir) = test_pool().await;
    submit(&pool, &manifest("shot-a", 1, 10, 1), 50).await;

    JobRepo::update_state(&pool, "shot-a", JobState::Paused)
        .await
        .unwrap();
    assert!(ChunkRepo::find_next_pending_for_node(&pool, &[], "n1")
        .await
        .unwrap()
        .is_none());

    JobRepo::update_state(&pool, "shot-a", JobState::Active)
        .await
        .unwrap();
    assert!(ChunkRepo::find_next_pending_for_node(&pool, &[], "n1")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn dead_worker_chunks_return_to_pending() {
    let (pool, _dir) = test_pool().await;
    submit(&pool, &manifest("shot-a", 1, 10, 5), 50).await;
    let chunks = ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap();
    ChunkRepo::assign(&pool, chunks[0].id, "dead", 1000).await.unwrap();
    ChunkRepo::assign(&pool, chunks[1].id, "alive", 1000).await.unwrap();

    let count = ChunkRepo::reassign_dead_worker(&pool, "dead").await.unwrap();
    assert_eq!(count, 1);

    let chunks = ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap();
    assert_eq!(chunks[0].state, "pending");
    assert!(chunks[0].assigned_to.is_none());
    assert_eq!(chunks[1].state, "assigned");
}

#[tokio::test]
async fn release_does_not_touch_retry_or_blacklist() {
    let (pool, _dir) = test_pool().await;
    submit(&pool, &manifest("shot-a", 1, 5, 5), 50).await;
    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
    ChunkRepo::assign(&pool, chunk.id, "n1", 1000).await.unwrap();

    assert!(ChunkRepo::release(&pool, "shot-a", ChunkRange::new(1, 5))
        .await
        .unwrap());

    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
    assert_eq!(chunk.state, "pending");
    assert_eq!(chunk.retry_count, 0);
    assert!(chunk.failed_on.is_empty());
}

#[tokio::test]
async fn job_completion_requires_at_least_one_completed_chunk() {
    let (pool, _dir) = test_pool().await;
    let m = manifest("shot-a", 1, 2, 1);
    submit(&pool, &m, 50).await;
    let chunks = ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap();

    assert!(!ChunkRepo::is_job_complete(&pool, "shot-a").await.unwrap());

    // Fail both chunks terminally: still not "complete".
    for c in &chunks {
        ChunkRepo::assign(&pool, c.id, "n1", 1000).await.unwrap();
        ChunkRepo::fail(&pool, "shot-a", c.range(), 0, "n1").await.unwrap();
    }
    assert!(!ChunkRepo::is_job_complete(&pool, "shot-a").await.unwrap());

    // Re-arm and complete one of them: one completed + one failed = done.
    ChunkRepo::retry_failed(&pool, "shot-a").await.unwrap();
    let chunks = ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap();
    ChunkRepo::assign(&pool, chunks[0].id, "n2", 2000).await.unwrap();
    ChunkRepo::complete(&pool, "shot-a", chunks[0].range(), 3000)
        .await
        .unwrap();
    ChunkRepo::assign(&pool, chunks[1].id, "n2", 2000).await.unwrap();
    ChunkRepo::fail(&pool, "shot-a", chunks[1].range(), 0, "n2")
        .await
        .unwrap();

    assert!(ChunkRepo::is_job_complete(&pool, "shot-a").await.unwrap());
}

#[tokio::test]
async fn retry_failed_preserves_blacklist_and_resets_counts() {
    let (pool, _dir) = test_pool().await;
    let m = manifest("shot-a", 1, 2, 1);
    submit(&pool, &m, 50).await;
    let chunks = ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap();

    ChunkRepo::assign(&pool, chunks[0].id, "n1", 1000).await.unwrap();
    ChunkRepo::fail(&pool, "shot-a", chunks[0].range(), 0, "n1")
        .await
        .unwrap();
    ChunkRepo::assign(&pool, chunks[1].id, "n1", 1000).await.unwrap();
    ChunkRepo::complete(&pool, "shot-a", chunks[1].range(), 2000)
        .await
        .unwrap();
    JobRepo::update_state(&pool, "shot-a", JobState::Completed)
        .await
        .unwrap();

    let count = ChunkRepo::retry_failed(&pool, "shot-a").await.unwrap();
    assert_eq!(count, 1);

    let chunks = ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap();
    assert_eq!(chunks[0].state, "pending");
    assert_eq!(chunks[0].retry_count, 0);
    assert!(chunks[0].is_blacklisted("n1"));
    // The completed chunk is untouched.
    assert_eq!(chunks[1].state, "completed");

    // And the job is dispatchable again.
    let job = JobRepo::find_by_id(&pool, "shot-a").await.unwrap().unwrap();
    assert_eq!(job.current_state, "active");
}

#[tokio::test]
async fn completed_frames_merge_with_set_semantics() {
    let (pool, _dir) = test_pool().await;
    submit(&pool, &manifest("shot-a", 1, 10, 5), 50).await;

    ChunkRepo::add_completed_frames_batch(&pool, "shot-a", &[1, 3, 2, 3, 7])
        .await
        .unwrap();
    ChunkRepo::add_completed_frame(&pool, "shot-a", 2).await.unwrap();
    // Frame outside the job's range is dropped.
    ChunkRepo::add_completed_frame(&pool, "shot-a", 99).await.unwrap();

    let chunks = ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap();
    assert_eq!(chunks[0].completed_frames.0, vec![1, 2, 3]);
    assert_eq!(chunks[1].completed_frames.0, vec![7]);
}

#[tokio::test]
async fn delete_job_cascades_to_chunks() {
    let (pool, _dir) = test_pool().await;
    submit(&pool, &manifest("shot-a", 1, 10, 5), 50).await;

    assert!(JobRepo::delete(&pool, "shot-a").await.unwrap());
    assert!(ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap().is_empty());
}

#[tokio::test]
async fn list_with_progress_groups_chunk_states() {
    let (pool, _dir) = test_pool().await;
    submit(&pool, &manifest("shot-a", 1, 10, 1), 50).await;
    let chunks = ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap();

    ChunkRepo::assign(&pool, chunks[0].id, "n1", 1000).await.unwrap();
    ChunkRepo::complete(&pool, "shot-a", chunks[0].range(), 2000)
        .await
        .unwrap();
    ChunkRepo::assign(&pool, chunks[1].id, "n1", 1000).await.unwrap();

    let summaries = JobRepo::list_with_progress(&pool).await.unwrap();
    assert_eq!(summaries.len(), 1);
    let p = &summaries[0].progress;
    assert_eq!(p.total, 10);
    assert_eq!(p.completed, 1);
    assert_eq!(p.rendering, 1);
    assert_eq!(p.pending, 8);
    assert_eq!(p.failed, 0);
}

#[tokio::test]
async fn snapshot_and_restore_round_trip() {
    let (pool, dir) = test_pool().await;
    submit(&pool, &manifest("shot-a", 1, 10, 5), 50).await;
    let chunks = ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap();
    ChunkRepo::assign(&pool, chunks[0].id, "n1", 1000).await.unwrap();

    let snapshot = dir.path().join("shared").join("snapshot.db");
    midrender_db::snapshot_to(&pool, &snapshot).await.unwrap();
    // A second snapshot overwrites the first.
    midrender_db::snapshot_to(&pool, &snapshot).await.unwrap();

    let restored = midrender_db::restore_from(&snapshot, &dir.path().join("restored.db"))
        .await
        .unwrap();
    let jobs = JobRepo::list_all(&restored).await.unwrap();
    assert_eq!(jobs.len(), 1);
    let chunks = ChunkRepo::list_for_job(&restored, "shot-a").await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].state, "assigned");
    assert_eq!(chunks[0].assigned_to.as_deref(), Some("n1"));
}
