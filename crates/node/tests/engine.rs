//! Dispatch-engine behaviour that spans the registry and the store:
//! dead-worker recovery, assignment-transport failure handling, and the
//! worker-to-leader report path.

use std::collections::BTreeMap;

use midrender_core::manifest::JobManifest;
use midrender_core::types::{now_ms, ChunkRange, NodeState, RenderState};
use midrender_db::repositories::ChunkRepo;
use midrender_node::bootstrap;
use midrender_node::config::NodeConfig;
use midrender_node::reports::{flush_once, ChunkEvent, ChunkOutcome, FrameEvent};
use midrender_node::state::AppState;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn leader_state() -> (AppState, TempDir) {
    let root = TempDir::new().unwrap();
    let state = bootstrap::build_state(NodeConfig::for_test(root.path()), CancellationToken::new())
        .await
        .unwrap();
    state.registry.recompute_leader().await;
    state.leader.open_store(&state).await;
    assert!(state.leader.is_ready());
    // The local worker stays out of assignment in these tests.
    state.set_node_state(NodeState::Stopped).await;
    (state, root)
}

async fn add_peer(state: &AppState, node_id: &str, endpoint: &str) {
    state
        .registry
        .process_udp_heartbeat(
            node_id,
            endpoint.to_string(),
            NodeState::Active,
            RenderState::Idle,
            String::new(),
            String::new(),
            100,
            now_ms(),
        )
        .await;
}

fn manifest(job_id: &str, frame_start: i32, frame_end: i32, chunk_size: i32) -> JobManifest {
    let mut cmd = BTreeMap::new();
    cmd.insert("linux".to_string(), "/usr/bin/true".to_string());
    cmd.insert("macos".to_string(), "/usr/bin/true".to_string());
    cmd.insert("windows".to_string(), "true.exe".to_string());
    JobManifest {
        job_id: job_id.into(),
        template_id: "blender-cycles".into(),
        submitted_by: "test".into(),
        submitted_at_ms: now_ms(),
        frame_start,
        frame_end,
        chunk_size,
        max_retries: 3,
        timeout_seconds: None,
        output_dir: None,
        tags_required: vec![],
        cmd,
        flags: vec![],
        env: BTreeMap::new(),
        working_dir: None,
        progress_regex: None,
        frame_regex: None,
    }
}

#[tokio::test]
async fn dead_worker_chunks_are_reassigned_within_one_tick() {
    let (state, _root) = leader_state().await;
    let pool = state.leader.pool().await.unwrap();

    state
        .engine
        .submit_job(&pool, &manifest("shot-a", 1, 5, 5), 50)
        .await
        .unwrap();
    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
    ChunkRepo::assign(&pool, chunk.id, "doomed-worker", now_ms())
        .await
        .unwrap();

    // The worker was known, then said goodbye.
    add_peer(&state, "doomed-worker", "10.0.0.9:8420").await;
    state.registry.process_udp_goodbye("doomed-worker").await;

    state.engine.tick(&state).await;

    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
    assert_eq!(chunk.state, "pending");
    assert!(chunk.assigned_to.is_none());
    // No failure was charged: the worker died, it did not fail the chunk.
    assert_eq!(chunk.retry_count, 0);
    assert!(chunk.failed_on.is_empty());
}

#[tokio::test]
async fn unreachable_worker_assignment_is_reverted_without_penalty() {
    let (state, _root) = leader_state().await;
    let pool = state.leader.pool().await.unwrap();

    state
        .engine
        .submit_job(&pool, &manifest("shot-a", 1, 5, 5), 50)
        .await
        .unwrap();

    // An alive, idle peer whose endpoint refuses connections.
    add_peer(&state, "ghost-worker", "127.0.0.1:9").await;

    state.engine.tick(&state).await;

    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
    assert_eq!(chunk.state, "pending");
    assert!(chunk.assigned_to.is_none());
    // A transport failure is the leader's problem: no retry consumed, no
    // blacklist entry, no machine-level failure recorded.
    assert_eq!(chunk.retry_count, 0);
    assert!(chunk.failed_on.is_empty());
    assert!(!state.engine.is_suspended("ghost-worker").await);
}

#[tokio::test]
async fn suspended_worker_receives_no_assignments() {
    let (state, _root) = leader_state().await;
    let pool = state.leader.pool().await.unwrap();

    let mut m = manifest("shot-a", 1, 1, 1);
    m.max_retries = 99;
    state.engine.submit_job(&pool, &m, 50).await.unwrap();

    // Five failures inside the window suspend the node.
    for _ in 0..5 {
        let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
        ChunkRepo::assign(&pool, chunk.id, "flaky-worker", now_ms())
            .await
            .unwrap();
        state
            .engine
            .queue_failure(midrender_node::engine::FailureReport {
                node_id: "flaky-worker".into(),
                job_id: "shot-a".into(),
                frame_start: 1,
                frame_end: 1,
                error: "crash".into(),
            })
            .await;
        state.engine.tick(&state).await;
    }
    assert!(state.engine.is_suspended("flaky-worker").await);

    // The suspended peer is idle and alive, but never picked. Note the
    // chunk's own blacklist would also exclude it here; the suspension
    // check fires first and applies to every job farm-wide.
    add_peer(&state, "flaky-worker", "127.0.0.1:9").await;
    state.engine.tick(&state).await;

    let chunk = &ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap()[0];
    assert_eq!(chunk.state, "pending");
}

#[tokio::test]
async fn reports_flush_directly_into_the_local_leader() {
    let (state, _root) = leader_state().await;
    let pool = state.leader.pool().await.unwrap();

    state
        .engine
        .submit_job(&pool, &manifest("shot-a", 1, 10, 5), 50)
        .await
        .unwrap();
    let chunks = ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap();
    let self_id = state.registry.node_id().to_string();
    ChunkRepo::assign(&pool, chunks[0].id, &self_id, now_ms())
        .await
        .unwrap();

    state
        .reports
        .push_chunk(ChunkEvent {
            job_id: "shot-a".into(),
            range: ChunkRange::new(1, 5),
            outcome: ChunkOutcome::Completed {
                elapsed_ms: 4321,
                exit_code: 0,
            },
        })
        .await;
    state
        .reports
        .push_frame(FrameEvent {
            job_id: "shot-a".into(),
            frame: 6,
        })
        .await;

    assert!(flush_once(&state).await);
    assert_eq!(state.reports.pending_counts().await, (0, 0));

    state.engine.tick(&state).await;

    let chunks = ChunkRepo::list_for_job(&pool, "shot-a").await.unwrap();
    assert_eq!(chunks[0].state, "completed");
    assert_eq!(chunks[1].completed_frames.0, vec![6]);
}

#[tokio::test]
async fn reports_buffer_while_no_leader_is_known() {
    let root = TempDir::new().unwrap();
    let state = bootstrap::build_state(NodeConfig::for_test(root.path()), CancellationToken::new())
        .await
        .unwrap();
    // No election has run: no leader anywhere.

    state
        .reports
        .push_chunk(ChunkEvent {
            job_id: "shot-a".into(),
            range: ChunkRange::new(1, 5),
            outcome: ChunkOutcome::Failed {
                error: "renderer crashed".into(),
            },
        })
        .await;

    // Not a contact failure -- just keep buffering.
    assert!(flush_once(&state).await);
    assert_eq!(state.reports.pending_counts().await.0, 1);
}
