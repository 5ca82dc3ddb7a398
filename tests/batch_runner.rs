mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;

use hc_case_scout::core::types::{FailureKind, RunOutcome};
use hc_case_scout::core::PortalConfig;
use hc_case_scout::features::artifacts::ArtifactWriter;
use hc_case_scout::features::runner::BatchRunner;
use hc_case_scout::features::store::{CaseStore, SqliteCaseStore};

fn runner(h: &Harness, world: &SharedWorld, store: &Arc<SqliteCaseStore>, workers: usize) -> BatchRunner {
    BatchRunner::new(
        "run-1",
        Arc::clone(&h.orchestrator),
        Arc::new(FakeSessions { world: world.clone() }),
        store.clone(),
        workers,
    )
}

fn kind(outcome: &RunOutcome) -> Option<FailureKind> {
    match outcome {
        RunOutcome::Failed { reason } => Some(reason.kind),
        _ => None,
    }
}

#[tokio::test]
async fn every_request_gets_exactly_one_outcome() {
    init_tracing();
    let world = World::standard();
    script(
        &world,
        vec![
            Response::Rows(vec![row("WP(C) 1234/2021", "Pending")]),
            Response::NoRecords,
        ],
    );
    let h = harness(test_config(5));
    let store = Arc::new(SqliteCaseStore::in_memory().unwrap());

    let requests = vec![
        case_number_request("C1", "B1", "1234", 2021),
        party_request("C1", "B2", "nobody"),
        case_number_request("C1", "B9", "1", 2021),
    ];
    let ids: Vec<String> = requests.iter().map(|r| r.id.clone()).collect();
    let summary = runner(&h, &world, &store, 1).run(requests).await;

    assert_eq!(summary.outcomes.len(), 3);
    let got: Vec<String> = summary.outcomes.iter().map(|o| o.request_id.clone()).collect();
    assert_eq!(got, ids);
    assert!(summary.outcomes[0].outcome.is_success());
    assert_eq!(summary.outcomes[1].outcome, RunOutcome::NoResults);
    assert_eq!(kind(&summary.outcomes[2].outcome), Some(FailureKind::Navigation));
    assert_eq!(summary.inserted, 1);

    let stored = store.outcomes_for_run("run-1").await.unwrap();
    assert_eq!(stored.len(), 3);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total_searches, 3);
    assert_eq!(stats.total_cases, 1);

    let w = world.lock().unwrap();
    assert_eq!(w.opened, 3);
    assert_eq!(w.released, 3);
}

#[tokio::test]
async fn concurrent_workers_share_topology() {
    init_tracing();
    let world = World::standard();
    script(
        &world,
        vec![
            Response::Rows(vec![row("WP(C) 1/2021", "Pending")]),
            Response::Rows(vec![row("WP(C) 2/2021", "Pending")]),
            Response::Rows(vec![row("WP(C) 3/2021", "Pending")]),
            Response::Rows(vec![row("WP(C) 4/2021", "Pending")]),
        ],
    );
    let h = harness(test_config(5));
    let store = Arc::new(SqliteCaseStore::in_memory().unwrap());

    let requests = (1..=4)
        .map(|n| case_number_request("C1", "B1", &n.to_string(), 2021))
        .collect();
    let summary = runner(&h, &world, &store, 3).run(requests).await;

    assert_eq!(summary.count("success"), 4);
    assert_eq!(h.topology.refresh_count(), 0);
    assert_eq!(store.stats().await.unwrap().total_cases, 4);
}

#[tokio::test]
async fn cancelled_before_start_records_cancelled() {
    init_tracing();
    let world = World::standard();
    let h = harness(test_config(5));
    let store = Arc::new(SqliteCaseStore::in_memory().unwrap());
    let runner = runner(&h, &world, &store, 2);
    runner.cancellation_token().cancel();

    let summary = runner
        .run(vec![
            party_request("C1", "B1", "kumar"),
            party_request("C1", "B1", "sharma"),
        ])
        .await;

    assert_eq!(summary.outcomes.len(), 2);
    assert!(summary
        .outcomes
        .iter()
        .all(|o| kind(&o.outcome) == Some(FailureKind::Cancelled)));
    assert_eq!(world.lock().unwrap().opened, 0);
    assert_eq!(store.outcomes_for_run("run-1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn cancellation_mid_search_releases_session() {
    init_tracing();
    let world = World::standard();
    script(&world, vec![Response::Silent]);
    let cfg = Arc::new(PortalConfig {
        element_timeout_ms: 60_000,
        ..Default::default()
    });
    let h = harness(cfg);
    let store = Arc::new(SqliteCaseStore::in_memory().unwrap());
    let runner = runner(&h, &world, &store, 1);

    let token = runner.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(10),
        runner.run(vec![case_number_request("C1", "B1", "1", 2021)]),
    )
    .await
    .expect("cancellation should stop the batch promptly");

    assert_eq!(kind(&summary.outcomes[0].outcome), Some(FailureKind::Cancelled));
    {
        let w = world.lock().unwrap();
        assert_eq!(w.opened, 1);
        assert_eq!(w.released, 1);
        assert_eq!(w.submits, 1);
    }

    // The attempts spent before cancellation are kept.
    let cancelled = &summary.outcomes[0];
    assert_eq!(cancelled.captcha_attempts, 1);
    assert_eq!(cancelled.pipeline_attempts, 1);
    let stored = store.outcomes_for_run("run-1").await.unwrap();
    assert_eq!(stored[0].captcha_attempts, 1);
}

#[tokio::test]
async fn session_failure_is_isolated() {
    init_tracing();
    let world = World::standard();
    world.lock().unwrap().fail_open = true;
    let h = harness(test_config(5));
    let store = Arc::new(SqliteCaseStore::in_memory().unwrap());

    let summary = runner(&h, &world, &store, 1)
        .run(vec![party_request("C1", "B1", "kumar")])
        .await;

    assert_eq!(
        kind(&summary.outcomes[0].outcome),
        Some(FailureKind::SessionUnavailable)
    );
    assert_eq!(store.stats().await.unwrap().failed_searches, 1);
}

#[tokio::test]
async fn duplicate_request_id_is_a_persistence_conflict() {
    init_tracing();
    let world = World::standard();
    script(&world, vec![Response::NoRecords, Response::NoRecords]);
    let h = harness(test_config(5));
    let store = Arc::new(SqliteCaseStore::in_memory().unwrap());

    let a = party_request("C1", "B1", "kumar").with_id("dup");
    let b = party_request("C1", "B1", "sharma").with_id("dup");
    let summary = runner(&h, &world, &store, 1).run(vec![a, b]).await;

    assert_eq!(summary.outcomes[0].outcome, RunOutcome::NoResults);
    assert_eq!(kind(&summary.outcomes[1].outcome), Some(FailureKind::Persistence));
    // The first outcome stands.
    let stored = store.outcomes_for_run("run-1").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].outcome, RunOutcome::NoResults);
}

#[tokio::test]
async fn failures_leave_snapshots_and_journal() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let world = World::standard();
    script(&world, vec![Response::Rejected; 5]);
    let h = harness(test_config(2));
    let store = Arc::new(SqliteCaseStore::in_memory().unwrap());
    let artifacts = Arc::new(ArtifactWriter::new(dir.path(), "run-1"));

    let failing = party_request("C1", "B1", "kumar").with_id("req-fail");
    let summary = runner(&h, &world, &store, 1)
        .with_artifacts(Arc::clone(&artifacts))
        .run(vec![failing])
        .await;

    assert_eq!(summary.outcomes[0].outcome, RunOutcome::ExhaustedRetries { attempts: 2 });
    let snap = artifacts.request_dir("req-fail");
    assert!(snap.join("page.png").exists());
    assert!(snap.join("dom.html").exists());

    let journal = std::fs::read_to_string(artifacts.journal_path()).unwrap();
    assert_eq!(journal.lines().count(), 1);
    assert!(journal.contains("exhausted_retries"));
}
