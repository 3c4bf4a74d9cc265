mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    branch_lease, environment, epoch, project, records, rule, FakeConnectors, FakeGitStore, FakeRuleSource,
    ManualClock,
};
use rulesync_core::config::SyncSettings;
use rulesync_core::contract::JobStore;
use rulesync_core::job::SyncController;
use rulesync_core::model::{EnvironmentKind, JobKind, JobStatus, Project};
use rulesync_core::scheduler::{ScheduledOutcome, Scheduler};
use rulesync_core::store::{MemoryStore, StoreRecords};

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    connectors: FakeConnectors,
    scheduler: Arc<Scheduler>,
    controller: Arc<SyncController>,
}

fn harness(records: StoreRecords) -> Harness {
    let store = Arc::new(MemoryStore::new(records));
    let clock = Arc::new(ManualClock::new(epoch()));
    let connectors = FakeConnectors::new(
        FakeRuleSource::with_rules(vec![rule("A", "Rule A", "a")]),
        FakeGitStore::new(&["main"]),
    );
    let controller = Arc::new(SyncController::new(
        store.clone(),
        Arc::new(connectors.clone()),
        clock.clone(),
        SyncSettings::default(),
    ));
    let scheduler = Arc::new(Scheduler::new(controller.clone(), clock.clone()));
    Harness {
        store,
        clock,
        connectors,
        scheduler,
        controller,
    }
}

fn synced_minutes_ago(id: &str, minutes: i64) -> Project {
    let last = Some(epoch() - chrono::Duration::minutes(minutes));
    Project {
        last_sync_test: last,
        ..project(id)
    }
}

#[tokio::test]
async fn test_pair_is_not_due_before_interval_elapses() {
    let recs = records(
        vec![synced_minutes_ago("soc", 45)],
        vec![environment("soc", EnvironmentKind::Test, "main", "default")],
    );
    let h = harness(recs);

    assert!(h.scheduler.due_pairs().await.unwrap().is_empty());
    let report = h.scheduler.tick().await.unwrap();
    assert!(report.runs.is_empty());
    assert!(h.store.jobs().await.is_empty());
}

#[tokio::test]
async fn test_pair_runs_once_interval_elapses_and_timestamp_resets() {
    let recs = records(
        vec![synced_minutes_ago("soc", 45)],
        vec![environment("soc", EnvironmentKind::Test, "main", "default")],
    );
    let h = harness(recs);
    h.clock.advance_minutes(16);

    let due = h.scheduler.due_pairs().await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].environment, EnvironmentKind::Test);

    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.completed(), 1);

    let jobs = h.store.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::Scheduled);
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert!(h.connectors.git.commits().iter().all(|c| c.starts_with("[Auto-Sync] ")));

    let project = h.store.get_project("soc").await.unwrap().unwrap();
    assert_eq!(project.last_sync_test, Some(epoch() + chrono::Duration::minutes(16)));

    // Immediately after, nothing is due.
    assert!(h.scheduler.tick().await.unwrap().runs.is_empty());
}

#[tokio::test]
async fn test_failed_run_still_resets_timestamp() {
    let broken = Project {
        git_repository_id: Some("missing".into()),
        ..project("broken")
    };
    let recs = records(vec![broken], vec![environment("broken", EnvironmentKind::Production, "main", "default")]);
    let h = harness(recs);

    let report = h.scheduler.tick().await.unwrap();

    assert_eq!(report.failed(), 1);
    assert!(matches!(report.runs[0].outcome, ScheduledOutcome::Failed { job_id: Some(_), .. }));
    let jobs = h.store.jobs().await;
    assert_eq!(jobs[0].status, JobStatus::Failed);
    let project = h.store.get_project("broken").await.unwrap().unwrap();
    assert_eq!(project.last_sync_prod, Some(epoch()));
}

#[tokio::test]
async fn test_busy_pair_keeps_its_timestamp() {
    let recs = records(vec![project("soc")], vec![environment("soc", EnvironmentKind::Test, "main", "default")]);
    let h = harness(recs);
    let _held = h
        .controller
        .leases()
        .try_acquire(branch_lease("main"))
        .unwrap();

    let report = h.scheduler.tick().await.unwrap();

    assert_eq!(report.busy(), 1);
    assert!(h.store.jobs().await.is_empty());
    let project = h.store.get_project("soc").await.unwrap().unwrap();
    assert_eq!(project.last_sync_test, None);
}

#[tokio::test]
async fn test_ineligible_projects_are_skipped() {
    let disabled = Project {
        auto_sync_enabled: false,
        ..project("disabled")
    };
    let inactive = Project {
        active: false,
        ..project("inactive")
    };
    let zero = Project {
        auto_sync_interval_minutes: 0,
        ..project("zero")
    };
    let recs = records(
        vec![disabled, inactive, zero, project("no-envs"), project("soc")],
        vec![
            environment("disabled", EnvironmentKind::Test, "main", "default"),
            environment("inactive", EnvironmentKind::Test, "main", "default"),
            environment("zero", EnvironmentKind::Test, "main", "default"),
            environment("soc", EnvironmentKind::Test, "main", "default"),
            environment("soc", EnvironmentKind::Production, "main", "default"),
        ],
    );
    let h = harness(recs);

    let due = h.scheduler.due_pairs().await.unwrap();
    let pairs: Vec<(String, EnvironmentKind)> = due.into_iter().map(|d| (d.project_id, d.environment)).collect();
    assert_eq!(
        pairs,
        vec![
            ("soc".to_string(), EnvironmentKind::Test),
            ("soc".to_string(), EnvironmentKind::Production),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_run_ticks_until_shutdown() {
    let recs = records(vec![project("soc")], vec![environment("soc", EnvironmentKind::Test, "main", "default")]);
    let h = harness(recs);

    let scheduler = Arc::clone(&h.scheduler);
    scheduler.run(tokio::time::sleep(Duration::from_secs(150))).await;
    // Let the last spawned tick finish.
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Three ticks fired; only the first found the pair due.
    let jobs = h.store.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::Scheduled);
}

#[tokio::test]
async fn test_huge_interval_is_never_due_again() {
    let huge = Project {
        auto_sync_interval_minutes: i64::MAX / 2,
        ..synced_minutes_ago("soc", 10_000)
    };
    let recs = records(vec![huge], vec![environment("soc", EnvironmentKind::Test, "main", "default")]);
    let h = harness(recs);

    assert!(h.scheduler.due_pairs().await.unwrap().is_empty());
    assert!(h.scheduler.tick().await.unwrap().runs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_ticks_run_each_pair_once() {
    let recs = records(
        vec![project("soc")],
        vec![
            environment("soc", EnvironmentKind::Test, "test", "soc-test"),
            environment("soc", EnvironmentKind::Production, "prod", "soc-prod"),
        ],
    );
    let h = harness(recs);
    // The first tick stalls on its first pair while the second tick runs.
    h.connectors.rules.delay_next_listing(Duration::from_secs(90));

    let (first, second) = tokio::join!(h.scheduler.tick(), h.scheduler.tick());
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.completed(), 1);
    assert_eq!(second.busy(), 1);
    assert_eq!(second.completed(), 1);

    let jobs = h.store.jobs().await;
    let per_env = |env| jobs.iter().filter(|j| j.environment == Some(env)).count();
    assert_eq!(per_env(EnvironmentKind::Test), 1);
    assert_eq!(per_env(EnvironmentKind::Production), 1);
}
