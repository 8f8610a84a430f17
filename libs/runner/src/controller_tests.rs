//! Scenario tests for the deployment scheduler, run against the in-memory
//! control plane.

use crate::controller::signal::StopSignal;
use crate::controller::{log_persister::StageLogPersister, metadata::MetadataStore};
use crate::controller::{DeploymentScheduler, SchedulerDeps};
use crate::executor::wait_approval::{WaitApprovalExecutor, METADATA_APPROVED_BY};
use crate::executor::{Executor, ExecutorInput, ExecutorRegistry, StageOutcome};
use crate::planner::PlannerRegistry;
use crate::testutil::{application, deployment, scheduler_deps, FakeApiClient};

use piped_model::{
    ApplicationKind, Command, CommandType, DeploymentStatus, Stage, StageName, StageStatus,
};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Executor that finishes immediately with a fixed outcome.
struct StaticExecutor(StageOutcome);

#[async_trait]
impl Executor for StaticExecutor {
    async fn execute(&self, _input: &ExecutorInput, _signal: StopSignal) -> StageOutcome {
        self.0.clone()
    }
}

/// Executor that keeps asking for another tick until it is told to stop.
struct GateExecutor;

#[async_trait]
impl Executor for GateExecutor {
    async fn execute(&self, _input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        match signal.signaled() {
            Some(kind) => StageOutcome::Cancelled(format!("{kind:?}")),
            None => StageOutcome::Exited,
        }
    }
}

fn rollback_stage(index: u32) -> Stage {
    Stage::new("stage-rollback", StageName::Rollback, index).hidden()
}

fn assert_monotonic(history: &[StageStatus]) {
    let mut terminal_seen = false;
    for status in history {
        assert!(
            !terminal_seen,
            "observed a transition after a terminal state: {history:?}"
        );
        if status.is_terminal() {
            terminal_seen = true;
        }
    }
}

#[tokio::test]
async fn test_pipeline_runs_stages_in_dag_order() {
    let api = Arc::new(FakeApiClient::default());
    let app = application("app-1", ApplicationKind::Kubernetes);

    let mut executors = ExecutorRegistry::default();
    executors.register(
        ApplicationKind::Kubernetes,
        StageName::K8sCanaryRollout,
        Arc::new(|| Box::new(StaticExecutor(StageOutcome::Success))),
    );
    executors.register(
        ApplicationKind::Kubernetes,
        StageName::K8sPrimaryRollout,
        Arc::new(|| Box::new(StaticExecutor(StageOutcome::Success))),
    );

    let stages = vec![
        Stage::new("stage-0", StageName::K8sCanaryRollout, 0),
        Stage::new("stage-1", StageName::K8sPrimaryRollout, 1)
            .with_requires(vec!["stage-0".to_string()]),
    ];
    let d = deployment("d-1", &app, DeploymentStatus::Planned, stages);
    api.deployments.lock().insert(d.id.clone(), d.clone());

    let deps: Arc<SchedulerDeps> =
        scheduler_deps(api.clone(), executors, PlannerRegistry::default()).await;
    let scheduler = DeploymentScheduler::new(deps, Arc::new(app), d, None, None);
    let status = scheduler.run(CancellationToken::new()).await;

    assert_eq!(status, DeploymentStatus::Success);
    assert_eq!(
        api.stage_status_history("stage-0"),
        vec![StageStatus::Running, StageStatus::Success]
    );
    assert_eq!(
        api.stage_status_history("stage-1"),
        vec![StageStatus::Running, StageStatus::Success]
    );
    // the predecessor finished before its successor started
    let reports = api.stage_reports.lock();
    let s0_done = reports
        .iter()
        .position(|(_, id, s, _)| id == "stage-0" && *s == StageStatus::Success)
        .unwrap();
    let s1_started = reports
        .iter()
        .position(|(_, id, s, _)| id == "stage-1" && *s == StageStatus::Running)
        .unwrap();
    assert!(s0_done < s1_started);
}

#[tokio::test]
async fn test_stage_failure_runs_rollback_and_fails_deployment() {
    let api = Arc::new(FakeApiClient::default());
    let app = application("app-1", ApplicationKind::Kubernetes);

    let mut executors = ExecutorRegistry::default();
    executors.register(
        ApplicationKind::Kubernetes,
        StageName::K8sPrimaryRollout,
        Arc::new(|| {
            Box::new(StaticExecutor(StageOutcome::Failure(
                "workload rollout failed".to_string(),
            )))
        }),
    );
    executors.register(
        ApplicationKind::Kubernetes,
        StageName::Rollback,
        Arc::new(|| Box::new(StaticExecutor(StageOutcome::Success))),
    );

    let stages = vec![
        Stage::new("stage-0", StageName::K8sPrimaryRollout, 0),
        rollback_stage(1),
    ];
    let d = deployment("d-1", &app, DeploymentStatus::Planned, stages);
    api.deployments.lock().insert(d.id.clone(), d.clone());

    let deps = scheduler_deps(api.clone(), executors, PlannerRegistry::default()).await;
    let status = DeploymentScheduler::new(deps, Arc::new(app), d, None, None)
        .run(CancellationToken::new())
        .await;

    // rollback ran and succeeded, but that does not mask the failure
    assert_eq!(status, DeploymentStatus::Failure);
    let (final_status, reason) = api.completed_status("d-1").unwrap();
    assert_eq!(final_status, DeploymentStatus::Failure);
    assert_eq!(reason, "workload rollout failed");
    assert_eq!(
        api.stage_status_history("stage-rollback"),
        vec![StageStatus::Running, StageStatus::Success]
    );
    assert_monotonic(&api.stage_status_history("stage-0"));
    assert_monotonic(&api.stage_status_history("stage-rollback"));
    assert!(api
        .deployment_reports
        .lock()
        .contains(&("d-1".to_string(), DeploymentStatus::RollingBack)));
}

#[tokio::test]
async fn test_cancel_with_rollback() {
    let api = Arc::new(FakeApiClient::default());
    let app = application("app-1", ApplicationKind::Kubernetes);

    api.commands.lock().push(Command {
        id: "cmd-1".to_string(),
        command_type: CommandType::CancelDeployment,
        application_id: app.id.clone(),
        deployment_id: "d-1".to_string(),
        stage_id: String::new(),
        commander: "alice".to_string(),
        handled: false,
        force_rollback: true,
        force_no_rollback: false,
        created_at: None,
    });

    let mut executors = ExecutorRegistry::default();
    executors.register(
        ApplicationKind::Kubernetes,
        StageName::K8sPrimaryRollout,
        Arc::new(|| Box::new(GateExecutor)),
    );
    executors.register(
        ApplicationKind::Kubernetes,
        StageName::Rollback,
        Arc::new(|| Box::new(StaticExecutor(StageOutcome::Success))),
    );

    let stages = vec![
        Stage::new("stage-0", StageName::K8sPrimaryRollout, 0),
        rollback_stage(1),
    ];
    let d = deployment("d-1", &app, DeploymentStatus::Planned, stages);
    api.deployments.lock().insert(d.id.clone(), d.clone());

    let deps = scheduler_deps(api.clone(), executors, PlannerRegistry::default()).await;
    let status = DeploymentScheduler::new(deps, Arc::new(app), d, None, None)
        .run(CancellationToken::new())
        .await;

    assert_eq!(status, DeploymentStatus::Failure);
    let (final_status, reason) = api.completed_status("d-1").unwrap();
    assert_eq!(final_status, DeploymentStatus::Failure);
    assert_eq!(reason, "cancelled");
    assert_eq!(
        api.stage_status_history("stage-0"),
        vec![StageStatus::Running, StageStatus::Cancelled]
    );
    assert_eq!(
        api.stage_status_history("stage-rollback"),
        vec![StageStatus::Running, StageStatus::Success]
    );
    assert!(api.handled_commands.lock().contains(&"cmd-1".to_string()));
}

#[tokio::test]
async fn test_cancel_without_rollback_ends_cancelled() {
    let api = Arc::new(FakeApiClient::default());
    let app = application("app-1", ApplicationKind::Kubernetes);

    api.commands.lock().push(Command {
        id: "cmd-1".to_string(),
        command_type: CommandType::CancelDeployment,
        application_id: app.id.clone(),
        deployment_id: "d-1".to_string(),
        stage_id: String::new(),
        commander: "alice".to_string(),
        handled: false,
        force_rollback: false,
        force_no_rollback: true,
        created_at: None,
    });

    let mut executors = ExecutorRegistry::default();
    executors.register(
        ApplicationKind::Kubernetes,
        StageName::K8sPrimaryRollout,
        Arc::new(|| Box::new(GateExecutor)),
    );
    executors.register(
        ApplicationKind::Kubernetes,
        StageName::Rollback,
        Arc::new(|| Box::new(StaticExecutor(StageOutcome::Success))),
    );

    let stages = vec![
        Stage::new("stage-0", StageName::K8sPrimaryRollout, 0),
        rollback_stage(1),
    ];
    let d = deployment("d-1", &app, DeploymentStatus::Planned, stages);
    api.deployments.lock().insert(d.id.clone(), d.clone());

    let deps = scheduler_deps(api.clone(), executors, PlannerRegistry::default()).await;
    let status = DeploymentScheduler::new(deps, Arc::new(app), d, None, None)
        .run(CancellationToken::new())
        .await;

    assert_eq!(status, DeploymentStatus::Cancelled);
    // the rollback stage never ran
    assert!(api.stage_status_history("stage-rollback").is_empty());
}

#[tokio::test]
async fn test_approval_flow_records_approver() {
    let api = Arc::new(FakeApiClient::default());
    let app = application("app-1", ApplicationKind::Kubernetes);

    api.commands.lock().push(Command {
        id: "cmd-1".to_string(),
        command_type: CommandType::ApproveStage,
        application_id: app.id.clone(),
        deployment_id: "d-1".to_string(),
        stage_id: "stage-0".to_string(),
        commander: "alice".to_string(),
        handled: false,
        force_rollback: false,
        force_no_rollback: false,
        created_at: None,
    });

    let mut executors = ExecutorRegistry::default();
    executors.register_generic_stages();
    executors.register(
        ApplicationKind::Kubernetes,
        StageName::K8sPrimaryRollout,
        Arc::new(|| Box::new(StaticExecutor(StageOutcome::Success))),
    );

    let stages = vec![
        Stage::new("stage-0", StageName::WaitApproval, 0),
        Stage::new("stage-1", StageName::K8sPrimaryRollout, 1)
            .with_requires(vec!["stage-0".to_string()]),
    ];
    let d = deployment("d-1", &app, DeploymentStatus::Planned, stages);
    api.deployments.lock().insert(d.id.clone(), d.clone());

    let deps = scheduler_deps(api.clone(), executors, PlannerRegistry::default()).await;
    let status = DeploymentScheduler::new(deps, Arc::new(app), d, None, None)
        .run(CancellationToken::new())
        .await;

    assert_eq!(status, DeploymentStatus::Success);
    let metadata = api
        .stage_metadata
        .lock()
        .get(&("d-1".to_string(), "stage-0".to_string()))
        .cloned()
        .unwrap();
    assert_eq!(metadata.get(METADATA_APPROVED_BY).unwrap(), "alice");
    assert!(api.handled_commands.lock().contains(&"cmd-1".to_string()));
}

#[tokio::test]
async fn test_unapproved_stage_times_out_with_failure() {
    // executor-level: an approval that never arrives fails after the
    // configured timeout
    let api = Arc::new(FakeApiClient::default());
    let app = application("app-1", ApplicationKind::Kubernetes);
    let d = deployment(
        "d-1",
        &app,
        DeploymentStatus::Running,
        vec![Stage::new("stage-0", StageName::WaitApproval, 0)],
    );
    let deps = scheduler_deps(
        api.clone(),
        ExecutorRegistry::default(),
        PlannerRegistry::default(),
    )
    .await;

    let input = ExecutorInput {
        application: Arc::new(app),
        stage: d.stages[0].clone(),
        stage_options: None,
        // started longer ago than the 6h default timeout
        stage_started_at: Utc::now() - ChronoDuration::hours(7),
        deployment: Arc::new(d),
        target_source: None,
        running_source: None,
        cloud_provider: None,
        commands: deps.commands.clone(),
        log: StageLogPersister::new(api.clone(), "d-1", "stage-0", 0),
        metadata: MetadataStore::new(api.clone(), "d-1"),
        manifests_cache: deps.manifests_cache.clone(),
        tools: deps.tools.clone(),
    };
    let (_, signal) = crate::controller::stop_signal();
    let outcome = WaitApprovalExecutor.execute(&input, signal).await;
    assert_eq!(outcome, StageOutcome::Failure("approval timeout".to_string()));
}

#[tokio::test]
async fn test_unsupported_stage_fails_the_deployment() {
    let api = Arc::new(FakeApiClient::default());
    let app = application("app-1", ApplicationKind::Terraform);

    let stages = vec![Stage::new("stage-0", StageName::K8sSync, 0)];
    let d = deployment("d-1", &app, DeploymentStatus::Planned, stages);
    api.deployments.lock().insert(d.id.clone(), d.clone());

    let deps = scheduler_deps(
        api.clone(),
        ExecutorRegistry::default(),
        PlannerRegistry::default(),
    )
    .await;
    let status = DeploymentScheduler::new(deps, Arc::new(app), d, None, None)
        .run(CancellationToken::new())
        .await;

    assert_eq!(status, DeploymentStatus::Failure);
    let (_, reason) = api.completed_status("d-1").unwrap();
    assert_eq!(reason, "unsupported stage");
}

#[tokio::test]
async fn test_shutdown_marks_running_stage_cancelled_without_rollback() {
    let api = Arc::new(FakeApiClient::default());
    let app = application("app-1", ApplicationKind::Kubernetes);

    let mut executors = ExecutorRegistry::default();
    executors.register(
        ApplicationKind::Kubernetes,
        StageName::K8sPrimaryRollout,
        Arc::new(|| Box::new(GateExecutor)),
    );
    executors.register(
        ApplicationKind::Kubernetes,
        StageName::Rollback,
        Arc::new(|| Box::new(StaticExecutor(StageOutcome::Success))),
    );

    let stages = vec![
        Stage::new("stage-0", StageName::K8sPrimaryRollout, 0),
        rollback_stage(1),
    ];
    let d = deployment("d-1", &app, DeploymentStatus::Planned, stages);
    api.deployments.lock().insert(d.id.clone(), d.clone());

    let deps = scheduler_deps(api.clone(), executors, PlannerRegistry::default()).await;
    let shutdown = CancellationToken::new();
    let scheduler = DeploymentScheduler::new(deps, Arc::new(app), d, None, None);
    let task = tokio::spawn(scheduler.run(shutdown.clone()));

    // let the gate stage start, then shut the agent down
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    shutdown.cancel();
    let status = task.await.unwrap();

    assert!(!status.is_terminal());
    let history = api.stage_status_history("stage-0");
    assert_eq!(history.last(), Some(&StageStatus::Cancelled));
    let reports = api.stage_reports.lock();
    let (_, _, _, reason) = reports
        .iter()
        .rfind(|(_, id, _, _)| id == "stage-0")
        .unwrap();
    assert_eq!(reason, "agent shutdown");
    drop(reports);
    // no rollback, no terminal report
    assert!(api.stage_status_history("stage-rollback").is_empty());
    assert!(api.completed_status("d-1").is_none());
}
