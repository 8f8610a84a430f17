//! Wiring of the agent process: configuration, the API client handshake,
//! the registries and every long-lived component under one supervisor.

use crate::admin::AdminServer;
use crate::PipedArgs;

use piped_api_client::rpc::{
    PipedCloudProviderMeta, PipedRepositoryMeta, ReportPipedMetaRequest,
};
use piped_api_client::{ApiClient, ClientConfig, HttpApiClient, RetryPolicy};
use piped_config::piped::CloudProviderType;
use piped_config::Config;
use piped_git::GitClient;
use piped_platform_kubernetes::{KubeApplier, KubernetesLiveStateStore, Loader};
use piped_runner::apistore::environment::DEFAULT_ENVIRONMENT_TTL;
use piped_runner::apistore::{
    ApplicationStore, CommandStore, DeploymentStore, EnvironmentStore, EventStore,
};
use piped_runner::cache::{SingleFlightCache, DEFAULT_MANIFESTS_CACHE_TTL};
use piped_runner::controller::{ControllerOptions, DeploymentController, SchedulerDeps};
use piped_runner::drift::{DriftDetector, DriftProviderRegistry, DEFAULT_DRIFT_INTERVAL};
use piped_runner::livestate::{
    LiveStateEventQueue, LiveStateReporter, DEFAULT_EVENT_QUEUE_CAPACITY,
};
use piped_runner::metrics::Metrics;
use piped_runner::notifier::{NotificationEvent, Notifier};
use piped_runner::statsreporter::{StatsReporter, DEFAULT_STATS_INTERVAL};
use piped_runner::supervisor::Supervisor;
use piped_runner::toolregistry::ToolRegistry;
use piped_runner::trigger::{Trigger, DEFAULT_TRIGGER_INTERVAL};
use piped_runner::{ExecutorRegistry, PlannerRegistry};

use anyhow::{bail, Context};
use clap::crate_version;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run(args: PipedArgs) -> anyhow::Result<()> {
    let config = piped_config::load_from_file(&args.common.config_file)
        .with_context(|| format!("load {}", args.common.config_file.display()))?;
    let Config::Piped(spec) = config else {
        bail!(
            "{} does not hold a Piped configuration",
            args.common.config_file.display()
        );
    };
    let spec = Arc::new(*spec);
    let piped_key = std::fs::read_to_string(&spec.piped_key_file)
        .with_context(|| format!("read piped key file {}", spec.piped_key_file))?
        .trim()
        .to_string();

    let metrics = Metrics::new();
    let api: Arc<dyn ApiClient> = Arc::new(HttpApiClient::new(ClientConfig {
        address: spec.api_address.clone(),
        project_id: spec.project_id.clone(),
        piped_id: spec.piped_id.clone(),
        piped_key,
        insecure: args.common.insecure,
        cert_file: args
            .common
            .cert_file
            .as_ref()
            .map(|p| p.display().to_string()),
        retry: RetryPolicy::default(),
    })?);

    // first dial: register this piped and what it manages
    api.report_piped_meta(ReportPipedMetaRequest {
        version: crate_version!().to_string(),
        repositories: spec
            .repositories
            .iter()
            .map(|r| PipedRepositoryMeta {
                repo_id: r.repo_id.clone(),
                remote: r.remote.clone(),
                branch: r.branch.clone(),
            })
            .collect(),
        cloud_providers: spec
            .cloud_providers
            .iter()
            .map(|p| PipedCloudProviderMeta {
                name: p.name.clone(),
                provider_type: format!("{:?}", p.provider_type).to_uppercase(),
            })
            .collect(),
        sealed_secret_encryption: spec.sealed_secret_management.is_some(),
    })
    .await
    .context("report piped meta to the control plane")?;
    info!(msg = "registered piped on the control plane", piped = %spec.piped_id);

    let base_dir = base_dir();
    let tools = Arc::new(
        args.tools_dir
            .clone()
            .map(ToolRegistry::new)
            .unwrap_or_else(|| ToolRegistry::new(ToolRegistry::default_dir())),
    );
    let git = Arc::new(GitClient::new(base_dir.join("repos")));

    let refresh = spec.sync_interval();
    let application_store = ApplicationStore::new(api.clone(), refresh, metrics.clone());
    let deployment_store = DeploymentStore::new(api.clone(), refresh, metrics.clone());
    let command_store = CommandStore::new(api.clone(), refresh, metrics.clone());
    let event_store = EventStore::new(api.clone(), refresh, metrics.clone());
    let environment_store = EnvironmentStore::new(api.clone(), DEFAULT_ENVIRONMENT_TTL);

    // populate the caches before anything consumes them
    if let Err(e) = application_store.sync_once().await {
        warn!(msg = "initial application sync failed, will retry", err = %e);
    }
    if let Err(e) = deployment_store.sync_once().await {
        warn!(msg = "initial deployment sync failed, will retry", err = %e);
    }

    let applications = application_store.lister();
    let deployments = deployment_store.lister();
    let commands = command_store.lister();

    let notifier = Notifier::new(spec.notifications.clone(), metrics.clone())
        .with_environments(environment_store.clone());
    let notifier_handle = notifier.handle();

    let mut executors = ExecutorRegistry::default();
    executors.register_generic_stages();
    let mut planners = PlannerRegistry::default();
    let mut drift_providers = DriftProviderRegistry::default();

    let livestate_queue = LiveStateEventQueue::new(DEFAULT_EVENT_QUEUE_CAPACITY, metrics.clone());
    let mut livestate_store: Option<KubernetesLiveStateStore> = None;

    let provider_types: HashSet<CloudProviderType> = spec
        .cloud_providers
        .iter()
        .map(|p| p.provider_type)
        .collect();

    if provider_types.contains(&CloudProviderType::Kubernetes) {
        let kube_config = kube::Config::infer()
            .await
            .context("infer kubernetes client configuration")?;
        let client = kube::Client::try_from(kube_config)
            .context("build kubernetes client")?;
        let applier = Arc::new(
            KubeApplier::new(client.clone())
                .await
                .context("discover kubernetes apis")?,
        );
        let loader = Arc::new(Loader::new(tools.clone()));
        let store = KubernetesLiveStateStore::new(client, livestate_queue.clone());
        let getter = Arc::new(store.getter());
        piped_platform_kubernetes::register(
            &mut executors,
            &mut planners,
            &mut drift_providers,
            loader,
            applier,
            getter,
        );
        livestate_store = Some(store);
    }
    if provider_types.contains(&CloudProviderType::Terraform) {
        piped_platform_terraform::register(
            &mut executors,
            &mut planners,
            &mut drift_providers,
            tools.clone(),
        );
    }
    if provider_types.contains(&CloudProviderType::CloudRun) {
        piped_platform_cloudrun::register(&mut executors, &mut planners, &mut drift_providers);
    }
    if provider_types.contains(&CloudProviderType::Lambda) {
        piped_platform_lambda::register(&mut executors, &mut planners, &mut drift_providers);
    }
    if provider_types.contains(&CloudProviderType::Ecs) {
        piped_platform_ecs::register(&mut executors, &mut planners, &mut drift_providers);
    }

    let deps = Arc::new(SchedulerDeps {
        api: api.clone(),
        commands: commands.clone(),
        executors: Arc::new(executors),
        planners: Arc::new(planners),
        metrics: metrics.clone(),
        notifier: notifier_handle.clone(),
        manifests_cache: Arc::new(SingleFlightCache::new(DEFAULT_MANIFESTS_CACHE_TTL)),
        tools: tools.clone(),
        cloud_providers: spec.cloud_providers.clone(),
        options: ControllerOptions::default(),
    });

    let controller = DeploymentController::new(
        deps,
        applications.clone(),
        deployments.clone(),
        git.clone(),
        spec.clone(),
        base_dir.join("workspace"),
    );
    let trigger = Trigger::new(
        api.clone(),
        applications.clone(),
        deployments.clone(),
        commands,
        git.clone(),
        spec.clone(),
        metrics.clone(),
        notifier_handle.clone(),
        DEFAULT_TRIGGER_INTERVAL,
    );
    let drift_detector = DriftDetector::new(
        api.clone(),
        applications,
        deployments,
        Arc::new(drift_providers),
        git,
        spec.clone(),
        metrics.clone(),
        notifier_handle.clone(),
        DEFAULT_DRIFT_INTERVAL,
    );
    let livestate_reporter = LiveStateReporter::new(api.clone(), livestate_queue);
    let stats_reporter = StatsReporter::new(
        api,
        spec.piped_id.clone(),
        metrics.clone(),
        DEFAULT_STATS_INTERVAL,
    );
    let admin = AdminServer::new(args.common.admin_port, crate_version!(), metrics);

    let mut supervisor = Supervisor::new(args.grace_period);
    supervisor.register(Box::new(application_store));
    supervisor.register(Box::new(deployment_store));
    supervisor.register(Box::new(command_store));
    supervisor.register(Box::new(event_store));
    supervisor.register(Box::new(environment_store));
    supervisor.register(Box::new(notifier));
    supervisor.register(Box::new(controller));
    supervisor.register(Box::new(trigger));
    supervisor.register(Box::new(drift_detector));
    if let Some(store) = livestate_store {
        supervisor.register(Box::new(store));
    }
    supervisor.register(Box::new(livestate_reporter));
    supervisor.register(Box::new(stats_reporter));
    supervisor.register(Box::new(admin));

    notifier_handle.publish(NotificationEvent::PipedStarted {
        version: crate_version!().to_string(),
    });

    let shutdown = CancellationToken::new();
    let signal_scope = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!(msg = "received termination signal");
        signal_scope.cancel();
    });

    supervisor.run(shutdown).await?;
    info!(msg = "piped stopped cleanly");
    Ok(())
}

fn base_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".piped")
}

pub async fn shutdown_signal() {
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM signal handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}
