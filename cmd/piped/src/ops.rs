//! The `ops` subcommand: control-plane housekeeping.
//!
//! Only the admin surface runs here; the housekeeping jobs (index ensurer,
//! orphan-command cleaner, insight collector) belong to the control-plane
//! deployment and are not part of the agent repository.

use crate::admin::AdminServer;
use crate::OpsArgs;

use piped_runner::metrics::Metrics;
use piped_runner::supervisor::Supervisor;

use clap::crate_version;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn run(args: OpsArgs) -> anyhow::Result<()> {
    let metrics = Metrics::new();
    let mut supervisor = Supervisor::new(args.grace_period);
    supervisor.register(Box::new(AdminServer::new(
        args.common.admin_port,
        crate_version!(),
        metrics,
    )));

    let shutdown = CancellationToken::new();
    let signal_scope = shutdown.clone();
    tokio::spawn(async move {
        crate::piped::shutdown_signal().await;
        info!(msg = "received termination signal");
        signal_scope.cancel();
    });

    supervisor.run(shutdown).await?;
    Ok(())
}
