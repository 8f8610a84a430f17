use super::{Executor, ExecutorInput, StageOutcome};
use crate::controller::signal::StopSignal;

use piped_config::stage::WaitApprovalStageOptions;
use piped_config::StageOptions;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tracing::info;

pub const METADATA_APPROVED_BY: &str = "approved-by";

/// WAIT_APPROVAL: hold the pipeline until an approval command arrives from
/// an allowed approver, or fail once the configured timeout elapses.
pub struct WaitApprovalExecutor;

#[async_trait]
impl Executor for WaitApprovalExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let options = match &input.stage_options {
            Some(StageOptions::WaitApproval(options)) => options.clone(),
            None => WaitApprovalStageOptions::default(),
            Some(_) => {
                return StageOutcome::Failure(
                    "WAIT_APPROVAL stage received foreign options".to_string(),
                );
            }
        };

        if let Some(command) = input
            .commands
            .approval_command_for(&input.deployment.id, &input.stage.id)
        {
            let approver = command.commander.clone();
            if !options.approvers.is_empty() && !options.approvers.contains(&approver) {
                input.log.info(format!(
                    "Ignored approval from {approver:?}: not in the approvers list",
                ));
                // leave the command unhandled so an allowed approver can
                // still be recorded by the control plane view
            } else {
                if let Err(e) = input
                    .metadata
                    .save_stage(&input.stage.id, METADATA_APPROVED_BY, approver.clone())
                    .await
                {
                    input
                        .log
                        .error(format!("Failed to record approver: {e}"));
                    return StageOutcome::Exited;
                }
                if let Err(e) = input.commands.ack(&command, approval_metadata(&approver)).await {
                    input
                        .log
                        .error(format!("Failed to acknowledge approval command: {e}"));
                }
                info!(
                    msg = "stage was approved",
                    deployment = %input.deployment.id,
                    stage = %input.stage.id,
                    approver = %approver,
                );
                input.log.success(format!("Approved by {approver}"));
                return StageOutcome::Success;
            }
        }

        let elapsed = (Utc::now() - input.stage_started_at)
            .to_std()
            .unwrap_or_default();
        if elapsed >= options.timeout() {
            return StageOutcome::Failure("approval timeout".to_string());
        }
        StageOutcome::Exited
    }
}

fn approval_metadata(approver: &str) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert(METADATA_APPROVED_BY.to_string(), approver.to_string());
    metadata
}
