use super::{Executor, ExecutorInput, StageOutcome};
use crate::controller::signal::StopSignal;

use piped_config::StageOptions;

use async_trait::async_trait;
use chrono::Utc;

/// WAIT: hold the pipeline for a fixed duration.
pub struct WaitExecutor;

#[async_trait]
impl Executor for WaitExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let duration = match &input.stage_options {
            Some(StageOptions::Wait(options)) => options.duration.as_duration(),
            _ => {
                return StageOutcome::Failure(
                    "WAIT stage requires a duration option".to_string(),
                );
            }
        };
        let elapsed = (Utc::now() - input.stage_started_at)
            .to_std()
            .unwrap_or_default();
        if elapsed >= duration {
            input.log.success(format!(
                "Waited for {}",
                humantime_format(duration)
            ));
            StageOutcome::Success
        } else {
            StageOutcome::Exited
        }
    }
}

fn humantime_format(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_humantime_format() {
        assert_eq!(humantime_format(std::time::Duration::from_secs(45)), "45s");
        assert_eq!(humantime_format(std::time::Duration::from_secs(90)), "1m30s");
        assert_eq!(
            humantime_format(std::time::Duration::from_secs(3660)),
            "1h1m"
        );
    }
}
