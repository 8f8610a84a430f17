//! Component supervision.
//!
//! Every long-lived part of the agent implements [`Component`] and runs as
//! an independent task under a shared cancellation scope. The first
//! component to return — with an error or not — cancels the scope so all
//! siblings unwind, and the supervisor reports the failure to the caller.

use crate::error::{Error, Result};

use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A long-lived part of the agent.
///
/// `run` must return only when the given scope is cancelled; returning
/// earlier is treated as a fatal condition by the supervisor.
#[async_trait]
pub trait Component: Send + 'static {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

pub struct Supervisor {
    components: Vec<Box<dyn Component>>,
    grace_period: Duration,
}

impl Supervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            components: Vec::new(),
            grace_period,
        }
    }

    pub fn register(&mut self, component: Box<dyn Component>) {
        self.components.push(component);
    }

    /// Run every component until the scope is cancelled or one of them
    /// fails. Returns the first failure, if any.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();
        for component in self.components {
            let name = component.name();
            let scope = shutdown.clone();
            info!(msg = "starting component", component = name);
            tasks.spawn(async move { (name, component.run(scope).await) });
        }

        let mut first_failure: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok((name, Ok(()))) => {
                    if shutdown.is_cancelled() {
                        info!(msg = "component stopped", component = name);
                        continue;
                    }
                    Error::ComponentExited(name)
                }
                Ok((name, Err(e))) => {
                    error!(msg = "component failed", component = name, err = %e);
                    e
                }
                Err(join_err) => Error::Internal(format!("component panicked: {join_err}")),
            };

            if first_failure.is_none() {
                first_failure = Some(failure);
                shutdown.cancel();
                // give the remaining components the grace period to unwind
                let deadline = tokio::time::Instant::now() + self.grace_period;
                while let Ok(Some(res)) =
                    tokio::time::timeout_at(deadline, tasks.join_next()).await
                {
                    if let Ok((name, Err(e))) = res {
                        warn!(msg = "component failed during shutdown", component = name, err = %e);
                    }
                }
                tasks.abort_all();
                break;
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WellBehaved;

    #[async_trait]
    impl Component for WellBehaved {
        fn name(&self) -> &'static str {
            "well-behaved"
        }

        async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
            shutdown.cancelled().await;
            Ok(())
        }
    }

    struct FailsFast;

    #[async_trait]
    impl Component for FailsFast {
        fn name(&self) -> &'static str {
            "fails-fast"
        }

        async fn run(self: Box<Self>, _shutdown: CancellationToken) -> Result<()> {
            Err(Error::Internal("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn test_clean_shutdown() {
        let mut supervisor = Supervisor::new(Duration::from_secs(1));
        supervisor.register(Box::new(WellBehaved));
        supervisor.register(Box::new(WellBehaved));

        let shutdown = CancellationToken::new();
        let scope = shutdown.clone();
        let handle = tokio::spawn(async move { supervisor.run(scope).await });
        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_first_failure_cancels_siblings() {
        let mut supervisor = Supervisor::new(Duration::from_secs(1));
        supervisor.register(Box::new(WellBehaved));
        supervisor.register(Box::new(FailsFast));

        let shutdown = CancellationToken::new();
        let result = supervisor.run(shutdown.clone()).await;
        assert!(result.is_err());
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_early_exit_is_fatal() {
        struct ExitsEarly;

        #[async_trait]
        impl Component for ExitsEarly {
            fn name(&self) -> &'static str {
                "exits-early"
            }

            async fn run(self: Box<Self>, _shutdown: CancellationToken) -> Result<()> {
                Ok(())
            }
        }

        let mut supervisor = Supervisor::new(Duration::from_secs(1));
        supervisor.register(Box::new(ExitsEarly));
        let result = supervisor.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::ComponentExited("exits-early"))));
    }
}
