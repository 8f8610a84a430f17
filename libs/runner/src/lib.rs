//! Core runtime of the piped agent.
//!
//! The agent is a set of long-lived components supervised under one
//! cancellation scope: stores caching control-plane entities, the trigger
//! that turns commits into deployments, the controller that drives each
//! deployment through its stage pipeline, the drift detector and the
//! side-channel reporters. Platform crates plug planners, executors, drift
//! providers and live-state stores into the registries defined here.

pub mod apistore;
pub mod cache;
pub mod controller;
pub mod deploysource;
pub mod drift;
pub mod error;
pub mod executor;
pub mod livestate;
pub mod metrics;
pub mod notifier;
pub mod planner;
pub mod statsreporter;
pub mod supervisor;
pub mod telemetry;
pub mod toolregistry;
pub mod trigger;

pub use controller::{
    ControllerOptions, DeploymentController, DeploymentScheduler, SchedulerDeps, StopSignal,
    StopSignalKind,
};
pub use deploysource::DeploySource;
pub use error::{Error, Result};
pub use executor::{Executor, ExecutorInput, ExecutorRegistry, StageOutcome};
pub use planner::{Plan, PlanInput, Planner, PlannerRegistry, SyncStrategy};
pub use supervisor::{Component, Supervisor};

#[cfg(test)]
mod controller_tests;
#[cfg(test)]
pub(crate) mod testutil;
