#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! direktiv functions controller
//!
//! Materializes logical function definitions as autoscaling serving revisions
//! on the cluster, schedules one-shot executions under per-namespace caps,
//! and streams reconciled state back to the workflow engine. All durable
//! state lives in the cluster API; this process holds only watches, a gauge,
//! and advisory locks.

pub mod build;
pub mod config;
pub mod functions;
pub mod grpc;
pub mod k8s;
pub mod registry;
pub mod scheduler;
pub mod view;

pub use self::{
    build::Builder, config::Config, functions::Manager, grpc::Server, registry::Registry,
    scheduler::Scheduler,
};
