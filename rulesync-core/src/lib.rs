#![doc = "rulesync-core: reconciliation engine that keeps detection rules in sync between Kibana and Git."]

//! This crate holds the engine: rule documents and their filename codec, the
//! Kibana and Git provider adapters, the two-pass reconciler, the sync job
//! controller and the auto-sync scheduler.
//!
//! # Usage
//! Build a [`job::SyncController`] over a [`contract::JobStore`] and a
//! [`contract::ConnectorFactory`], then call
//! [`job::SyncController::trigger_sync`] or drive a [`scheduler::Scheduler`].

pub mod branch;
pub mod config;
pub mod contract;
pub mod elastic;
pub mod git;
mod http;
pub mod job;
pub mod lease;
pub mod model;
pub mod reconcile;
pub mod rule;
pub mod scheduler;
pub mod store;
