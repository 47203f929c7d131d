//! # conveyor-core
//!
//! Core library for conveyor, a suite of CI-infrastructure binaries for a
//! multi-tenant build service.
//!
//! The crate provides the building blocks shared by the binaries:
//!
//! - **Step graph engine**: build, validate, order, and execute a DAG of
//!   build steps with per-step inputs and outputs ([`graph`], [`execute`],
//!   [`steps`])
//! - **Workspace identity**: deterministic input hashing that names the
//!   ephemeral execution namespace ([`inputs`])
//! - **Cluster and forge clients**: the typed API surface the binaries
//!   submit work through ([`cluster`], [`forge`], [`lease`])
//! - **Gating and schedule policy**: the pure decision logic behind the
//!   pipeline controller and the frequency reducer ([`gating`],
//!   [`schedule`])
//! - **Reporting**: censored artifacts, JUnit output, and reason-tagged
//!   results ([`artifacts`], [`junit`], [`censor`], [`results`])

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss
)]

pub mod artifacts;
pub mod censor;
pub mod cluster;
pub mod config;
pub mod execute;
pub mod forge;
pub mod gating;
pub mod graph;
pub mod inputs;
pub mod jobspec;
pub mod junit;
pub mod lease;
pub mod results;
pub mod schedule;
pub mod steps;

pub use censor::DynamicCensor;
pub use config::ReleaseBuildConfiguration;
pub use jobspec::JobSpec;
pub use results::OperatorError;
