//! ember-resource — narrow clients for the three external control planes.
//!
//! The lifecycle state machine only ever needs a handful of verbs from
//! each control plane, so each is a small object-safe trait:
//!
//! ```text
//! ComputeScaler      set_capacity(n)       current_capacity()
//! ServiceController  set_desired_tasks(n)  running_tasks()
//! RouteController    attach()  detach()    is_attached()
//! ```
//!
//! Two implementations ship with the crate:
//!
//! - **`aws`** — shells out to the `aws` CLI (autoscaling group, ECS
//!   service, VPC route table) and classifies failures as transient or
//!   permanent from the CLI's error codes.
//! - **`memory`** — in-process simulation with scripted failures,
//!   confirmation lag, and a shared call journal. Used by tests and by
//!   `emberd --simulate`.

pub mod aws;
pub mod client;
pub mod memory;

pub use client::{ComputeScaler, ResourceClients, ResourceFuture, RouteController, ServiceController};
