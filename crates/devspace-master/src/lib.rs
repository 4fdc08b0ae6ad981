// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Devspace Master - workspace runtime orchestration
//!
//! Turns a backend-neutral [`Environment`](devspace_core::Environment) into running
//! containers on one of several infrastructures, keeps exactly one lifecycle in flight per
//! workspace across a cluster of master nodes, and stops idle workspaces.
//!
//! # Control flow
//!
//! ```text
//! start request
//!     │
//!     ▼
//! PermissionChecker ──denied──▶ Forbidden
//!     │
//!     ▼
//! StartSynchronizer ── cluster-wide write lock on the workspace id (bounded wait → Conflict)
//!     │
//!     ▼
//! Infrastructure::estimate ─▶ Infrastructure::prepare ─▶ RuntimeContext
//!     │                                                    │
//!     │                              provisioner pipeline ◀┘
//!     ▼
//! RuntimeContext::start ─▶ WorkspaceStarted event ─▶ activity tracking
//! ```
//!
//! The [`IdleChecker`](activity::IdleChecker) runs on its own schedule and stops idle
//! workspaces through the same locked stop path. The [`RuntimeMonitor`] cleans up
//! runtimes whose machines disappeared.
//!
//! # Infrastructures
//!
//! | Name | Recipe types | Backend |
//! |------|--------------|---------|
//! | `docker` | `dockerimage`, `compose` | local container engine CLI |
//! | `kubernetes` | `kubernetes` | `kubectl` |
//! | `openshift` | `openshift` | `oc`, with routes |
//! | `noop` | `noop` | nothing, for tests and demos |

#![deny(missing_docs)]

/// Activity tracking and idle checking.
pub mod activity;
/// Cluster membership, replication and the distributed lock service.
pub mod cluster;
/// Configuration loaded from environment variables.
pub mod config;
/// Runtime infrastructures and provisioner pipelines.
pub mod infrastructure;
/// Liveness monitoring of local runtimes.
pub mod monitor;
/// Embeddable master runtime.
pub mod runtime;
/// Workspace lifecycle service.
pub mod runtimes;
/// Per-workspace lifecycle serialization.
pub mod synchronizer;

pub use activity::{IdleChecker, IdleCheckerConfig, WorkspaceActivityManager};
pub use cluster::Cluster;
pub use infrastructure::{Infrastructure, InfrastructureRegistry, RuntimeContext};
pub use monitor::{RuntimeMonitor, RuntimeMonitorConfig};
pub use runtime::{MasterRuntime, MasterRuntimeBuilder};
pub use runtimes::{RuntimesConfig, StopOptions, WorkspaceRuntimes};
pub use synchronizer::StartSynchronizer;
