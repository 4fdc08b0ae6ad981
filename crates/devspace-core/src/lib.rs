// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Devspace Core - backend-neutral workspace model
//!
//! This crate holds everything the orchestration layer needs that does not depend on a
//! particular container backend or on cluster coordination:
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`environment`] | Environment Model: machines, servers, volumes, limits, recipes |
//! | [`identity`] | [`RuntimeIdentity`], the key of one running workspace instance |
//! | [`status`] | Workspace and machine lifecycle statuses |
//! | [`events`] | Typed publish/subscribe channels for lifecycle and permission events |
//! | [`permissions`] | ACL storage and the default-deny [`PermissionChecker`] |
//! | [`store`] | Activity records and the shared runtime status cache (memory, SQLite) |
//! | [`repository`] | Workspace configuration lookup |
//! | [`clock`] | Time source, with a manual clock for tests |
//! | [`error`] | Error taxonomy: validation, infrastructure, conflict, forbidden |
//!
//! # Lifecycle
//!
//! ```text
//!          start                 provision + start ok
//! STOPPED ───────▶ STARTING ─────────────────────────▶ RUNNING
//!    ▲                │                                   │
//!    │                │ failure                           │ stop / idle / run timeout
//!    │                ▼                                   ▼
//!    │              ERROR                             STOPPING
//!    └────────────────────────────────────────────────────┘
//!                          stop ok
//! ```

#![deny(missing_docs)]

/// Time source abstraction.
pub mod clock;
/// Environment Model.
pub mod environment;
/// Error taxonomy.
pub mod error;
/// Lifecycle and permission events.
pub mod events;
/// Runtime identity.
pub mod identity;
/// Permission storage and checking.
pub mod permissions;
/// Workspace configuration lookup.
pub mod repository;
/// Workspace and machine statuses.
pub mod status;
/// Activity and status stores.
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use environment::{Environment, MachineConfig, Recipe, ServerConfig, VolumeConfig, WorkspaceConfig};
pub use error::{InfrastructureError, Result, RuntimeError, ValidationError};
pub use events::EventBus;
pub use identity::RuntimeIdentity;
pub use permissions::{PermissionChecker, PermissionsManager, Subject};
pub use status::{MachineStatus, WorkspaceStatus};
