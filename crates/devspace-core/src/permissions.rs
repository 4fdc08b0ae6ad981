// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Permission storage and checking.
//!
//! Permissions are stored per `(domain, instance)` as a user ACL and a group ACL. A user may
//! perform an action when any of these grants it:
//!
//! - the user's own entry,
//! - the entry of a group the user belongs to,
//! - the entry of the wildcard user [`WILDCARD`].
//!
//! Anything else is denied.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::ValidationError;
use crate::events::{EventBus, PermissionsAddedEvent, PermissionsRemovedEvent};

/// User id matching every user.
pub const WILDCARD: &str = "*";

/// Workspace domain id.
pub const WORKSPACE_DOMAIN: &str = "workspace";
/// System domain id.
pub const SYSTEM_DOMAIN: &str = "system";

/// Workspace actions.
pub mod actions {
    /// Read workspace configuration and status.
    pub const READ: &str = "read";
    /// Connect to a running workspace.
    pub const USE: &str = "use";
    /// Start and stop a workspace.
    pub const RUN: &str = "run";
    /// Change workspace configuration.
    pub const CONFIGURE: &str = "configure";
    /// Change workspace permissions.
    pub const SET_PERMISSIONS: &str = "setPermissions";
    /// Delete a workspace.
    pub const DELETE: &str = "delete";
    /// Administer the system.
    pub const MANAGE_SYSTEM: &str = "manageSystem";
    /// Observe the system.
    pub const MONITOR_SYSTEM: &str = "monitorSystem";
}

/// The caller of a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    /// User id.
    pub user_id: String,
}

impl Subject {
    /// Subject for a user id.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Who an ACL entry applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Grantee {
    /// A single user, or [`WILDCARD`].
    User(String),
    /// Every member of a group.
    Group(String),
}

/// One ACL entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    /// Permission domain.
    pub domain: String,
    /// Domain instance (workspace id); `None` for domains without instances.
    pub instance: Option<String>,
    /// Who is granted the actions.
    pub grantee: Grantee,
    /// Granted actions.
    pub actions: BTreeSet<String>,
}

impl Acl {
    /// Entry granting `actions` to a user.
    pub fn user(
        domain: impl Into<String>,
        instance: Option<&str>,
        user_id: impl Into<String>,
        actions: &[&str],
    ) -> Self {
        Self {
            domain: domain.into(),
            instance: instance.map(str::to_string),
            grantee: Grantee::User(user_id.into()),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Entry granting `actions` to a group.
    pub fn group(
        domain: impl Into<String>,
        instance: Option<&str>,
        group: impl Into<String>,
        actions: &[&str],
    ) -> Self {
        Self {
            domain: domain.into(),
            instance: instance.map(str::to_string),
            grantee: Grantee::Group(group.into()),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// A permission domain and the actions it allows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDomain {
    /// Domain id.
    pub id: String,
    /// Actions that may be stored for this domain.
    pub allowed_actions: BTreeSet<String>,
    /// Whether entries must name an instance.
    pub requires_instance: bool,
}

impl PermissionDomain {
    /// Create a domain.
    pub fn new(id: impl Into<String>, allowed_actions: &[&str], requires_instance: bool) -> Self {
        Self {
            id: id.into(),
            allowed_actions: allowed_actions.iter().map(|a| a.to_string()).collect(),
            requires_instance,
        }
    }

    /// The workspace domain.
    pub fn workspace() -> Self {
        Self::new(
            WORKSPACE_DOMAIN,
            &[
                actions::READ,
                actions::USE,
                actions::RUN,
                actions::CONFIGURE,
                actions::SET_PERMISSIONS,
                actions::DELETE,
            ],
            true,
        )
    }

    /// The system domain.
    pub fn system() -> Self {
        Self::new(
            SYSTEM_DOMAIN,
            &[actions::MANAGE_SYSTEM, actions::MONITOR_SYSTEM],
            false,
        )
    }

    fn validate(&self, acl: &Acl) -> Result<(), ValidationError> {
        match (&acl.instance, self.requires_instance) {
            (None, true) => {
                return Err(ValidationError::new(format!(
                    "Domain '{}' requires an instance",
                    self.id
                )));
            }
            (Some(_), false) => {
                return Err(ValidationError::new(format!(
                    "Domain '{}' doesn't support instances",
                    self.id
                )));
            }
            _ => {}
        }
        if let Some(action) = acl
            .actions
            .iter()
            .find(|a| !self.allowed_actions.contains(*a))
        {
            return Err(ValidationError::new(format!(
                "Domain '{}' doesn't support action '{}'",
                self.id, action
            )));
        }
        Ok(())
    }
}

/// Authorization gate consulted before lifecycle-mutating operations.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// Whether `user_id` may perform `action` on `(domain, instance)`.
    async fn has_permission(
        &self,
        user_id: &str,
        domain: &str,
        instance: Option<&str>,
        action: &str,
    ) -> bool;
}

type AclKey = (String, Option<String>);

#[derive(Default)]
struct State {
    domains: HashMap<String, PermissionDomain>,
    acls: HashMap<AclKey, BTreeMap<Grantee, BTreeSet<String>>>,
    groups: HashMap<String, HashSet<String>>,
}

/// In-memory ACL store implementing [`PermissionChecker`].
///
/// Changes publish [`PermissionsAddedEvent`] / [`PermissionsRemovedEvent`].
#[derive(Clone)]
pub struct PermissionsManager {
    state: Arc<RwLock<State>>,
    bus: EventBus,
}

impl PermissionsManager {
    /// Manager with the workspace and system domains registered.
    pub fn new(bus: EventBus) -> Self {
        let mut state = State::default();
        for domain in [PermissionDomain::workspace(), PermissionDomain::system()] {
            state.domains.insert(domain.id.clone(), domain);
        }
        Self {
            state: Arc::new(RwLock::new(state)),
            bus,
        }
    }

    /// Register an additional domain, replacing one with the same id.
    pub async fn register_domain(&self, domain: PermissionDomain) {
        self.state
            .write()
            .await
            .domains
            .insert(domain.id.clone(), domain);
    }

    /// Store an entry, replacing the grantee's previous actions for that instance.
    ///
    /// An entry with no actions removes the grantee's entry.
    pub async fn store(&self, acl: Acl, changed_by: Option<&str>) -> Result<(), ValidationError> {
        if acl.actions.is_empty() {
            self.remove(&acl.domain, acl.instance.as_deref(), &acl.grantee, changed_by)
                .await?;
            return Ok(());
        }
        {
            let mut state = self.state.write().await;
            let domain = state
                .domains
                .get(&acl.domain)
                .ok_or_else(|| ValidationError::new(format!("Unknown domain '{}'", acl.domain)))?;
            domain.validate(&acl)?;
            state
                .acls
                .entry((acl.domain.clone(), acl.instance.clone()))
                .or_default()
                .insert(acl.grantee.clone(), acl.actions.clone());
        }
        debug!(domain = %acl.domain, instance = ?acl.instance, grantee = ?acl.grantee, "Permissions stored");
        self.bus.permissions_added().publish(PermissionsAddedEvent {
            changed_by: changed_by.map(str::to_string),
            acl,
        });
        Ok(())
    }

    /// Remove a grantee's entry. Returns whether an entry existed.
    pub async fn remove(
        &self,
        domain: &str,
        instance: Option<&str>,
        grantee: &Grantee,
        changed_by: Option<&str>,
    ) -> Result<bool, ValidationError> {
        let removed = {
            let mut state = self.state.write().await;
            if !state.domains.contains_key(domain) {
                return Err(ValidationError::new(format!("Unknown domain '{}'", domain)));
            }
            let key = (domain.to_string(), instance.map(str::to_string));
            let removed = state
                .acls
                .get_mut(&key)
                .and_then(|entries| entries.remove(grantee));
            if state.acls.get(&key).is_some_and(|entries| entries.is_empty()) {
                state.acls.remove(&key);
            }
            removed
        };
        let Some(actions) = removed else {
            return Ok(false);
        };
        debug!(domain, instance = ?instance, grantee = ?grantee, "Permissions removed");
        self.bus.permissions_removed().publish(PermissionsRemovedEvent {
            changed_by: changed_by.map(str::to_string),
            acl: Acl {
                domain: domain.to_string(),
                instance: instance.map(str::to_string),
                grantee: grantee.clone(),
                actions,
            },
        });
        Ok(true)
    }

    /// Remove every entry of a domain instance, e.g. when a workspace is deleted.
    pub async fn remove_instance(&self, domain: &str, instance: &str) -> usize {
        let key = (domain.to_string(), Some(instance.to_string()));
        self.state
            .write()
            .await
            .acls
            .remove(&key)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// All entries of a domain instance.
    pub async fn entries(&self, domain: &str, instance: Option<&str>) -> Vec<Acl> {
        let key = (domain.to_string(), instance.map(str::to_string));
        let state = self.state.read().await;
        state
            .acls
            .get(&key)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(grantee, actions)| Acl {
                        domain: domain.to_string(),
                        instance: instance.map(str::to_string),
                        grantee: grantee.clone(),
                        actions: actions.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Add a user to a group.
    pub async fn add_group_member(&self, group: &str, user_id: &str) {
        self.state
            .write()
            .await
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    /// Remove a user from a group.
    pub async fn remove_group_member(&self, group: &str, user_id: &str) {
        if let Some(members) = self.state.write().await.groups.get_mut(group) {
            members.remove(user_id);
        }
    }
}

#[async_trait]
impl PermissionChecker for PermissionsManager {
    async fn has_permission(
        &self,
        user_id: &str,
        domain: &str,
        instance: Option<&str>,
        action: &str,
    ) -> bool {
        let state = self.state.read().await;
        let key = (domain.to_string(), instance.map(str::to_string));
        let Some(entries) = state.acls.get(&key) else {
            return false;
        };
        let grants = |grantee: &Grantee| {
            entries
                .get(grantee)
                .is_some_and(|actions| actions.contains(action))
        };

        if grants(&Grantee::User(user_id.to_string())) || grants(&Grantee::User(WILDCARD.to_string()))
        {
            return true;
        }
        state
            .groups
            .iter()
            .filter(|(_, members)| members.contains(user_id))
            .any(|(group, _)| grants(&Grantee::Group(group.clone())))
    }
}
