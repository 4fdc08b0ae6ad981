// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspace lifecycle service.
//!
//! [`WorkspaceRuntimes`] drives starts and stops. Every transition runs under the
//! workspace lock of the [`StartSynchronizer`]; only the lock holder writes the shared
//! [`RuntimeStatusCache`], and status queries read that cache without locking.
//!
//! A stop issued while a start of the same workspace is in flight cancels the start
//! first; the start then fails with [`InfrastructureError::Interrupted`] and the stop
//! completes once it gets the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use devspace_core::events::{
    BusEvent, RuntimeAbnormalStopEvent, WorkspaceStartedEvent, WorkspaceStatusEvent,
    WorkspaceStoppedEvent, WorkspaceStoppingEvent,
};
use devspace_core::permissions::{WORKSPACE_DOMAIN, actions};
use devspace_core::repository::WorkspaceRepository;
use devspace_core::status::Machine;
use devspace_core::store::{RuntimeStatusCache, RuntimeStatusRecord};
use devspace_core::{
    InfrastructureError, PermissionChecker, Result, RuntimeError, RuntimeIdentity, Subject,
    WorkspaceStatus,
};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::WorkspaceActivityManager;
use crate::cluster::Cluster;
use crate::infrastructure::{Infrastructure, InfrastructureRegistry, RuntimeContext};
use crate::synchronizer::{LifecycleOperation, StartSynchronizer};

/// Lifecycle settings.
#[derive(Debug, Clone)]
pub struct RuntimesConfig {
    /// Deadline for prepare, provision and start together.
    pub start_timeout: Duration,
}

impl Default for RuntimesConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(300),
        }
    }
}

/// Who stopped a workspace and why.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Initiator (user id or system component).
    pub stopped_by: Option<String>,
    /// Human readable reason.
    pub reason: Option<String>,
}

impl StopOptions {
    /// Stop initiated by `stopped_by` for `reason`.
    pub fn new(stopped_by: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stopped_by: Some(stopped_by.into()),
            reason: Some(reason.into()),
        }
    }
}

/// Workspace lifecycle service.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct WorkspaceRuntimes {
    synchronizer: StartSynchronizer,
    registry: Arc<InfrastructureRegistry>,
    repository: Arc<dyn WorkspaceRepository>,
    permissions: Arc<dyn PermissionChecker>,
    statuses: Arc<dyn RuntimeStatusCache>,
    activity: WorkspaceActivityManager,
    config: RuntimesConfig,
    contexts: Arc<AsyncMutex<HashMap<String, RuntimeContext>>>,
    starting: Arc<Mutex<HashMap<String, CancellationToken>>>,
    refusing: Arc<AtomicBool>,
}

impl WorkspaceRuntimes {
    /// Lifecycle service over its collaborators.
    pub fn new(
        synchronizer: StartSynchronizer,
        registry: InfrastructureRegistry,
        repository: Arc<dyn WorkspaceRepository>,
        permissions: Arc<dyn PermissionChecker>,
        statuses: Arc<dyn RuntimeStatusCache>,
        activity: WorkspaceActivityManager,
        config: RuntimesConfig,
    ) -> Self {
        Self {
            synchronizer,
            registry: Arc::new(registry),
            repository,
            permissions,
            statuses,
            activity,
            config,
            contexts: Arc::default(),
            starting: Arc::default(),
            refusing: Arc::new(AtomicBool::new(false)),
        }
    }

    fn cluster(&self) -> &Cluster {
        self.synchronizer.cluster()
    }

    fn starting(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.starting.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registered infrastructures.
    pub fn registry(&self) -> &InfrastructureRegistry {
        &self.registry
    }

    /// Activity manager fed by this service.
    pub fn activity(&self) -> &WorkspaceActivityManager {
        &self.activity
    }

    /// Synchronizer serializing this service's transitions.
    pub fn synchronizer(&self) -> &StartSynchronizer {
        &self.synchronizer
    }

    async fn require(&self, subject: &Subject, workspace_id: &str, action: &str) -> Result<()> {
        if self
            .permissions
            .has_permission(&subject.user_id, WORKSPACE_DOMAIN, Some(workspace_id), action)
            .await
        {
            return Ok(());
        }
        warn!(user_id = %subject.user_id, workspace_id, action, "Permission denied");
        Err(RuntimeError::Forbidden(format!(
            "User '{}' is not allowed to {} workspace '{}'",
            subject.user_id, action, workspace_id
        )))
    }

    async fn put_status(
        &self,
        identity: &RuntimeIdentity,
        status: WorkspaceStatus,
        prev_status: Option<WorkspaceStatus>,
        error: Option<String>,
        stopped_by: Option<String>,
    ) -> Result<()> {
        self.statuses
            .put_status(RuntimeStatusRecord {
                identity: identity.clone(),
                status,
                error: error.clone(),
                owner_node: Some(self.cluster().node_id().to_string()),
                updated_at: Utc::now(),
            })
            .await?;
        self.publish_status(&identity.workspace_id, status, prev_status, error, stopped_by)
            .await;
        Ok(())
    }

    async fn publish_status(
        &self,
        workspace_id: &str,
        status: WorkspaceStatus,
        prev_status: Option<WorkspaceStatus>,
        error: Option<String>,
        stopped_by: Option<String>,
    ) {
        self.cluster()
            .publish(BusEvent::Status(WorkspaceStatusEvent {
                workspace_id: workspace_id.to_string(),
                status,
                prev_status,
                error,
                stopped_by,
            }))
            .await;
    }

    async fn infrastructure_for(&self, identity: &RuntimeIdentity) -> Option<Arc<Infrastructure>> {
        let workspace = self.repository.get(&identity.workspace_id).await?;
        let (_, environment) = workspace.environment(Some(&identity.env_name))?;
        self.registry
            .for_recipe(&environment.recipe.recipe_type)
            .cloned()
    }

    /// Idle timeout of a workspace, the configured default if it sets none.
    pub async fn idle_timeout(&self, workspace_id: &str) -> Duration {
        let override_secs = self
            .repository
            .get(workspace_id)
            .await
            .and_then(|w| w.idle_timeout_secs);
        self.activity.idle_timeout_for(override_secs)
    }

    /// Make every further start fail with [`RuntimeError::Conflict`].
    pub fn refuse_start(&self) {
        self.refusing.store(true, Ordering::SeqCst);
        info!("Refusing new workspace starts");
    }

    /// Whether starts are refused.
    pub fn is_refusing_start(&self) -> bool {
        self.refusing.load(Ordering::SeqCst)
    }

    /// Start `env_name` (or the default environment) of a workspace on behalf of `subject`.
    pub async fn start_workspace(
        &self,
        subject: &Subject,
        workspace_id: &str,
        env_name: Option<&str>,
    ) -> Result<RuntimeIdentity> {
        self.require(subject, workspace_id, actions::RUN).await?;
        if self.is_refusing_start() {
            return Err(RuntimeError::Conflict(format!(
                "Start of workspace '{workspace_id}' refused, node is shutting down"
            )));
        }

        let workspace = self
            .repository
            .get(workspace_id)
            .await
            .ok_or_else(|| RuntimeError::NotFound(format!("Workspace '{workspace_id}'")))?;
        let (env_name, environment) = workspace.environment(env_name).ok_or_else(|| {
            RuntimeError::NotFound(format!(
                "Environment '{}' of workspace '{}'",
                env_name.unwrap_or(&workspace.default_env),
                workspace_id
            ))
        })?;
        let recipe_type = environment.recipe.recipe_type.as_str();
        let infrastructure = self.registry.for_recipe(recipe_type).cloned().ok_or_else(|| {
            RuntimeError::NotFound(format!(
                "No infrastructure supports recipe type '{recipe_type}'"
            ))
        })?;
        let identity = RuntimeIdentity::new(
            workspace_id,
            env_name,
            workspace.owner_id.clone(),
            workspace.namespace.clone(),
        );
        let idle_timeout = self.activity.idle_timeout_for(workspace.idle_timeout_secs);

        self.synchronizer
            .with_workspace_lock(workspace_id, LifecycleOperation::Start, || {
                self.start_locked(&infrastructure, &identity, environment, idle_timeout)
            })
            .await?;
        Ok(identity)
    }

    async fn start_locked(
        &self,
        infrastructure: &Infrastructure,
        identity: &RuntimeIdentity,
        environment: &devspace_core::Environment,
        idle_timeout: Duration,
    ) -> Result<()> {
        let workspace_id = identity.workspace_id.as_str();
        let previous = self.statuses.get_status(workspace_id).await?;
        match previous.as_ref().map(|r| r.status) {
            Some(WorkspaceStatus::Running) => {
                return Err(RuntimeError::Conflict(format!(
                    "Workspace '{workspace_id}' is already running"
                )));
            }
            Some(status) if status.is_transitional() => {
                warn!(workspace_id, status = %status, "Discarding stale transitional status");
            }
            _ => {}
        }
        let normalized = infrastructure.estimate(environment)?;

        let cancel = CancellationToken::new();
        self.starting()
            .insert(workspace_id.to_string(), cancel.clone());
        let started = self
            .run_start(infrastructure, identity, &normalized, &cancel, previous, idle_timeout)
            .await;
        self.starting().remove(workspace_id);
        started
    }

    async fn run_start(
        &self,
        infrastructure: &Infrastructure,
        identity: &RuntimeIdentity,
        environment: &devspace_core::Environment,
        cancel: &CancellationToken,
        previous: Option<RuntimeStatusRecord>,
        idle_timeout: Duration,
    ) -> Result<()> {
        let workspace_id = identity.workspace_id.as_str();
        info!(
            workspace_id,
            env_name = %identity.env_name,
            infrastructure = infrastructure.name(),
            "Starting workspace"
        );
        self.put_status(
            identity,
            WorkspaceStatus::Starting,
            Some(previous.map_or(WorkspaceStatus::Stopped, |r| r.status)),
            None,
            None,
        )
        .await?;
        self.activity.on_starting(workspace_id, idle_timeout).await?;

        let deadline = self.config.start_timeout;
        let outcome = tokio::time::timeout(deadline, async {
            let mut context = infrastructure.prepare(identity, environment).await?;
            context.provision()?;
            context.start(cancel).await?;
            Ok::<_, InfrastructureError>(context)
        })
        .await
        .unwrap_or(Err(InfrastructureError::Timeout(deadline)));

        match outcome {
            Ok(context) => {
                let machines = context.machines().len();
                self.contexts
                    .lock()
                    .await
                    .insert(workspace_id.to_string(), context);
                self.put_status(
                    identity,
                    WorkspaceStatus::Running,
                    Some(WorkspaceStatus::Starting),
                    None,
                    None,
                )
                .await?;
                self.cluster()
                    .publish(BusEvent::Started(WorkspaceStartedEvent {
                        identity: identity.clone(),
                    }))
                    .await;
                self.activity.on_running(workspace_id, idle_timeout).await?;
                info!(workspace_id, machines, "Workspace started");
                Ok(())
            }
            Err(InfrastructureError::Interrupted(_)) => {
                info!(workspace_id, "Workspace start interrupted by stop");
                self.statuses.remove_status(workspace_id).await?;
                self.activity.on_stopped(workspace_id).await?;
                self.publish_status(
                    workspace_id,
                    WorkspaceStatus::Stopped,
                    Some(WorkspaceStatus::Starting),
                    None,
                    None,
                )
                .await;
                Err(InfrastructureError::Interrupted(workspace_id.to_string()).into())
            }
            Err(e) => {
                error!(workspace_id, error = %e, "Workspace start failed");
                if matches!(e, InfrastructureError::Timeout(_))
                    && let Err(cleanup) = infrastructure.context_for(identity).stop().await
                {
                    warn!(workspace_id, error = %cleanup, "Failed to clean up timed out start");
                }
                self.activity.on_stopped(workspace_id).await?;
                self.put_status(
                    identity,
                    WorkspaceStatus::Error,
                    Some(WorkspaceStatus::Starting),
                    Some(e.to_string()),
                    None,
                )
                .await?;
                Err(e.into())
            }
        }
    }

    /// Stop a workspace on behalf of `subject`.
    pub async fn stop_workspace(
        &self,
        subject: &Subject,
        workspace_id: &str,
        mut options: StopOptions,
    ) -> Result<()> {
        self.require(subject, workspace_id, actions::RUN).await?;
        options
            .stopped_by
            .get_or_insert_with(|| subject.user_id.clone());
        self.system_stop(workspace_id, options).await
    }

    /// Stop a workspace without a permission check. For system components such as the
    /// idle checker.
    pub async fn system_stop(&self, workspace_id: &str, options: StopOptions) -> Result<()> {
        let interrupted = match self.starting().get(workspace_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        };
        if interrupted {
            info!(workspace_id, "Interrupting in-flight start");
        }
        self.synchronizer
            .with_workspace_lock(workspace_id, LifecycleOperation::Stop, || {
                self.stop_locked(workspace_id, &options, interrupted)
            })
            .await
    }

    async fn stop_locked(
        &self,
        workspace_id: &str,
        options: &StopOptions,
        interrupted: bool,
    ) -> Result<()> {
        let Some(record) = self.statuses.get_status(workspace_id).await? else {
            if interrupted {
                self.publish_stopped(workspace_id, options, None).await;
                return Ok(());
            }
            return Err(RuntimeError::NotFound(format!(
                "Workspace '{workspace_id}' is not running"
            )));
        };
        let identity = record.identity.clone();
        info!(
            workspace_id,
            stopped_by = ?options.stopped_by,
            reason = ?options.reason,
            "Stopping workspace"
        );
        self.put_status(
            &identity,
            WorkspaceStatus::Stopping,
            Some(record.status),
            None,
            options.stopped_by.clone(),
        )
        .await?;
        self.cluster()
            .publish(BusEvent::Stopping(WorkspaceStoppingEvent {
                workspace_id: workspace_id.to_string(),
                stopped_by: options.stopped_by.clone(),
                reason: options.reason.clone(),
            }))
            .await;
        self.activity.on_stopping(workspace_id).await?;

        let local = self.contexts.lock().await.remove(workspace_id);
        let mut context = match local {
            Some(context) => context,
            None => match self.infrastructure_for(&identity).await {
                Some(infrastructure) => infrastructure.context_for(&identity),
                None => {
                    let message = format!(
                        "No infrastructure found for environment '{}' of workspace '{}'",
                        identity.env_name, workspace_id
                    );
                    self.fail_stop(&identity, options, &message).await?;
                    return Err(InfrastructureError::Internal(message).into());
                }
            },
        };

        match context.stop().await {
            Ok(()) => {
                self.statuses.remove_status(workspace_id).await?;
                self.activity.on_stopped(workspace_id).await?;
                self.publish_status(
                    workspace_id,
                    WorkspaceStatus::Stopped,
                    Some(WorkspaceStatus::Stopping),
                    None,
                    options.stopped_by.clone(),
                )
                .await;
                self.publish_stopped(workspace_id, options, None).await;
                info!(workspace_id, "Workspace stopped");
                Ok(())
            }
            Err(e) => {
                error!(workspace_id, error = %e, "Workspace stop failed");
                self.contexts
                    .lock()
                    .await
                    .insert(workspace_id.to_string(), context);
                self.fail_stop(&identity, options, &e.to_string()).await?;
                Err(e.into())
            }
        }
    }

    async fn fail_stop(
        &self,
        identity: &RuntimeIdentity,
        options: &StopOptions,
        message: &str,
    ) -> Result<()> {
        self.activity.on_stop_failed(&identity.workspace_id).await?;
        self.put_status(
            identity,
            WorkspaceStatus::Error,
            Some(WorkspaceStatus::Stopping),
            Some(message.to_string()),
            options.stopped_by.clone(),
        )
        .await
    }

    async fn publish_stopped(&self, workspace_id: &str, options: &StopOptions, error: Option<String>) {
        self.cluster()
            .publish(BusEvent::Stopped(WorkspaceStoppedEvent {
                workspace_id: workspace_id.to_string(),
                stopped_by: options.stopped_by.clone(),
                reason: options.reason.clone(),
                error,
            }))
            .await;
    }

    /// Last published status of a workspace; `Stopped` when none exists.
    ///
    /// Takes only the advisory read lock, so it never waits for an in-flight transition
    /// and may return the state from before it.
    pub async fn get_status(&self, workspace_id: &str) -> Result<WorkspaceStatus> {
        let _read = self.cluster().locks().read_lock(workspace_id);
        Ok(self
            .statuses
            .get_status(workspace_id)
            .await?
            .map_or(WorkspaceStatus::Stopped, |r| r.status))
    }

    /// Last published snapshot of a workspace.
    pub async fn get_runtime(&self, workspace_id: &str) -> Result<Option<RuntimeStatusRecord>> {
        let _read = self.cluster().locks().read_lock(workspace_id);
        Ok(self.statuses.get_status(workspace_id).await?)
    }

    /// Every published snapshot.
    pub async fn list_runtimes(&self) -> Result<Vec<RuntimeStatusRecord>> {
        Ok(self.statuses.list_statuses().await?)
    }

    /// Machines of a runtime started or recovered on this node.
    pub async fn machines(&self, workspace_id: &str) -> Vec<Machine> {
        self.contexts
            .lock()
            .await
            .get(workspace_id)
            .map(RuntimeContext::machines)
            .unwrap_or_default()
    }

    /// Re-register runtimes that are running on the backends. Returns how many were
    /// recovered.
    pub async fn recover(&self) -> usize {
        let mut recovered = 0;
        for infrastructure in self.registry.all() {
            let identities = match infrastructure.identities().await {
                Ok(identities) => identities,
                Err(e) => {
                    warn!(infrastructure = infrastructure.name(), error = %e, "Failed to list running runtimes");
                    continue;
                }
            };
            for identity in identities {
                let result = self
                    .synchronizer
                    .with_workspace_lock(&identity.workspace_id, LifecycleOperation::Start, || {
                        self.recover_locked(infrastructure, &identity)
                    })
                    .await;
                match result {
                    Ok(true) => recovered += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(workspace_id = %identity.workspace_id, error = %e, "Failed to recover runtime");
                    }
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "Recovered running workspaces");
        }
        recovered
    }

    async fn recover_locked(
        &self,
        infrastructure: &Infrastructure,
        identity: &RuntimeIdentity,
    ) -> Result<bool> {
        let workspace_id = identity.workspace_id.as_str();
        let previous = self.statuses.get_status(workspace_id).await?;
        if previous
            .as_ref()
            .is_some_and(|r| r.status == WorkspaceStatus::Running)
        {
            return Ok(false);
        }
        self.contexts
            .lock()
            .await
            .insert(workspace_id.to_string(), infrastructure.context_for(identity));
        self.put_status(
            identity,
            WorkspaceStatus::Running,
            previous.map(|r| r.status),
            None,
            None,
        )
        .await?;
        self.activity
            .on_running(workspace_id, self.idle_timeout(workspace_id).await)
            .await?;
        debug!(workspace_id, infrastructure = infrastructure.name(), "Runtime recovered");
        Ok(true)
    }

    /// A runtime died outside of an explicit stop. Cleans up what is left and publishes a
    /// stopped status carrying `reason`.
    pub async fn handle_abnormal_stop(&self, identity: &RuntimeIdentity, reason: &str) -> Result<()> {
        self.synchronizer
            .with_workspace_lock(&identity.workspace_id, LifecycleOperation::Stop, || {
                self.abnormal_stop_locked(identity, reason)
            })
            .await
    }

    async fn abnormal_stop_locked(&self, identity: &RuntimeIdentity, reason: &str) -> Result<()> {
        let workspace_id = identity.workspace_id.as_str();
        let record = self.statuses.get_status(workspace_id).await?;
        if !record
            .as_ref()
            .is_some_and(|r| r.status == WorkspaceStatus::Running)
        {
            return Ok(());
        }
        warn!(workspace_id, reason, "Runtime stopped abnormally");
        let context = self.contexts.lock().await.remove(workspace_id);
        if let Some(mut context) = context
            && let Err(e) = context.stop().await
        {
            warn!(workspace_id, error = %e, "Failed to clean up abnormally stopped runtime");
        }
        self.statuses.remove_status(workspace_id).await?;
        self.activity.on_stopped(workspace_id).await?;
        self.cluster()
            .bus()
            .abnormal_stop()
            .publish(RuntimeAbnormalStopEvent {
                identity: identity.clone(),
                reason: reason.to_string(),
            });
        self.publish_status(
            workspace_id,
            WorkspaceStatus::Stopped,
            Some(WorkspaceStatus::Running),
            Some(reason.to_string()),
            None,
        )
        .await;
        self.publish_stopped(workspace_id, &StopOptions::default(), Some(reason.to_string()))
            .await;
        Ok(())
    }

    /// Check runtimes held by this node and clean up the ones whose machines are gone.
    /// Returns the ids of the runtimes found dead.
    pub async fn check_local_runtimes(&self) -> Vec<String> {
        let mut dead = Vec::new();
        {
            let contexts = self.contexts.lock().await;
            for (workspace_id, context) in contexts.iter() {
                match context.is_alive().await {
                    Ok(true) => {}
                    Ok(false) => dead.push(context.identity().clone()),
                    Err(e) => {
                        debug!(workspace_id = %workspace_id, error = %e, "Liveness check failed");
                    }
                }
            }
        }
        let mut ids = Vec::with_capacity(dead.len());
        for identity in dead {
            match self
                .handle_abnormal_stop(&identity, "Runtime machines are no longer running")
                .await
            {
                Ok(()) => ids.push(identity.workspace_id),
                Err(e) => {
                    warn!(workspace_id = %identity.workspace_id, error = %e, "Failed to handle abnormal stop");
                }
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityConfig;
    use crate::infrastructure::NoOpInfrastructure;
    use devspace_core::permissions::{Acl, PermissionsManager};
    use devspace_core::repository::InMemoryWorkspaceRepository;
    use devspace_core::store::InMemoryStore;
    use devspace_core::{
        Environment, EventBus, MachineConfig, Recipe, SystemClock, WorkspaceConfig,
    };
    use std::collections::BTreeMap;

    struct Fixture {
        runtimes: WorkspaceRuntimes,
        noop: NoOpInfrastructure,
        permissions: PermissionsManager,
        bus: EventBus,
    }

    fn workspace(id: &str) -> WorkspaceConfig {
        WorkspaceConfig {
            id: id.to_string(),
            name: id.to_string(),
            namespace: "alice".into(),
            owner_id: "alice".into(),
            default_env: "default".into(),
            environments: BTreeMap::from([(
                "default".to_string(),
                Environment::new(Recipe::of_type("noop"))
                    .machine("dev", MachineConfig::with_image("x")),
            )]),
            attributes: BTreeMap::new(),
            idle_timeout_secs: None,
        }
    }

    async fn fixture(start_delay: Duration) -> Fixture {
        fixture_with(NoOpInfrastructure::new(start_delay)).await
    }

    async fn fixture_with(noop: NoOpInfrastructure) -> Fixture {
        let bus = EventBus::default();
        let cluster = Cluster::single_node("n1", bus.clone());
        let mut registry = InfrastructureRegistry::new();
        registry.register(Infrastructure::NoOp(noop.clone()));

        let repository = InMemoryWorkspaceRepository::new();
        repository.put(workspace("w1")).await;
        let permissions = PermissionsManager::new(bus.clone());
        permissions
            .store(
                Acl::user(WORKSPACE_DOMAIN, Some("w1"), "alice", &[actions::RUN]),
                None,
            )
            .await
            .unwrap();

        let store = Arc::new(InMemoryStore::new());
        let activity =
            WorkspaceActivityManager::new(store.clone(), Arc::new(SystemClock), ActivityConfig::default());
        let runtimes = WorkspaceRuntimes::new(
            StartSynchronizer::new(cluster, Duration::from_secs(5)),
            registry,
            Arc::new(repository),
            Arc::new(permissions.clone()),
            store,
            activity,
            RuntimesConfig::default(),
        );
        Fixture {
            runtimes,
            noop,
            permissions,
            bus,
        }
    }

    fn alice() -> Subject {
        Subject::new("alice")
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let f = fixture(Duration::ZERO).await;
        let mut started = f.bus.started().subscribe();
        let mut stopped = f.bus.stopped().subscribe();

        let identity = f.runtimes.start_workspace(&alice(), "w1", None).await.unwrap();
        assert_eq!(identity.env_name, "default");
        assert_eq!(f.runtimes.get_status("w1").await.unwrap(), WorkspaceStatus::Running);
        assert_eq!(started.recv().await.unwrap().identity, identity);
        assert_eq!(f.runtimes.machines("w1").await.len(), 1);

        f.runtimes
            .stop_workspace(&alice(), "w1", StopOptions::default())
            .await
            .unwrap();
        assert_eq!(f.runtimes.get_status("w1").await.unwrap(), WorkspaceStatus::Stopped);
        assert_eq!(stopped.recv().await.unwrap().stopped_by.as_deref(), Some("alice"));
        assert!(f.noop.identities().is_empty());
    }

    #[tokio::test]
    async fn test_denied_start_changes_nothing() {
        let f = fixture(Duration::ZERO).await;
        let err = f
            .runtimes
            .start_workspace(&Subject::new("mallory"), "w1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Forbidden(_)));
        assert!(f.runtimes.list_runtimes().await.unwrap().is_empty());
        assert!(f.noop.identities().is_empty());
    }

    #[tokio::test]
    async fn test_second_start_conflicts() {
        let f = fixture(Duration::ZERO).await;
        f.runtimes.start_workspace(&alice(), "w1", None).await.unwrap();
        let err = f.runtimes.start_workspace(&alice(), "w1", None).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_unknown_workspace_and_environment() {
        let f = fixture(Duration::ZERO).await;
        f.permissions
            .store(Acl::user(WORKSPACE_DOMAIN, Some("nope"), "alice", &[actions::RUN]), None)
            .await
            .unwrap();
        let err = f.runtimes.start_workspace(&alice(), "nope", None).await.unwrap_err();
        assert!(err.is_not_found());
        let err = f
            .runtimes
            .start_workspace(&alice(), "w1", Some("missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_stop_of_stopped_workspace_is_not_found() {
        let f = fixture(Duration::ZERO).await;
        let err = f
            .runtimes
            .system_stop("w1", StopOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_stop_interrupts_start() {
        let f = fixture(Duration::from_secs(30)).await;
        let mut stopped = f.bus.stopped().subscribe();
        let start = {
            let runtimes = f.runtimes.clone();
            tokio::spawn(async move { runtimes.start_workspace(&alice(), "w1", None).await })
        };
        while f.runtimes.get_status("w1").await.unwrap() != WorkspaceStatus::Starting {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        f.runtimes
            .stop_workspace(&alice(), "w1", StopOptions::default())
            .await
            .unwrap();
        let err = start.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Infrastructure(InfrastructureError::Interrupted(_))
        ));
        assert_eq!(f.runtimes.get_status("w1").await.unwrap(), WorkspaceStatus::Stopped);
        assert!(stopped.recv().await.is_ok());
        assert!(stopped.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_refuse_start() {
        let f = fixture(Duration::ZERO).await;
        f.runtimes.refuse_start();
        let err = f.runtimes.start_workspace(&alice(), "w1", None).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_killed_runtime_is_cleaned_up() {
        let f = fixture(Duration::ZERO).await;
        let mut abnormal = f.bus.abnormal_stop().subscribe();
        f.runtimes.start_workspace(&alice(), "w1", None).await.unwrap();
        assert!(f.runtimes.check_local_runtimes().await.is_empty());

        assert!(f.noop.kill("w1"));
        assert_eq!(f.runtimes.check_local_runtimes().await, vec!["w1".to_string()]);
        assert_eq!(f.runtimes.get_status("w1").await.unwrap(), WorkspaceStatus::Stopped);
        assert_eq!(abnormal.recv().await.unwrap().identity.workspace_id, "w1");
    }

    #[tokio::test]
    async fn test_recover_running_runtimes() {
        let f = fixture(Duration::ZERO).await;
        f.runtimes.start_workspace(&alice(), "w1", None).await.unwrap();

        // A fresh service over the same backend, as after a restart.
        let g = fixture_with(f.noop.clone()).await;
        assert_eq!(g.runtimes.get_status("w1").await.unwrap(), WorkspaceStatus::Stopped);
        assert_eq!(g.runtimes.recover().await, 1);
        assert_eq!(g.runtimes.get_status("w1").await.unwrap(), WorkspaceStatus::Running);
        assert_eq!(g.runtimes.recover().await, 0);

        g.runtimes.system_stop("w1", StopOptions::default()).await.unwrap();
        assert!(f.noop.identities().is_empty());
    }
}
