// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock cluster API for testing.
//!
//! Objects are kept as applied manifests keyed by namespace, kind and name. Pods report
//! `Running` unless a phase was set with [`MockKubernetesApi::set_pod_phase`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use devspace_core::InfrastructureError;
use serde_json::Value;

use super::api::{KubernetesApi, PodSummary, pod_summary};

type ObjectKey = (String, String, String);

#[derive(Debug, Default)]
struct MockState {
    namespaces: BTreeSet<String>,
    objects: BTreeMap<ObjectKey, Value>,
    phases: HashMap<String, String>,
    calls: Vec<String>,
    faults: HashMap<String, (bool, Option<usize>)>,
}

/// In-memory cluster API.
#[derive(Debug, Clone, Default)]
pub struct MockKubernetesApi {
    state: Arc<Mutex<MockState>>,
}

fn labels_match(object: &Value, selector: &BTreeMap<String, String>) -> bool {
    let labels = &object["metadata"]["labels"];
    selector
        .iter()
        .all(|(k, v)| labels[k.as_str()].as_str() == Some(v.as_str()))
}

impl MockKubernetesApi {
    /// Empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `times` calls of `operation`.
    pub fn fail_next(&self, operation: &str, transient: bool, times: usize) {
        self.state()
            .faults
            .insert(operation.to_string(), (transient, Some(times)));
    }

    /// Fail every call of `operation`.
    pub fn fail_always(&self, operation: &str, transient: bool) {
        self.state()
            .faults
            .insert(operation.to_string(), (transient, None));
    }

    /// Recorded calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Number of recorded calls of `operation`.
    pub fn call_count(&self, operation: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == operation).count()
    }

    /// Force the phase reported for pod `name`.
    pub fn set_pod_phase(&self, name: &str, phase: &str) {
        self.state()
            .phases
            .insert(name.to_string(), phase.to_string());
    }

    /// Existing namespaces.
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.state().namespaces.clone()
    }

    /// Manifests of every object of `kind` (`Pod`, `Service`, ...).
    pub fn objects(&self, kind: &str) -> Vec<Value> {
        self.state()
            .objects
            .iter()
            .filter(|((_, k, _), _)| k == kind)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Delete pod `name` behind the orchestrator's back.
    pub fn kill(&self, name: &str) -> bool {
        let mut state = self.state();
        let before = state.objects.len();
        state
            .objects
            .retain(|(_, kind, n), _| !(kind == "Pod" && n == name));
        state.objects.len() != before
    }

    fn enter(&self, operation: &str) -> Result<(), InfrastructureError> {
        let mut state = self.state();
        state.calls.push(operation.to_string());
        let (transient, fire, exhausted) = match state.faults.get_mut(operation) {
            None => return Ok(()),
            Some((transient, None)) => (*transient, true, false),
            Some((transient, Some(0))) => (*transient, false, true),
            Some((transient, Some(n))) => {
                *n -= 1;
                (*transient, true, *n == 0)
            }
        };
        if exhausted {
            state.faults.remove(operation);
        }
        if !fire {
            return Ok(());
        }
        Err(InfrastructureError::backend(
            operation,
            "injected failure",
            transient,
        ))
    }

    fn phase_of(state: &MockState, object: &Value) -> String {
        let name = object["metadata"]["name"].as_str().unwrap_or_default();
        state
            .phases
            .get(name)
            .cloned()
            .unwrap_or_else(|| "Running".to_string())
    }
}

#[async_trait]
impl KubernetesApi for MockKubernetesApi {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), InfrastructureError> {
        self.enter("ensure_namespace")?;
        self.state().namespaces.insert(namespace.to_string());
        Ok(())
    }

    async fn apply(&self, namespace: &str, manifest: &Value) -> Result<(), InfrastructureError> {
        self.enter("apply")?;
        let mut state = self.state();
        if !state.namespaces.contains(namespace) {
            return Err(InfrastructureError::backend(
                "apply",
                format!("namespaces \"{namespace}\" not found"),
                false,
            ));
        }
        let kind = manifest["kind"].as_str().unwrap_or_default().to_string();
        let name = manifest["metadata"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        state
            .objects
            .insert((namespace.to_string(), kind, name), manifest.clone());
        Ok(())
    }

    async fn delete_by_labels(
        &self,
        namespace: &str,
        kinds: &[&str],
        selector: &BTreeMap<String, String>,
    ) -> Result<(), InfrastructureError> {
        self.enter("delete_by_labels")?;
        self.state().objects.retain(|(ns, kind, _), object| {
            let kind_matches = kinds.iter().any(|k| k.eq_ignore_ascii_case(kind));
            !(ns == namespace && kind_matches && labels_match(object, selector))
        });
        Ok(())
    }

    async fn pod_phase(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, InfrastructureError> {
        self.enter("pod_phase")?;
        let state = self.state();
        let key = (namespace.to_string(), "Pod".to_string(), name.to_string());
        Ok(state
            .objects
            .get(&key)
            .map(|object| Self::phase_of(&state, object)))
    }

    async fn list_pods(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodSummary>, InfrastructureError> {
        self.enter("list_pods")?;
        let state = self.state();
        Ok(state
            .objects
            .iter()
            .filter(|((_, kind, _), object)| kind == "Pod" && labels_match(object, selector))
            .map(|((ns, _, _), object)| {
                let mut pod = pod_summary(object);
                pod.namespace = ns.clone();
                pod.phase = Self::phase_of(&state, object);
                pod
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str, workspace: &str) -> Value {
        json!({
            "kind": "Pod",
            "metadata": {"name": name, "labels": {"devspace.workspace": workspace}}
        })
    }

    #[tokio::test]
    async fn test_apply_requires_namespace() {
        let api = MockKubernetesApi::new();
        assert!(api.apply("ns", &pod("a", "w1")).await.is_err());
        api.ensure_namespace("ns").await.unwrap();
        api.apply("ns", &pod("a", "w1")).await.unwrap();
        api.apply("ns", &pod("a", "w1")).await.unwrap();
        assert_eq!(api.objects("Pod").len(), 1);
    }

    #[tokio::test]
    async fn test_delete_by_labels() {
        let api = MockKubernetesApi::new();
        api.ensure_namespace("ns").await.unwrap();
        api.apply("ns", &pod("a", "w1")).await.unwrap();
        api.apply("ns", &pod("b", "w2")).await.unwrap();

        let selector = BTreeMap::from([("devspace.workspace".to_string(), "w1".to_string())]);
        api.delete_by_labels("ns", &["pod"], &selector).await.unwrap();
        let left = api.list_pods(&BTreeMap::new()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "b");
    }

    #[tokio::test]
    async fn test_pod_phase() {
        let api = MockKubernetesApi::new();
        api.ensure_namespace("ns").await.unwrap();
        assert_eq!(api.pod_phase("ns", "a").await.unwrap(), None);
        api.apply("ns", &pod("a", "w1")).await.unwrap();
        assert_eq!(api.pod_phase("ns", "a").await.unwrap().as_deref(), Some("Running"));
        api.set_pod_phase("a", "Failed");
        assert_eq!(api.pod_phase("ns", "a").await.unwrap().as_deref(), Some("Failed"));
    }

    #[tokio::test]
    async fn test_faults_count_down() {
        let api = MockKubernetesApi::new();
        api.fail_next("ensure_namespace", true, 1);
        assert!(api.ensure_namespace("ns").await.unwrap_err().is_transient());
        api.ensure_namespace("ns").await.unwrap();
        assert_eq!(api.call_count("ensure_namespace"), 2);
    }
}
