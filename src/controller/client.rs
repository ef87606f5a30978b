//! Kubernetes API seam for the workload controller
//!
//! Every cluster read and write the reconciler performs goes through
//! [`KubeClient`], so tests can run the full reconcile loop against a fake.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::crd::{GpuPool, GpuWorkload, GpuWorkloadStatus};
use crate::{Error, WORKLOAD_LABEL};

/// Trait abstracting Kubernetes client operations for the workload controller
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a GpuWorkload, or None if it does not exist
    async fn get_workload(&self, name: &str, namespace: &str)
        -> Result<Option<GpuWorkload>, Error>;

    /// List the worker pods labeled with the workload's name
    async fn list_worker_pods(&self, workload: &str, namespace: &str) -> Result<Vec<Pod>, Error>;

    /// Add the cleanup finalizer to a GpuWorkload (no-op if present)
    async fn add_workload_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Remove the cleanup finalizer from a GpuWorkload (no-op if absent or gone)
    async fn remove_workload_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Delete every worker pod labeled with the workload's name
    async fn delete_worker_pods(&self, workload: &str, namespace: &str) -> Result<(), Error>;

    /// Delete a pod; a pod that is already gone is not an error
    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Create a pod in the namespace set on its metadata
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Replace a pod, failing with 409 if its resource version is stale
    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Add the cleanup finalizer to a pod (no-op if present)
    async fn add_pod_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Remove the cleanup finalizer from a pod (no-op if absent or gone)
    async fn remove_pod_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Get a GpuPool, or None if it does not exist
    async fn get_pool(&self, name: &str) -> Result<Option<GpuPool>, Error>;

    /// Write the workload status, returning the updated workload
    ///
    /// The write carries the workload's resource version, so a status computed
    /// from a stale read fails with 409 instead of overwriting newer state.
    async fn patch_workload_status(
        &self,
        workload: &GpuWorkload,
        status: &GpuWorkloadStatus,
    ) -> Result<GpuWorkload, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
    field_manager: String,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn workloads(&self, namespace: &str) -> Api<GpuWorkload> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn worker_selector(workload: &str) -> ListParams {
    ListParams::default().labels(&format!("{WORKLOAD_LABEL}={workload}"))
}

async fn add_finalizer<K>(api: &Api<K>, name: &str, finalizer: &str, manager: &str) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let obj = api.get(name).await?;
    let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();

    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(name, &PatchParams::apply(manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn remove_finalizer<K>(
    api: &Api<K>,
    name: &str,
    finalizer: &str,
    manager: &str,
) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let Some(obj) = api.get_opt(name).await? else {
        return Ok(());
    };
    let current = obj.meta().finalizers.clone().unwrap_or_default();
    let finalizers: Vec<String> = current.iter().filter(|f| *f != finalizer).cloned().collect();

    if finalizers.len() == current.len() {
        return Ok(());
    }

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    match api
        .patch(name, &PatchParams::apply(manager), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        // Removing the last finalizer can race with the object disappearing
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_workload(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<GpuWorkload>, Error> {
        Ok(self.workloads(namespace).get_opt(name).await?)
    }

    async fn list_worker_pods(&self, workload: &str, namespace: &str) -> Result<Vec<Pod>, Error> {
        let pods = self.pods(namespace).list(&worker_selector(workload)).await?;
        Ok(pods.items)
    }

    async fn add_workload_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        add_finalizer(&self.workloads(namespace), name, crate::FINALIZER, &self.field_manager).await
    }

    async fn remove_workload_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        remove_finalizer(&self.workloads(namespace), name, crate::FINALIZER, &self.field_manager)
            .await
    }

    async fn delete_worker_pods(&self, workload: &str, namespace: &str) -> Result<(), Error> {
        self.pods(namespace)
            .delete_collection(&DeleteParams::default(), &worker_selector(workload))
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), Error> {
        match self.pods(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(pod = %name, "Pod already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let namespace = pod
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::validation("worker pod has no namespace"))?;
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        Ok(self.pods(namespace).create(&params, pod).await?)
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let (Some(name), Some(namespace)) =
            (pod.metadata.name.as_deref(), pod.metadata.namespace.as_deref())
        else {
            return Err(Error::validation("pod replace needs name and namespace"));
        };
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        Ok(self.pods(namespace).replace(name, &params, pod).await?)
    }

    async fn add_pod_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        add_finalizer(&self.pods(namespace), name, crate::FINALIZER, &self.field_manager).await
    }

    async fn remove_pod_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        remove_finalizer(&self.pods(namespace), name, crate::FINALIZER, &self.field_manager).await
    }

    async fn get_pool(&self, name: &str) -> Result<Option<GpuPool>, Error> {
        let api: Api<GpuPool> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn patch_workload_status(
        &self,
        workload: &GpuWorkload,
        status: &GpuWorkloadStatus,
    ) -> Result<GpuWorkload, Error> {
        let (Some(name), Some(namespace)) = (
            workload.metadata.name.as_deref(),
            workload.metadata.namespace.as_deref(),
        ) else {
            return Err(Error::validation("workload has no name or namespace"));
        };

        let status_patch = serde_json::json!({
            "metadata": {
                "resourceVersion": workload.metadata.resource_version
            },
            "status": status
        });

        let updated = self
            .workloads(namespace)
            .patch_status(
                name,
                &PatchParams::apply(&self.field_manager),
                &Patch::Merge(&status_patch),
            )
            .await?;

        Ok(updated)
    }
}
