//! Per-node host port allocation for worker pods
//!
//! Workers expose their server on a host port so clients on other nodes can
//! reach them directly. Each port is bound to the pod that reserved it; two
//! live pods never hold the same port on the same node.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::crd::NameNamespace;
use crate::{Error, Result, HOSTNAME_LABEL, PORT_ANNOTATION};

/// Host port reservation contract consumed by the reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// Reserve a free port on `node` for `pod`
    async fn assign_host_port(&self, node: &str, pod: &NameNamespace) -> Result<u16>;

    /// Release `port` on `node`
    ///
    /// Without `force`, a port currently bound to a different pod is left
    /// alone and an error is returned. Releasing an unbound port succeeds.
    async fn release_host_port(
        &self,
        node: &str,
        pod: &NameNamespace,
        port: u16,
        force: bool,
    ) -> Result<()>;
}

#[derive(Default)]
struct NodePorts {
    bound: BTreeMap<u16, NameNamespace>,
    next: Option<u16>,
}

/// In-memory allocator over an inclusive port range, tracked per node
pub struct HostPortAllocator {
    start: u16,
    end: u16,
    nodes: Mutex<HashMap<String, NodePorts>>,
}

impl HostPortAllocator {
    /// Create an allocator handing out ports in `start..=end`
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Re-bind ports recorded on existing worker pods
    pub fn restore(&self, pods: &[Pod]) {
        let mut nodes = self.nodes.lock();
        let mut restored = 0usize;
        for pod in pods {
            let (Some(node), Some(port)) = (pod_node(pod), annotated_port(pod)) else {
                continue;
            };
            let owner = NameNamespace::new(pod.name_any(), pod.namespace().unwrap_or_default());
            nodes.entry(node).or_default().bound.insert(port, owner);
            restored += 1;
        }
        info!(ports = restored, "Restored host ports from worker pods");
    }

    /// Pod currently holding `port` on `node`
    pub fn holder(&self, node: &str, port: u16) -> Option<NameNamespace> {
        self.nodes
            .lock()
            .get(node)
            .and_then(|n| n.bound.get(&port))
            .cloned()
    }

    fn range_len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }
}

#[async_trait]
impl PortAllocator for HostPortAllocator {
    async fn assign_host_port(&self, node: &str, pod: &NameNamespace) -> Result<u16> {
        let mut nodes = self.nodes.lock();
        let ports = nodes.entry(node.to_string()).or_default();

        // Rotate through the range so a just-released port is not reused at once
        let mut candidate = ports.next.unwrap_or(self.start);
        for _ in 0..self.range_len() {
            if !ports.bound.contains_key(&candidate) {
                ports.bound.insert(candidate, pod.clone());
                ports.next = Some(if candidate >= self.end { self.start } else { candidate + 1 });
                debug!(node, pod = %pod, port = candidate, "Reserved host port");
                return Ok(candidate);
            }
            candidate = if candidate >= self.end { self.start } else { candidate + 1 };
        }
        Err(Error::host_port(format!(
            "no free host port on node {node} in {}-{}",
            self.start, self.end
        )))
    }

    async fn release_host_port(
        &self,
        node: &str,
        pod: &NameNamespace,
        port: u16,
        force: bool,
    ) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let Some(ports) = nodes.get_mut(node) else {
            return Ok(());
        };
        match ports.bound.get(&port) {
            None => Ok(()),
            Some(holder) if holder == pod || force => {
                ports.bound.remove(&port);
                debug!(node, pod = %pod, port, "Released host port");
                Ok(())
            }
            Some(holder) => Err(Error::host_port(format!(
                "port {port} on node {node} is held by {holder}, not {pod}"
            ))),
        }
    }
}

/// Node a worker pod runs on, or is pinned to by its hostname selector
pub fn pod_node(pod: &Pod) -> Option<String> {
    let spec = pod.spec.as_ref()?;
    spec.node_name.clone().or_else(|| {
        spec.node_selector
            .as_ref()
            .and_then(|s| s.get(HOSTNAME_LABEL))
            .cloned()
    })
}

/// Host port recorded in a worker pod's port annotation
pub fn annotated_port(pod: &Pod) -> Option<u16> {
    pod.annotations()
        .get(PORT_ANNOTATION)
        .and_then(|p| p.trim().parse().ok())
}
