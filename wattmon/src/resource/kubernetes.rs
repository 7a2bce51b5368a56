//! Kubernetes pod metadata.
//!
//! Maps container ids and pod UIDs to human-readable names by listing
//! the pods scheduled on this node through the API server. The map is
//! refreshed by a background task; lookups are synchronous reads of the
//! cached map, so the informer never blocks on the network.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

const SERVICEACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICEACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Names attached to one container of a pod.
#[derive(Debug, Clone)]
pub struct ContainerMeta {
    pub container_name: String,
    pub pod_uid: String,
    pub pod_name: String,
    pub namespace: String,
}

#[derive(Debug, Default)]
struct PodMap {
    /// Keyed by container id, runtime prefix stripped.
    by_container: HashMap<String, ContainerMeta>,
    /// Pod UID to (name, namespace).
    by_pod_uid: HashMap<String, (String, String)>,
}

/// Read handle on the cached pod map.
#[derive(Clone)]
pub struct PodResolver {
    map: Arc<RwLock<PodMap>>,
}

impl PodResolver {
    pub fn lookup_container(&self, container_id: &str) -> Option<ContainerMeta> {
        self.map.read().unwrap().by_container.get(container_id).cloned()
    }

    pub fn lookup_pod(&self, pod_uid: &str) -> Option<(String, String)> {
        self.map.read().unwrap().by_pod_uid.get(pod_uid).cloned()
    }
}

/// Watches the pods of one node through the API server.
pub struct PodWatcher {
    client: Client,
    api_url: String,
    token: String,
    node_name: String,
    map: Arc<RwLock<PodMap>>,
    refresh_interval: Duration,
}

impl PodWatcher {
    /// Builds a watcher from the in-cluster service-account environment
    /// (`KUBERNETES_SERVICE_HOST`/`PORT` + mounted token and CA).
    pub fn in_cluster(node_name: String, refresh_interval: Duration) -> anyhow::Result<PodWatcher> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").context("KUBERNETES_SERVICE_HOST is not set")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").context("KUBERNETES_SERVICE_PORT is not set")?;
        let api_url = format!("https://{host}:{port}");
        let token = std::fs::read_to_string(SERVICEACCOUNT_TOKEN)
            .with_context(|| format!("could not read {SERVICEACCOUNT_TOKEN}"))?
            .trim()
            .to_owned();
        let ca = std::fs::read(SERVICEACCOUNT_CA).with_context(|| format!("could not read {SERVICEACCOUNT_CA}"))?;

        let client = Client::builder()
            .add_root_certificate(reqwest::Certificate::from_pem(&ca).context("invalid service-account CA")?)
            .build()
            .context("could not build the Kubernetes HTTP client")?;

        Ok(PodWatcher {
            client,
            api_url,
            token,
            node_name,
            map: Arc::new(RwLock::new(PodMap::default())),
            refresh_interval,
        })
    }

    pub fn resolver(&self) -> PodResolver {
        PodResolver { map: self.map.clone() }
    }

    /// Runs the refresh loop until cancellation.
    pub async fn run(self, shutdown: CancellationToken) {
        log::info!("starting pod watcher for node {}", self.node_name);
        loop {
            if let Err(e) = self.refresh_pods().await {
                log::warn!("failed to refresh pods: {e:#}");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.refresh_interval) => {}
            }
        }
    }

    async fn refresh_pods(&self) -> anyhow::Result<()> {
        let url = format!(
            "{}/api/v1/pods?fieldSelector=spec.nodeName={}",
            self.api_url, self.node_name
        );
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .context("pod list request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("API error: {}", resp.status());
        }
        let pod_list: PodList = resp.json().await.context("invalid pod list payload")?;

        let mut new_map = PodMap::default();
        for pod in pod_list.items {
            let namespace = pod.metadata.namespace.unwrap_or_default();
            let pod_name = pod.metadata.name.unwrap_or_default();
            let pod_uid = pod.metadata.uid.unwrap_or_default();
            new_map
                .by_pod_uid
                .insert(pod_uid.clone(), (pod_name.clone(), namespace.clone()));

            let Some(statuses) = pod.status.and_then(|s| s.container_statuses) else {
                continue;
            };
            for status in statuses {
                let Some(container_id) = status.container_id else { continue };
                // container_id is "<runtime>://<id>"
                let stripped = container_id
                    .split_once("://")
                    .map(|(_, id)| id)
                    .unwrap_or(container_id.as_str());
                new_map.by_container.insert(
                    stripped.to_owned(),
                    ContainerMeta {
                        container_name: status.name.clone(),
                        pod_uid: pod_uid.clone(),
                        pod_name: pod_name.clone(),
                        namespace: namespace.clone(),
                    },
                );
            }
        }

        let n_containers = new_map.by_container.len();
        let n_pods = new_map.by_pod_uid.len();
        *self.map.write().unwrap() = new_map;
        log::debug!("refreshed pod map: {n_pods} pods, {n_containers} containers");
        Ok(())
    }
}

#[derive(Deserialize)]
struct PodList {
    items: Vec<Pod>,
}

#[derive(Deserialize)]
struct Pod {
    metadata: PodMetadata,
    status: Option<PodStatus>,
}

#[derive(Deserialize)]
struct PodMetadata {
    name: Option<String>,
    namespace: Option<String>,
    uid: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    container_statuses: Option<Vec<ContainerStatus>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerStatus {
    name: String,
    container_id: Option<String>,
}
