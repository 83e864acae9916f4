use async_trait::async_trait;
use futures::io::AsyncBufReadExt;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ApiResource, DynamicObject, ListParams, LogParams, WatchEvent, WatchParams};
use kube::discovery::{self, ApiGroup, verbs};
use kube::{Api, Client, ResourceExt, config};
use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::store::host_dir_name;
use crate::types::{ChangeEvent, EventKind, PodTarget, ResourceKindDescriptor};

pub type EventStream = BoxStream<'static, Result<ChangeEvent, ClusterError>>;
pub type LineStream = BoxStream<'static, Result<String, ClusterError>>;

/// Result of a discovery call. Groups that could not be resolved are
/// reported in `warnings` while the rest is still returned.
#[derive(Debug, Default)]
pub struct Discovered {
    pub kinds: Vec<ResourceKindDescriptor>,
    pub warnings: Vec<String>,
}

/// The cluster capabilities the recorder depends on.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn discover(&self) -> Result<Discovered, ClusterError>;

    /// Open a watch on every object of one kind. An error here means the
    /// subscription could not be opened at all.
    async fn subscribe(&self, kind: &ResourceKindDescriptor) -> Result<EventStream, ClusterError>;

    async fn list_pods(&self) -> Result<Vec<PodTarget>, ClusterError>;

    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        lookback_seconds: i64,
    ) -> Result<LineStream, ClusterError>;
}

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the kubeconfig, using the current context unless
    /// one is given. Returns the client and the host name used as store root.
    pub async fn connect(context: Option<&str>) -> anyhow::Result<(Self, String)> {
        let config = match context {
            Some(ctx) => config::Config::from_kubeconfig(&config::KubeConfigOptions {
                context: Some(ctx.to_string()),
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow::anyhow!("Context '{}' not found in kubeconfig: {}", ctx, e))?,
            None => config::Config::infer().await?,
        };
        let host = host_dir_name(&config.cluster_url.to_string());
        let client = Client::try_from(config)?;
        info!("Connected to cluster {}", host);
        Ok((Self::new(client), host))
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn discover(&self) -> Result<Discovered, ClusterError> {
        let groups = self
            .client
            .list_api_groups()
            .await
            .map_err(|e| ClusterError::Discovery(e.to_string()))?;
        let names = std::iter::once(ApiGroup::CORE_GROUP.to_string())
            .chain(groups.groups.into_iter().map(|g| g.name));

        let mut discovered = Discovered::default();
        for name in names {
            let group = match discovery::group(&self.client, &name).await {
                Ok(group) => group,
                Err(e) => {
                    discovered
                        .warnings
                        .push(format!("API group {:?} is unavailable: {}", name, e));
                    continue;
                }
            };
            for (ar, caps) in group.recommended_resources() {
                if !caps.supports_operation(verbs::WATCH) {
                    continue;
                }
                discovered.kinds.push(ResourceKindDescriptor {
                    group: ar.group,
                    version: ar.version,
                    resource_name: ar.plural,
                    kind: ar.kind,
                });
            }
        }
        if discovered.kinds.is_empty() && !discovered.warnings.is_empty() {
            return Err(ClusterError::Discovery(discovered.warnings.join("; ")));
        }
        Ok(discovered)
    }

    async fn subscribe(&self, kind: &ResourceKindDescriptor) -> Result<EventStream, ClusterError> {
        let ar = ApiResource {
            group: kind.group.clone(),
            version: kind.version.clone(),
            api_version: kind.api_version(),
            kind: kind.kind.clone(),
            plural: kind.resource_name.clone(),
        };
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let params = WatchParams::default();
        let first = api
            .watch(&params, "0")
            .await
            .map_err(|e| ClusterError::Subscribe {
                resource: kind.to_string(),
                reason: e.to_string(),
            })?;
        let state = WatchState {
            api,
            params,
            resource: kind.to_string(),
            resource_version: "0".to_string(),
            inner: Some(first.boxed()),
            saw_event: false,
            done: false,
        };
        Ok(state.into_stream())
    }

    async fn list_pods(&self) -> Result<Vec<PodTarget>, ClusterError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api.list(&ListParams::default()).await?;
        Ok(pods
            .items
            .into_iter()
            .map(|pod| PodTarget {
                namespace: pod.namespace().unwrap_or_default(),
                name: pod.name_any(),
                containers: pod
                    .spec
                    .map(|s| s.containers.into_iter().map(|c| c.name).collect())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        lookback_seconds: i64,
    ) -> Result<LineStream, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = LogParams {
            follow: true,
            container: Some(container.to_string()),
            since_seconds: Some(lookback_seconds),
            ..Default::default()
        };
        let logs_err = |reason: String| ClusterError::Logs {
            pod: format!("{}/{}", namespace, pod),
            container: container.to_string(),
            reason,
        };
        let reader = api
            .log_stream(pod, &lp)
            .await
            .map_err(|e| logs_err(e.to_string()))?;
        let pod_id = format!("{}/{}", namespace, pod);
        let container = container.to_string();
        Ok(reader
            .lines()
            .map(move |line| {
                line.map_err(|e| ClusterError::Logs {
                    pod: pod_id.clone(),
                    container: container.clone(),
                    reason: e.to_string(),
                })
            })
            .boxed())
    }
}

/// A watch that picks up again where it left off when the API server ends
/// the request on its own timeout.
struct WatchState {
    api: Api<DynamicObject>,
    params: WatchParams,
    resource: String,
    resource_version: String,
    inner: Option<BoxStream<'static, kube::Result<WatchEvent<DynamicObject>>>>,
    saw_event: bool,
    done: bool,
}

impl WatchState {
    fn into_stream(self) -> EventStream {
        stream::unfold(self, |mut st| async move {
            loop {
                if st.done {
                    return None;
                }
                if st.inner.is_none() {
                    match st.api.watch(&st.params, &st.resource_version).await {
                        Ok(s) => {
                            st.inner = Some(s.boxed());
                            st.saw_event = false;
                        }
                        Err(e) => {
                            st.done = true;
                            let err = st.stream_error(e.to_string());
                            return Some((Err(err), st));
                        }
                    }
                }
                let next = match st.inner.as_mut() {
                    Some(inner) => inner.next().await,
                    None => return None,
                };
                match next {
                    // A request that ends without delivering anything means
                    // there is nothing to watch here.
                    None if !st.saw_event => return None,
                    None => {
                        debug!(
                            "Watch for {} ended by server, resuming at {}",
                            st.resource, st.resource_version
                        );
                        st.inner = None;
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        let err = st.stream_error(e.to_string());
                        return Some((Err(err), st));
                    }
                    Some(Ok(event)) => {
                        st.saw_event = true;
                        let event = st.convert(event);
                        return Some((event, st));
                    }
                }
            }
        })
        .boxed()
    }

    fn stream_error(&self, reason: String) -> ClusterError {
        ClusterError::Stream {
            resource: self.resource.clone(),
            reason,
        }
    }

    fn convert(&mut self, event: WatchEvent<DynamicObject>) -> Result<ChangeEvent, ClusterError> {
        let (kind, obj) = match event {
            WatchEvent::Added(obj) => (EventKind::Added, obj),
            WatchEvent::Modified(obj) => (EventKind::Modified, obj),
            WatchEvent::Deleted(obj) => (EventKind::Deleted, obj),
            WatchEvent::Bookmark(bookmark) => {
                self.resource_version = bookmark.metadata.resource_version;
                return Ok(ChangeEvent {
                    kind: EventKind::Bookmark,
                    entity: None,
                });
            }
            WatchEvent::Error(err) => {
                warn!("Watch of {} failed: {:?}", self.resource, err);
                self.done = true;
                return Ok(ChangeEvent {
                    kind: EventKind::Error,
                    entity: None,
                });
            }
        };
        if let Some(rv) = &obj.metadata.resource_version {
            self.resource_version = rv.clone();
        }
        Ok(ChangeEvent {
            kind,
            entity: serde_json::to_value(&obj).ok(),
        })
    }
}
