use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use cao_schema::KindCodec;

use crate::{meta_str, ClientError, ClusterClient, ObjectList, WatchEvent, WatchStream};

/// Server-side watch timeout; the cache reconnects when the stream ends.
const WATCH_TIMEOUT_SECS: u32 = 290;
const WATCH_BUFFER: usize = 64;

impl From<kube::Error> for ClientError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) => ClientError::from_status(resp.code, &resp.reason, &resp.message),
            kube::Error::Auth(e) => ClientError::Unauthorized(e.to_string()),
            kube::Error::InferConfig(e) => ClientError::Config(e.to_string()),
            kube::Error::SerdeError(e) => ClientError::Decode(e.to_string()),
            other => ClientError::Transport(other.to_string()),
        }
    }
}

fn to_json(obj: DynamicObject) -> Result<serde_json::Value, ClientError> {
    serde_json::to_value(obj).map_err(|e| ClientError::Decode(e.to_string()))
}

fn from_json(obj: &serde_json::Value) -> Result<DynamicObject, ClientError> {
    serde_json::from_value(obj.clone()).map_err(|e| ClientError::Decode(e.to_string()))
}

/// [`ClusterClient`] backed by a kube-rs client and dynamic objects.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Infer credentials from the environment (in-cluster or kubeconfig).
    pub async fn try_default() -> Result<Self, ClientError> {
        let client = Client::try_default().await?;
        info!("kube client ready");
        Ok(Self::new(client))
    }

    fn api(&self, codec: &KindCodec, namespace: Option<&str>) -> Api<DynamicObject> {
        let kind = codec.kind();
        let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
        let ar = ApiResource::from_gvk_with_plural(&gvk, codec.plural());
        match (codec.namespaced(), namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list(&self, codec: &KindCodec, namespace: Option<&str>) -> Result<ObjectList, ClientError> {
        let list = self.api(codec, namespace).list(&ListParams::default()).await?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        let items = list.items.into_iter().map(to_json).collect::<Result<Vec<_>, _>>()?;
        debug!(kind = %codec.kind(), count = items.len(), rv = %resource_version, "listed");
        Ok(ObjectList { resource_version, items })
    }

    async fn watch(&self, codec: &KindCodec, namespace: Option<&str>, resource_version: &str) -> Result<WatchStream, ClientError> {
        let api = self.api(codec, namespace);
        let rv = resource_version.to_string();
        let (tx, rx) = mpsc::channel::<Result<WatchEvent, ClientError>>(WATCH_BUFFER);

        // The kube event stream borrows its Api; a pump task owns both.
        tokio::spawn(async move {
            let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
            let stream = match api.watch(&wp, &rv).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };
            futures::pin_mut!(stream);
            while let Some(ev) = stream.next().await {
                let mapped = match ev {
                    Ok(kube::api::WatchEvent::Added(o)) => to_json(o).map(WatchEvent::Added),
                    Ok(kube::api::WatchEvent::Modified(o)) => to_json(o).map(WatchEvent::Modified),
                    Ok(kube::api::WatchEvent::Deleted(o)) => to_json(o).map(WatchEvent::Deleted),
                    Ok(kube::api::WatchEvent::Bookmark(b)) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
                    Ok(kube::api::WatchEvent::Error(resp)) => Err(ClientError::from_status(resp.code, &resp.reason, &resp.message)),
                    Err(e) => Err(e.into()),
                };
                if tx.send(mapped).await.is_err() {
                    break;
                }
            }
        });

        let events = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        Ok(events.boxed())
    }

    async fn get(&self, codec: &KindCodec, namespace: Option<&str>, name: &str) -> Result<serde_json::Value, ClientError> {
        to_json(self.api(codec, namespace).get(name).await?)
    }

    async fn create(&self, codec: &KindCodec, obj: &serde_json::Value) -> Result<serde_json::Value, ClientError> {
        let api = self.api(codec, meta_str(obj, "namespace"));
        to_json(api.create(&PostParams::default(), &from_json(obj)?).await?)
    }

    async fn replace(&self, codec: &KindCodec, obj: &serde_json::Value) -> Result<serde_json::Value, ClientError> {
        let name = meta_str(obj, "name").ok_or_else(|| ClientError::Decode("object missing metadata.name".into()))?;
        let api = self.api(codec, meta_str(obj, "namespace"));
        to_json(api.replace(name, &PostParams::default(), &from_json(obj)?).await?)
    }

    async fn delete(&self, codec: &KindCodec, namespace: Option<&str>, name: &str) -> Result<(), ClientError> {
        self.api(codec, namespace).delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
