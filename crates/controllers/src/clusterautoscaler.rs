//! ClusterAutoscaler controller.
//!
//! Only the ClusterAutoscaler named in [`ClusterAutoscalerConfig`] is acted on.
//! For it, a Deployment `cluster-autoscaler-<name>` is kept in the configured
//! namespace with the configured image and replica count, owned by the
//! ClusterAutoscaler so it is garbage collected with it. Changes to that
//! Deployment map back to the owner and get reverted.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use serde::Deserialize;
use tracing::{debug, info};

use cao_core::{Action, ReconcileResult};
use cao_kubehub::ClusterClient;
use cao_runtime::{map_to_owner, Controller, ControllerOptions, Manager, Reconciler, RegistrationError, Request};
use cao_schema::{apis, KindCodec};
use cao_store::{ChangeEvent, SharedStateCache};

use crate::codec_for;

pub const CONTROLLER_NAME: &str = "clusterautoscaler";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAutoscalerConfig {
    /// Name of the ClusterAutoscaler resource to act on.
    pub name: String,
    pub image: String,
    pub replicas: i32,
    /// Namespace the cluster-autoscaler Deployment runs in.
    pub namespace: String,
}

impl Default for ClusterAutoscalerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            image: "quay.io/openshift/origin-cluster-autoscaler:v4.0".to_string(),
            replicas: 1,
            namespace: "openshift-cluster-api".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClusterAutoscaler {
    metadata: ObjectMeta,
}

pub struct ClusterAutoscalerReconciler {
    config: ClusterAutoscalerConfig,
    client: Arc<dyn ClusterClient>,
    cache: Arc<SharedStateCache>,
    owner: Arc<KindCodec>,
    deployments: Arc<KindCodec>,
}

impl ClusterAutoscalerReconciler {
    pub fn new(
        config: ClusterAutoscalerConfig,
        client: Arc<dyn ClusterClient>,
        cache: Arc<SharedStateCache>,
        owner: Arc<KindCodec>,
        deployments: Arc<KindCodec>,
    ) -> Self {
        Self { config, client, cache, owner, deployments }
    }

    pub fn deployment_name(&self) -> String {
        format!("cluster-autoscaler-{}", self.config.name)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("k8s-app".to_string(), "cluster-autoscaler".to_string()),
            ("cluster-autoscaler".to_string(), self.config.name.clone()),
        ])
    }

    fn desired(&self, ca: &ObjectMeta) -> anyhow::Result<Deployment> {
        let uid = ca.uid.clone().context("ClusterAutoscaler has no uid yet")?;
        let owner = OwnerReference {
            api_version: self.owner.kind().api_version(),
            kind: self.owner.kind().kind.clone(),
            name: self.config.name.clone(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        Ok(Deployment {
            metadata: ObjectMeta {
                name: Some(self.deployment_name()),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(self.labels()),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(self.config.replicas),
                selector: LabelSelector { match_labels: Some(self.labels()), ..Default::default() },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(self.labels()), ..Default::default() }),
                    spec: Some(PodSpec {
                        service_account_name: Some("cluster-autoscaler".to_string()),
                        containers: vec![Container {
                            name: "cluster-autoscaler".to_string(),
                            image: Some(self.config.image.clone()),
                            command: Some(vec!["cluster-autoscaler".to_string()]),
                            args: Some(vec![
                                "--logtostderr".to_string(),
                                "--cloud-provider=cluster-api".to_string(),
                                format!("--namespace={}", self.config.namespace),
                            ]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Current Deployment from the cache, falling back to the API when the
    /// cache has not seen it (e.g. created by an earlier pass).
    async fn current(&self) -> anyhow::Result<Option<Deployment>> {
        let name = self.deployment_name();
        let key = self.deployments.key(Some(&self.config.namespace), &name);
        if let Ok(obj) = self.cache.get(&key) {
            return Ok(Some(self.deployments.decode_typed(&obj)?));
        }
        match self.client.get(&self.deployments, Some(&self.config.namespace), &name).await {
            Ok(raw) => Ok(Some(self.deployments.decode_value(raw)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading deployment {}", key)),
        }
    }
}

/// Whether the fields this controller manages already match.
fn up_to_date(current: &Deployment, desired: &Deployment) -> bool {
    let replicas = |d: &Deployment| d.spec.as_ref().and_then(|s| s.replicas);
    let containers = |d: &Deployment| {
        d.spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|p| p.containers.iter().map(|c| (c.name.clone(), c.image.clone(), c.args.clone())).collect::<Vec<_>>())
    };
    replicas(current) == replicas(desired)
        && containers(current) == containers(desired)
        && current.metadata.owner_references == desired.metadata.owner_references
}

#[async_trait::async_trait]
impl Reconciler for ClusterAutoscalerReconciler {
    async fn reconcile(&self, req: Request) -> ReconcileResult {
        if req.key.name != self.config.name {
            debug!(name = %req.key.name, "not the configured ClusterAutoscaler; ignoring");
            return Ok(Action::await_change());
        }
        let Some(obj) = req.object.as_deref() else {
            info!(name = %req.key.name, "ClusterAutoscaler gone; its Deployment is garbage collected");
            return Ok(Action::await_change());
        };
        let ca: ClusterAutoscaler = self.owner.decode_typed(obj)?;
        let mut desired = self.desired(&ca.metadata)?;
        let deployment = format!("{}/{}", self.config.namespace, self.deployment_name());

        match self.current().await? {
            None => {
                let raw = self.deployments.encode(&desired)?;
                self.client.create(&self.deployments, &raw).await.with_context(|| format!("creating deployment {}", deployment))?;
                info!(deployment = %deployment, image = %self.config.image, replicas = self.config.replicas, "created cluster-autoscaler deployment");
            }
            Some(current) if up_to_date(&current, &desired) => {
                debug!(deployment = %deployment, "cluster-autoscaler deployment up to date");
            }
            Some(mut current) => {
                current.metadata.owner_references = desired.metadata.owner_references.take();
                current.metadata.labels.get_or_insert_with(BTreeMap::new).extend(self.labels());
                current.spec = desired.spec.take();
                let raw = self.deployments.encode(&current)?;
                self.client.replace(&self.deployments, &raw).await.with_context(|| format!("updating deployment {}", deployment))?;
                info!(deployment = %deployment, image = %self.config.image, replicas = self.config.replicas, "updated cluster-autoscaler deployment");
            }
        }
        Ok(Action::await_change())
    }
}

/// Register the ClusterAutoscaler controller, watching owned Deployments.
pub fn add_to_manager(manager: &mut Manager, config: ClusterAutoscalerConfig, opts: ControllerOptions) -> Result<(), RegistrationError> {
    let owner = codec_for(manager, CONTROLLER_NAME, apis::cluster_autoscaler())?;
    let deployments = codec_for(manager, CONTROLLER_NAME, apis::deployment())?;
    let name = config.name.clone();
    let reconciler = ClusterAutoscalerReconciler::new(
        config,
        Arc::clone(manager.client()),
        Arc::clone(manager.cache()),
        Arc::clone(&owner),
        Arc::clone(&deployments),
    );
    Controller::new(CONTROLLER_NAME, owner.kind().clone(), reconciler)
        .with_filter(Arc::new(move |ev: &ChangeEvent| ev.key.name == name))
        .watches(deployments.kind().clone(), map_to_owner(&owner))
        .with_options(opts)
        .add_to_manager(manager)
}
