//! MachineAutoscaler controller.
//!
//! A MachineAutoscaler names a scale target (a MachineSet or
//! MachineDeployment in its own namespace) and a replica range. The range is
//! published to the cluster-autoscaler as annotations on the target, together
//! with an owner annotation naming the MachineAutoscaler. Targets a
//! MachineAutoscaler no longer points at, or that outlive it, are released by
//! stripping those annotations again.

use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, info, warn};

use cao_core::{Action, ObjectKey, ReconcileResult, ResourceKind};
use cao_kubehub::ClusterClient;
use cao_runtime::{Controller, ControllerOptions, Manager, Reconciler, RegistrationError, Request};
use cao_schema::{apis, KindCodec};
use cao_store::{ChangeEvent, SharedStateCache};

use crate::codec_for;

pub const CONTROLLER_NAME: &str = "machineautoscaler";

pub const MIN_SIZE_ANNOTATION: &str = "machine.openshift.io/cluster-api-autoscaler-node-group-min-size";
pub const MAX_SIZE_ANNOTATION: &str = "machine.openshift.io/cluster-api-autoscaler-node-group-max-size";
/// Set on a scale target to the `namespace/name` of the MachineAutoscaler managing it.
pub const OWNER_ANNOTATION: &str = "autoscaling.openshift.io/machineautoscaler";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossVersionObjectReference {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineAutoscalerSpec {
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub scale_target_ref: CrossVersionObjectReference,
}

impl MachineAutoscalerSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_replicas < 0 {
            return Err(format!("minReplicas {} is negative", self.min_replicas));
        }
        if self.min_replicas > self.max_replicas {
            return Err(format!("minReplicas {} exceeds maxReplicas {}", self.min_replicas, self.max_replicas));
        }
        if self.scale_target_ref.name.is_empty() {
            return Err("scaleTargetRef.name is empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct MachineAutoscaler {
    spec: MachineAutoscalerSpec,
}

pub struct MachineAutoscalerReconciler {
    client: Arc<dyn ClusterClient>,
    cache: Arc<SharedStateCache>,
    /// Kinds a MachineAutoscaler may target; the first is used when the
    /// reference leaves apiVersion and kind empty.
    targets: Vec<Arc<KindCodec>>,
}

impl MachineAutoscalerReconciler {
    pub fn new(client: Arc<dyn ClusterClient>, cache: Arc<SharedStateCache>, targets: Vec<Arc<KindCodec>>) -> Self {
        Self { client, cache, targets }
    }

    fn target_codec(&self, r: &CrossVersionObjectReference) -> Option<&Arc<KindCodec>> {
        if r.kind.is_empty() && r.api_version.is_empty() {
            return self.targets.first();
        }
        self.targets.iter().find(|c| {
            c.kind().kind == r.kind && (r.api_version.is_empty() || c.kind().api_version() == r.api_version)
        })
    }

    /// Strip the managed annotations from every cached target owned by
    /// `owner`, except `keep`.
    async fn release(&self, owner: &str, keep: Option<&ObjectKey>) -> anyhow::Result<()> {
        for codec in &self.targets {
            for obj in self.cache.list(codec.kind()) {
                if Some(&obj.key) == keep || annotation(&obj.raw, OWNER_ANNOTATION) != Some(owner) {
                    continue;
                }
                let mut raw = obj.raw.clone();
                clear_annotations(&mut raw);
                self.client.replace(codec, &raw).await.with_context(|| format!("releasing {}", obj.key))?;
                info!(scale_target = %obj.key, owner, "released scale target");
            }
        }
        Ok(())
    }
}

fn annotation<'a>(raw: &'a serde_json::Value, name: &str) -> Option<&'a str> {
    raw.get("metadata")?.get("annotations")?.get(name)?.as_str()
}

fn annotations_mut(raw: &mut serde_json::Value) -> Option<&mut serde_json::Map<String, serde_json::Value>> {
    let meta = raw.as_object_mut()?.entry("metadata").or_insert_with(|| serde_json::json!({}));
    let annotations = meta.as_object_mut()?.entry("annotations").or_insert_with(|| serde_json::json!({}));
    if annotations.is_null() {
        *annotations = serde_json::json!({});
    }
    annotations.as_object_mut()
}

/// Set the owner and size annotations; returns whether anything changed.
fn set_annotations(raw: &mut serde_json::Value, owner: &str, min: i32, max: i32) -> bool {
    let Some(annotations) = annotations_mut(raw) else { return false };
    let mut changed = false;
    for (k, v) in [(OWNER_ANNOTATION, owner.to_string()), (MIN_SIZE_ANNOTATION, min.to_string()), (MAX_SIZE_ANNOTATION, max.to_string())] {
        if annotations.get(k).and_then(|cur| cur.as_str()) != Some(v.as_str()) {
            annotations.insert(k.to_string(), serde_json::Value::String(v));
            changed = true;
        }
    }
    changed
}

fn clear_annotations(raw: &mut serde_json::Value) {
    if let Some(annotations) = annotations_mut(raw) {
        for k in [OWNER_ANNOTATION, MIN_SIZE_ANNOTATION, MAX_SIZE_ANNOTATION] {
            annotations.remove(k);
        }
    }
}

#[async_trait::async_trait]
impl Reconciler for MachineAutoscalerReconciler {
    async fn reconcile(&self, req: Request) -> ReconcileResult {
        let owner = req.key.ns_name();
        let Some(obj) = req.object.as_deref() else {
            debug!(machineautoscaler = %owner, "MachineAutoscaler deleted; releasing its targets");
            self.release(&owner, None).await?;
            return Ok(Action::await_change());
        };
        let spec = match serde_json::from_value::<MachineAutoscaler>(obj.raw.clone()) {
            Ok(ma) => ma.spec,
            Err(e) => {
                warn!(machineautoscaler = %owner, error = %e, "malformed MachineAutoscaler; waiting for a change");
                return Ok(Action::await_change());
            }
        };
        if let Err(reason) = spec.validate() {
            warn!(machineautoscaler = %owner, reason = %reason, "invalid MachineAutoscaler; waiting for a change");
            return Ok(Action::await_change());
        }
        let target_ref = &spec.scale_target_ref;
        let Some(codec) = self.target_codec(target_ref) else {
            warn!(machineautoscaler = %owner, api_version = %target_ref.api_version, kind = %target_ref.kind, "unsupported scale target kind");
            return Ok(Action::await_change());
        };

        let namespace = req.key.namespace.as_deref();
        let target = codec.key(namespace, &target_ref.name);
        let mut raw = self
            .client
            .get(codec, namespace, &target_ref.name)
            .await
            .with_context(|| format!("reading scale target {}", target))?;
        if let Some(other) = annotation(&raw, OWNER_ANNOTATION).filter(|o| *o != owner) {
            warn!(machineautoscaler = %owner, scale_target = %target, owned_by = other, "scale target managed by another MachineAutoscaler");
            return Ok(Action::await_change());
        }
        if set_annotations(&mut raw, &owner, spec.min_replicas, spec.max_replicas) {
            self.client.replace(codec, &raw).await.with_context(|| format!("annotating scale target {}", target))?;
            info!(machineautoscaler = %owner, scale_target = %target, min = spec.min_replicas, max = spec.max_replicas, "scale target annotated");
        } else {
            debug!(machineautoscaler = %owner, scale_target = %target, "scale target up to date");
        }
        self.release(&owner, Some(&target)).await?;
        Ok(Action::await_change())
    }
}

/// Mapper from a scale target back to the MachineAutoscaler named in its owner annotation.
fn map_from_owner_annotation(owner: Arc<KindCodec>) -> impl Fn(&ChangeEvent) -> Vec<ObjectKey> + Send + Sync + 'static {
    move |ev: &ChangeEvent| {
        annotation(&ev.object.raw, OWNER_ANNOTATION)
            .and_then(|v| v.split_once('/'))
            .map(|(ns, name)| vec![owner.key(Some(ns), name)])
            .unwrap_or_default()
    }
}

/// Register the MachineAutoscaler controller, watching MachineSets and
/// MachineDeployments as scale targets.
pub fn add_to_manager(manager: &mut Manager, opts: ControllerOptions) -> Result<(), RegistrationError> {
    add_with_targets(manager, opts, vec![apis::machine_set(), apis::machine_deployment()])
}

pub fn add_with_targets(manager: &mut Manager, opts: ControllerOptions, targets: Vec<ResourceKind>) -> Result<(), RegistrationError> {
    let owner = codec_for(manager, CONTROLLER_NAME, apis::machine_autoscaler())?;
    let targets = targets
        .into_iter()
        .map(|kind| codec_for(manager, CONTROLLER_NAME, kind))
        .collect::<Result<Vec<_>, _>>()?;
    let reconciler = MachineAutoscalerReconciler::new(Arc::clone(manager.client()), Arc::clone(manager.cache()), targets.clone());
    let mut controller = Controller::new(CONTROLLER_NAME, owner.kind().clone(), reconciler).with_options(opts);
    for target in &targets {
        controller = controller.watches(target.kind().clone(), map_from_owner_annotation(Arc::clone(&owner)));
    }
    controller.add_to_manager(manager)
}
