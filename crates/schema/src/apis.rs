//! Kinds the operator watches, and their registration.

use k8s_openapi::api::apps::v1::Deployment;

use cao_core::ResourceKind;

use crate::{KindCodec, RegistryBuilder, RegistryError};

pub const AUTOSCALING_GROUP: &str = "autoscaling.openshift.io";
pub const MACHINE_GROUP: &str = "machine.openshift.io";

pub fn cluster_autoscaler() -> ResourceKind {
    ResourceKind::new(AUTOSCALING_GROUP, "v1", "ClusterAutoscaler")
}

pub fn machine_autoscaler() -> ResourceKind {
    ResourceKind::new(AUTOSCALING_GROUP, "v1beta1", "MachineAutoscaler")
}

pub fn machine_set() -> ResourceKind {
    ResourceKind::new(MACHINE_GROUP, "v1beta1", "MachineSet")
}

pub fn machine_deployment() -> ResourceKind {
    ResourceKind::new(MACHINE_GROUP, "v1beta1", "MachineDeployment")
}

pub fn deployment() -> ResourceKind {
    KindCodec::of::<Deployment>(true).kind().clone()
}

/// Register every kind the operator's controllers work with.
pub fn add_to_registry(builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
    builder.register(KindCodec::new(cluster_autoscaler(), "clusterautoscalers", false))?;
    builder.register(KindCodec::new(machine_autoscaler(), "machineautoscalers", true))?;
    builder.register(KindCodec::new(machine_set(), "machinesets", true))?;
    builder.register(KindCodec::new(machine_deployment(), "machinedeployments", true))?;
    builder.register(KindCodec::of::<Deployment>(true))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_operator_kinds_once() {
        let mut b = RegistryBuilder::new();
        add_to_registry(&mut b).expect("first registration");
        assert!(matches!(add_to_registry(&mut b), Err(RegistryError::DuplicateKind(_))));
        let reg = b.build();
        assert_eq!(reg.len(), 5);
        let dep = reg.lookup(&deployment()).expect("deployment");
        assert_eq!(dep.plural(), "deployments");
        assert_eq!(dep.kind().api_version(), "apps/v1");
        assert!(!reg.lookup(&cluster_autoscaler()).expect("ca").namespaced());
    }

    #[test]
    fn typed_decode_fills_missing_type_meta() {
        let codec = KindCodec::of::<Deployment>(true);
        let d: Deployment = codec
            .decode_value(serde_json::json!({
                "metadata": {"name": "cluster-autoscaler-default", "namespace": "openshift-cluster-api"},
                "spec": {"replicas": 2, "selector": {}, "template": {}},
            }))
            .expect("typed");
        assert_eq!(d.spec.and_then(|s| s.replicas), Some(2));
    }
}
