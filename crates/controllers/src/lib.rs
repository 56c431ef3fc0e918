//! cao controllers: the ClusterAutoscaler and MachineAutoscaler reconcilers
//! and their registration with a [`Manager`].

#![forbid(unsafe_code)]

use std::sync::Arc;

use cao_core::ResourceKind;
use cao_runtime::{ControllerOptions, Manager, RegistrationError};
use cao_schema::KindCodec;

pub mod clusterautoscaler;
pub mod machineautoscaler;

pub use clusterautoscaler::{ClusterAutoscalerConfig, ClusterAutoscalerReconciler};
pub use machineautoscaler::MachineAutoscalerReconciler;

/// Register both controllers with `manager`.
pub fn add_to_manager(manager: &mut Manager, ca: ClusterAutoscalerConfig, opts: ControllerOptions) -> Result<(), RegistrationError> {
    clusterautoscaler::add_to_manager(manager, ca, opts.clone())?;
    machineautoscaler::add_to_manager(manager, opts)
}

pub(crate) fn codec_for(manager: &Manager, controller: &str, kind: ResourceKind) -> Result<Arc<KindCodec>, RegistrationError> {
    manager
        .registry()
        .lookup(&kind)
        .map_err(|_| RegistrationError::UnknownKind { controller: controller.to_string(), kind })
}
