use std::time::Duration;

use clap::{ArgAction, Parser};

use cao_controllers::ClusterAutoscalerConfig;
use cao_runtime::{Backoff, ControllerOptions, ManagerOptions};

#[derive(Parser, Debug, Clone)]
#[command(name = "cluster-autoscaler-operator", version, about = "Manages cluster-autoscaler deployments and MachineAutoscaler scale targets")]
pub struct Config {
    /// Namespace to watch; empty watches all namespaces
    #[arg(long = "watch-namespace", env = "WATCH_NAMESPACE", default_value = "")]
    pub watch_namespace: String,

    /// Name of the ClusterAutoscaler resource to act on
    #[arg(long = "cluster-autoscaler-name", env = "CLUSTER_AUTOSCALER_NAME", default_value = "default")]
    pub ca_name: String,

    #[arg(long = "cluster-autoscaler-image", env = "CLUSTER_AUTOSCALER_IMAGE", default_value = "quay.io/openshift/origin-cluster-autoscaler:v4.0")]
    pub ca_image: String,

    #[arg(long = "cluster-autoscaler-replicas", env = "CLUSTER_AUTOSCALER_REPLICAS", default_value_t = 1)]
    pub ca_replicas: i32,

    /// Namespace the cluster-autoscaler Deployment is created in
    #[arg(long = "cluster-autoscaler-namespace", env = "CLUSTER_AUTOSCALER_NAMESPACE", default_value = "openshift-cluster-api")]
    pub ca_namespace: String,

    /// Reconcile workers per controller
    #[arg(long = "workers", env = "CAO_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Grace period for in-flight reconciles on shutdown
    #[arg(long = "drain-timeout-secs", env = "CAO_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,

    #[arg(long = "backoff-base-ms", default_value_t = 5)]
    pub backoff_base_ms: u64,

    #[arg(long = "backoff-max-secs", default_value_t = 1000)]
    pub backoff_max_secs: u64,

    /// Fraction of each retry delay added as random jitter, clamped to [0, 1]
    #[arg(long = "backoff-jitter", default_value_t = 0.1)]
    pub backoff_jitter: f64,

    /// Full relist period; 0 disables periodic resync
    #[arg(long = "resync-period-secs", default_value_t = 0)]
    pub resync_period_secs: u64,

    /// Capacity of each change notification channel
    #[arg(long = "channel-capacity", env = "CAO_CHANNEL_CAPACITY", default_value_t = 1024)]
    pub channel_capacity: usize,

    /// Prometheus exporter listen address (host:port)
    #[arg(long = "metrics-addr", env = "CAO_METRICS_ADDR")]
    pub metrics_addr: Option<String>,

    /// Log as JSON lines
    #[arg(long = "log-json", action = ArgAction::SetTrue)]
    pub log_json: bool,
}

impl Config {
    pub fn namespace(&self) -> Option<String> {
        let ns = self.watch_namespace.trim();
        if ns.is_empty() { None } else { Some(ns.to_string()) }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            namespace: self.namespace(),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            channel_capacity: self.channel_capacity.max(1),
            resync_period: (self.resync_period_secs > 0).then(|| Duration::from_secs(self.resync_period_secs)),
            ..ManagerOptions::default()
        }
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            workers: self.workers.max(1),
            backoff: Backoff::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_secs(self.backoff_max_secs),
                self.backoff_jitter,
            ),
        }
    }

    pub fn cluster_autoscaler(&self) -> ClusterAutoscalerConfig {
        ClusterAutoscalerConfig {
            name: self.ca_name.clone(),
            image: self.ca_image.clone(),
            replicas: self.ca_replicas,
            namespace: self.ca_namespace.clone(),
        }
    }
}
