use direktiv_functions_core::Size;
use k8s_openapi::api::core::v1::Container;
use serde::Deserialize;
use std::path::Path;

/// Control plane configuration, read once at startup from a YAML file.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Service account assigned to function pods.
    pub service_account: String,
    /// The cluster namespace this control plane schedules workloads into.
    pub namespace: String,
    /// Sidecar container image.
    pub sidecar: String,
    /// Init container image; falls back to the sidecar image when empty.
    pub init_pod: String,
    /// Historical revisions retained per service.
    pub keep_revisions: usize,
    /// Per-namespace cap on in-flight one-shot jobs.
    pub max_jobs: usize,
    /// Cluster-wide replica ceiling; min-scale is clamped to it.
    pub max_scale: i32,
    /// Bandwidth annotation applied to function pods; empty disables shaping.
    pub net_shape: String,
    /// Traffic rollout duration, seconds.
    pub rollout_duration: i64,
    /// Per-revision request concurrency.
    pub concurrency: i64,
    /// Runtime class for function pods; `default` leaves the cluster default.
    pub runtime: String,
    /// Enables the periodic job cleaner.
    pub pod_cleaner: bool,
    /// Memory limits per tier, MB.
    pub memory: SizeTiers<i64>,
    /// CPU limits per tier, cores.
    pub cpu: SizeTiers<f64>,
    /// Ephemeral storage limits per tier, MB.
    pub disk: SizeTiers<i64>,
    pub proxy: Proxy,
    pub ingress_class: String,
    /// Logging mode passed to the sidecar; empty for the default.
    pub logging: String,
    pub opentelemetry_backend: String,
    /// Workflow engine endpoint the sidecar reports to.
    pub flow_service: String,
    /// Containers appended verbatim to every service.
    #[serde(rename = "additionalContainers")]
    pub additional_containers: Vec<Container>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SizeTiers<T> {
    pub small: T,
    pub medium: T,
    pub large: T,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Proxy {
    pub http: String,
    pub https: String,
    pub no: String,
}

// === impl Config ===

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// The runtime class to request, if any.
    pub fn runtime_class(&self) -> Option<String> {
        match self.runtime.as_str() {
            "" | "default" => None,
            runtime => Some(runtime.to_string()),
        }
    }

    /// The init container image, defaulting to the sidecar image.
    pub fn init_image(&self) -> &str {
        if self.init_pod.is_empty() {
            &self.sidecar
        } else {
            &self.init_pod
        }
    }

    /// Clamps a requested min-scale to the cluster-wide ceiling.
    pub fn clamp_scale(&self, min_scale: i32) -> i32 {
        min_scale.min(self.max_scale).max(0)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_account: "direktiv-functions-pod".to_string(),
            namespace: "direktiv-services-direktiv".to_string(),
            sidecar: "direktiv/sidecar".to_string(),
            init_pod: String::new(),
            keep_revisions: 3,
            max_jobs: 5,
            max_scale: 3,
            net_shape: String::new(),
            rollout_duration: 10,
            concurrency: 100,
            runtime: "default".to_string(),
            pod_cleaner: true,
            memory: SizeTiers {
                small: 256,
                medium: 512,
                large: 1024,
            },
            cpu: SizeTiers {
                small: 0.25,
                medium: 0.5,
                large: 1.0,
            },
            disk: SizeTiers {
                small: 256,
                medium: 512,
                large: 1024,
            },
            proxy: Proxy::default(),
            ingress_class: "contour.ingress.networking.knative.dev".to_string(),
            logging: String::new(),
            opentelemetry_backend: String::new(),
            flow_service: "direktiv-flow:6666".to_string(),
            additional_containers: Vec::new(),
        }
    }
}

// === impl SizeTiers ===

impl<T: Copy> SizeTiers<T> {
    pub fn get(&self, size: Size) -> T {
        match size {
            Size::Small => self.small,
            Size::Medium => self.medium,
            Size::Large => self.large,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enumerated_keys() {
        let raw = r#"
service-account: functions
namespace: direktiv-services
sidecar: reg.example.com/sidecar:v1
keep-revisions: 2
max-jobs: 4
max-scale: 5
rollout-duration: 20
concurrency: 50
runtime: gvisor
pod-cleaner: false
memory:
  small: 128
  medium: 256
  large: 512
cpu:
  small: 0.1
  medium: 0.5
  large: 2.0
proxy:
  http: http://proxy:3128
  no: localhost
ingress-class: kourier.ingress.networking.knative.dev
flow-service: flow:6666
"#;
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.keep_revisions, 2);
        assert_eq!(config.max_jobs, 4);
        assert_eq!(config.runtime_class().as_deref(), Some("gvisor"));
        assert!(!config.pod_cleaner);
        assert_eq!(config.memory.get(Size::Medium), 256);
        assert_eq!(config.proxy.http, "http://proxy:3128");
        // Unset keys keep their defaults.
        assert_eq!(config.disk.get(Size::Small), 256);
    }

    #[test]
    fn clamp() {
        let config = Config::default();
        assert_eq!(config.clamp_scale(1), 1);
        assert_eq!(config.clamp_scale(10), config.max_scale);
        assert_eq!(config.clamp_scale(-1), 0);
    }

    #[test]
    fn runtime_default_is_unset() {
        let config = Config::default();
        assert_eq!(config.runtime_class(), None);
    }
}
