//! Builds the concrete cluster objects — autoscaling services, one-shot jobs,
//! and per-tier resource lists — from a logical function definition plus the
//! global configuration.

use crate::config::Config;
use crate::k8s::{labels, serving};
use direktiv_functions_core::{sanitize_label, Error, FunctionDefinition, Result, ServiceIdentity, Size};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, LocalObjectReference,
    NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, PodSpec, PodTemplateSpec,
    PreferredSchedulingTerm, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const USER_CONTAINER: &str = "direktiv-container";
pub const SIDECAR_CONTAINER: &str = "direktiv-sidecar";
pub const INIT_CONTAINER: &str = "direktiv-init";

const SIDECAR_PORT: i32 = 8890;
const SHARED_VOLUME: &str = "workdir";
const SHARED_DIR: &str = "/mnt/shared";

/// Jobs linger this long after completion before the cluster reaps them.
const JOB_TTL_SECONDS: i32 = 60;

/// Ephemeral-storage limit applied when a tier leaves it unset, MB.
const DEFAULT_DISK_MB: i64 = 4096;

#[derive(Clone)]
pub struct Builder {
    config: Arc<Config>,
    /// Affinity template; deep-copied before per-namespace injection.
    affinity: Affinity,
}

// === impl Builder ===

impl Builder {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            affinity: default_affinity(),
        }
    }

    /// Builds the full service object for a definition that does not exist
    /// yet. All traffic points at the latest revision.
    pub fn service(
        &self,
        fd: &FunctionDefinition,
        id: &ServiceIdentity,
        pull_secrets: &[String],
    ) -> Result<serving::Service> {
        let mut svc = serving::Service::new(
            &id.name,
            serving::ServiceSpec {
                template: self.template(fd, id, pull_secrets)?,
                traffic: vec![serving::TrafficTarget {
                    latest_revision: Some(true),
                    percent: Some(100),
                    ..Default::default()
                }],
            },
        );
        svc.metadata.labels = Some(self.function_labels(fd, id));
        svc.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(
                labels::KNATIVE_VISIBILITY.to_string(),
                labels::KNATIVE_VISIBILITY_CLUSTER_LOCAL.to_string(),
            );
        svc.metadata.annotations = Some(self.service_annotations(fd));
        Ok(svc)
    }

    /// Builds the revision template alone; `update` patches it into an
    /// existing service.
    pub fn template(
        &self,
        fd: &FunctionDefinition,
        id: &ServiceIdentity,
        pull_secrets: &[String],
    ) -> Result<serving::RevisionTemplate> {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            labels::ANNOTATION_SIZE.to_string(),
            fd.size.as_i32().to_string(),
        );
        annotations.insert(
            labels::KNATIVE_MIN_SCALE.to_string(),
            self.config.clamp_scale(fd.min_scale).to_string(),
        );
        annotations.insert(
            labels::KNATIVE_MAX_SCALE.to_string(),
            self.config.max_scale.to_string(),
        );
        if !self.config.net_shape.is_empty() {
            annotations.insert(
                labels::INGRESS_BANDWIDTH.to_string(),
                self.config.net_shape.clone(),
            );
            annotations.insert(
                labels::EGRESS_BANDWIDTH.to_string(),
                self.config.net_shape.clone(),
            );
        }

        let mut containers = vec![self.user_container(fd)?, self.service_sidecar(fd)];
        containers.extend(self.config.additional_containers.iter().cloned());

        Ok(serving::RevisionTemplate {
            metadata: Some(ObjectMeta {
                labels: Some(self.function_labels(fd, id)),
                annotations: Some(annotations),
                ..Default::default()
            }),
            spec: serving::RevisionSpec {
                containers,
                volumes: vec![shared_volume()],
                service_account_name: non_empty(&self.config.service_account),
                image_pull_secrets: local_refs(pull_secrets),
                affinity: Some(self.affinity_for(&fd.namespace_name)),
                runtime_class_name: self.config.runtime_class(),
                container_concurrency: Some(self.config.concurrency),
                timeout_seconds: None,
            },
        })
    }

    /// Builds the one-shot job vehicle for a synchronous invocation.
    pub fn job(
        &self,
        fd: &FunctionDefinition,
        action_id: &str,
        instance_id: &str,
        step: i64,
        pull_secrets: &[String],
    ) -> Result<Job> {
        let mut job_labels = BTreeMap::new();
        job_labels.insert(labels::JOB.to_string(), "true".to_string());
        job_labels.insert(labels::ACTION_ID.to_string(), sanitize_label(action_id));
        job_labels.insert(
            labels::NAMESPACE_NAME.to_string(),
            sanitize_label(&fd.namespace_name),
        );
        job_labels.insert(labels::NAME.to_string(), sanitize_label(&fd.name));

        let sidecar = Container {
            name: SIDECAR_CONTAINER.to_string(),
            image: Some(self.config.sidecar.clone()),
            env: Some(vec![
                env("LIFECYCLE", "run"),
                env("DIREKTIV_ACTION_ID", action_id),
                env("DIREKTIV_INSTANCE_ID", instance_id),
                env("DIREKTIV_STEP", &step.to_string()),
                env("DIREKTIV_NAMESPACE", &fd.namespace_name),
                env("DIREKTIV_FLOW_ENDPOINT", &self.config.flow_service),
            ]),
            volume_mounts: Some(vec![shared_mount()]),
            ..Default::default()
        };

        let init = Container {
            name: INIT_CONTAINER.to_string(),
            image: Some(self.config.init_image().to_string()),
            env: Some(vec![env("LIFECYCLE", "init")]),
            volume_mounts: Some(vec![shared_mount()]),
            ..Default::default()
        };

        Ok(Job {
            metadata: ObjectMeta {
                generate_name: Some("direktiv-job-".to_string()),
                labels: Some(job_labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(job_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![sidecar, self.user_container(fd)?],
                        init_containers: Some(vec![init]),
                        restart_policy: Some("Never".to_string()),
                        service_account_name: non_empty(&self.config.service_account),
                        image_pull_secrets: Some(local_refs(pull_secrets)),
                        volumes: Some(vec![shared_volume()]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// The resource list for a size tier: baseline requests are always
    /// present; a zero CPU limit is omitted and a zero disk limit falls back
    /// to the default.
    pub fn resources(&self, size: Size) -> ResourceRequirements {
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity("0.1".to_string()));
        requests.insert("memory".to_string(), Quantity("64M".to_string()));
        requests.insert("ephemeral-storage".to_string(), Quantity("64M".to_string()));

        let mut limits = BTreeMap::new();
        let memory = self.config.memory.get(size);
        if memory > 0 {
            limits.insert("memory".to_string(), Quantity(format!("{}M", memory)));
        }
        let cpu = self.config.cpu.get(size);
        if cpu > 0.0 {
            limits.insert("cpu".to_string(), Quantity(cpu.to_string()));
        }
        let disk = match self.config.disk.get(size) {
            0 => DEFAULT_DISK_MB,
            disk => disk,
        };
        limits.insert(
            "ephemeral-storage".to_string(),
            Quantity(format!("{}M", disk)),
        );

        ResourceRequirements { limits: Some(limits), requests: Some(requests) }
    }

    fn user_container(&self, fd: &FunctionDefinition) -> Result<Container> {
        let command = shell_words::split(&fd.cmd)
            .map_err(|e| Error::Invalid(format!("cannot parse command {:?}: {}", fd.cmd, e)))?;

        let mut envs: Vec<EnvVar> = fd.envs.iter().map(|(k, v)| env(k, v)).collect();
        envs.extend(self.proxy_envs());

        Ok(Container {
            name: USER_CONTAINER.to_string(),
            image: Some(fd.image.clone()),
            command: Some(command),
            env: Some(envs),
            resources: Some(self.resources(fd.size)),
            volume_mounts: Some(vec![shared_mount()]),
            working_dir: Some(SHARED_DIR.to_string()),
            ..Default::default()
        })
    }

    fn service_sidecar(&self, fd: &FunctionDefinition) -> Container {
        let mut envs = self.proxy_envs();
        envs.push(env("DIREKTIV_FLOW_ENDPOINT", &self.config.flow_service));
        envs.push(env("DIREKTIV_NAMESPACE", &fd.namespace_name));
        if !self.config.opentelemetry_backend.is_empty() {
            envs.push(env(
                "DIREKTIV_OPENTELEMETRY_BACKEND",
                &self.config.opentelemetry_backend,
            ));
        }
        if !self.config.logging.is_empty() {
            envs.push(env("DIREKTIV_LOGGING", &self.config.logging));
        }

        Container {
            name: SIDECAR_CONTAINER.to_string(),
            image: Some(self.config.sidecar.clone()),
            ports: Some(vec![ContainerPort {
                container_port: SIDECAR_PORT,
                ..Default::default()
            }]),
            env: Some(envs),
            volume_mounts: Some(vec![shared_mount()]),
            ..Default::default()
        }
    }

    fn proxy_envs(&self) -> Vec<EnvVar> {
        let proxy = &self.config.proxy;
        [
            ("HTTP_PROXY", &proxy.http),
            ("HTTPS_PROXY", &proxy.https),
            ("NO_PROXY", &proxy.no),
        ]
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| env(*k, v.as_str()))
        .collect()
    }

    fn function_labels(
        &self,
        fd: &FunctionDefinition,
        id: &ServiceIdentity,
    ) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(labels::NAME.to_string(), sanitize_label(&fd.name));
        labels.insert(labels::SCOPE.to_string(), id.scope.as_str().to_string());
        if !fd.namespace.is_empty() {
            labels.insert(
                labels::NAMESPACE_ID.to_string(),
                sanitize_label(&fd.namespace),
            );
        }
        if !fd.namespace_name.is_empty() {
            labels.insert(
                labels::NAMESPACE_NAME.to_string(),
                sanitize_label(&fd.namespace_name),
            );
        }
        if !fd.workflow.is_empty() {
            labels.insert(
                labels::WORKFLOW_ID.to_string(),
                sanitize_label(&fd.workflow),
            );
        }
        if !fd.path.is_empty() {
            labels.insert(labels::WORKFLOW_NAME.to_string(), sanitize_label(&fd.path));
        }
        if !id.revision_hash.is_empty() {
            labels.insert(labels::REVISION.to_string(), id.revision_hash.clone());
        }
        labels
    }

    pub(crate) fn service_annotations(&self, fd: &FunctionDefinition) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            labels::ANNOTATION_SCALE.to_string(),
            self.config.clamp_scale(fd.min_scale).to_string(),
        );
        annotations.insert(
            labels::ANNOTATION_SIZE.to_string(),
            fd.size.as_i32().to_string(),
        );
        if !self.config.ingress_class.is_empty() {
            annotations.insert(
                labels::KNATIVE_INGRESS_CLASS.to_string(),
                self.config.ingress_class.clone(),
            );
        }
        if self.config.rollout_duration > 0 {
            annotations.insert(
                labels::KNATIVE_ROLLOUT_DURATION.to_string(),
                format!("{}s", self.config.rollout_duration),
            );
        }
        annotations
    }

    /// Deep-copies the affinity template and pins its namespace predicate.
    /// Only the first match expression keyed by the namespace label is
    /// rewritten; any other shape is left untouched.
    fn affinity_for(&self, namespace_name: &str) -> Affinity {
        let mut affinity = self.affinity.clone();
        let expr = affinity
            .node_affinity
            .as_mut()
            .and_then(|na| {
                na.preferred_during_scheduling_ignored_during_execution
                    .as_mut()
                    .and_then(|terms| terms.first_mut())
            })
            .and_then(|term| term.preference.match_expressions.as_mut().and_then(|e| e.first_mut()));
        if let Some(expr) = expr {
            if expr.key == labels::NODE_NAMESPACE {
                expr.values = Some(vec![sanitize_label(namespace_name)]);
            }
        }
        affinity
    }
}

fn default_affinity() -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![PreferredSchedulingTerm {
                weight: 100,
                preference: NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: labels::NODE_NAMESPACE.to_string(),
                        operator: "In".to_string(),
                        values: Some(Vec::new()),
                    }]),
                    ..Default::default()
                },
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env(name: impl Into<String>, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn shared_volume() -> Volume {
    Volume {
        name: SHARED_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn shared_mount() -> VolumeMount {
    VolumeMount {
        name: SHARED_VOLUME.to_string(),
        mount_path: SHARED_DIR.to_string(),
        ..Default::default()
    }
}

fn local_refs(names: &[String]) -> Vec<LocalObjectReference> {
    names
        .iter()
        .map(|name| LocalObjectReference {
            name: Some(name.clone()),
        })
        .collect()
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use direktiv_functions_core::Scope;

    fn mk_definition() -> FunctionDefinition {
        FunctionDefinition {
            namespace: "ns-uid-1".into(),
            namespace_name: "n1".into(),
            workflow: String::new(),
            path: String::new(),
            name: "echo".into(),
            image: "alpine".into(),
            cmd: "sh -c 'echo hi there'".into(),
            size: Size::Small,
            min_scale: 1,
            envs: vec![("GREETING".into(), "hello".into())],
        }
    }

    fn mk_builder() -> Builder {
        Builder::new(Arc::new(Config::default()))
    }

    #[test]
    fn service_carries_identity_labels() {
        let fd = mk_definition();
        let id = ServiceIdentity::new(&fd);
        let svc = mk_builder().service(&fd, &id, &[]).unwrap();

        assert_eq!(id.scope, Scope::Namespace);
        let labels = svc.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(labels::SCOPE).unwrap(), "ns");
        assert_eq!(labels.get(labels::NAMESPACE_NAME).unwrap(), "n1");
        assert_eq!(labels.get(labels::NAME).unwrap(), "echo");
        assert_eq!(
            labels.get(labels::KNATIVE_VISIBILITY).unwrap(),
            labels::KNATIVE_VISIBILITY_CLUSTER_LOCAL
        );

        let annotations = svc.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations.get(labels::ANNOTATION_SCALE).unwrap(), "1");
        assert_eq!(annotations.get(labels::ANNOTATION_SIZE).unwrap(), "0");

        // All traffic at the latest revision.
        assert_eq!(svc.spec.traffic.len(), 1);
        assert_eq!(svc.spec.traffic[0].latest_revision, Some(true));
        assert_eq!(svc.spec.traffic[0].percent, Some(100));
    }

    #[test]
    fn min_scale_is_clamped() {
        let mut fd = mk_definition();
        fd.min_scale = 100;
        let id = ServiceIdentity::new(&fd);
        let tmpl = mk_builder().template(&fd, &id, &[]).unwrap();
        let annotations = tmpl.metadata.unwrap().annotations.unwrap();
        assert_eq!(
            annotations.get(labels::KNATIVE_MIN_SCALE).unwrap(),
            &Config::default().max_scale.to_string()
        );
    }

    #[test]
    fn command_splits_shell_words() {
        let fd = mk_definition();
        let id = ServiceIdentity::new(&fd);
        let tmpl = mk_builder().template(&fd, &id, &[]).unwrap();
        let user = tmpl
            .spec
            .containers
            .iter()
            .find(|c| c.name == USER_CONTAINER)
            .unwrap();
        assert_eq!(user.command.clone().unwrap(), vec!["sh", "-c", "echo hi there"]);
    }

    #[test]
    fn unbalanced_command_is_invalid() {
        let mut fd = mk_definition();
        fd.cmd = "sh -c 'oops".into();
        let id = ServiceIdentity::new(&fd);
        assert!(matches!(
            mk_builder().template(&fd, &id, &[]),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn resources_carry_baseline_requests() {
        let res = mk_builder().resources(Size::Small);
        assert_eq!(res.requests.get("cpu").unwrap().0, "0.1");
        assert_eq!(res.requests.get("memory").unwrap().0, "64M");
        assert_eq!(res.requests.get("ephemeral-storage").unwrap().0, "64M");
        assert_eq!(res.limits.get("memory").unwrap().0, "256M");
    }

    #[test]
    fn zero_cpu_limit_is_omitted_and_disk_defaults() {
        let mut config = Config::default();
        config.cpu.small = 0.0;
        config.disk.small = 0;
        let builder = Builder::new(Arc::new(config));
        let res = builder.resources(Size::Small);
        assert!(res.limits.get("cpu").is_none());
        assert_eq!(res.limits.get("ephemeral-storage").unwrap().0, "4096M");
    }

    #[test]
    fn affinity_injects_namespace_predicate() {
        let fd = mk_definition();
        let id = ServiceIdentity::new(&fd);
        let builder = mk_builder();
        let tmpl = builder.template(&fd, &id, &[]).unwrap();
        let affinity = tmpl.spec.affinity.unwrap();
        let expr = &affinity
            .node_affinity
            .unwrap()
            .preferred_during_scheduling_ignored_during_execution
            .unwrap()[0]
            .preference
            .match_expressions
            .as_ref()
            .unwrap()[0];
        assert_eq!(expr.key, labels::NODE_NAMESPACE);
        assert_eq!(expr.values.as_ref().unwrap(), &vec!["n1".to_string()]);

        // The template itself is left untouched.
        let expr = &builder
            .affinity
            .node_affinity
            .as_ref()
            .unwrap()
            .preferred_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap()[0]
            .preference
            .match_expressions
            .as_ref()
            .unwrap()[0];
        assert!(expr.values.as_ref().unwrap().is_empty());
    }

    #[test]
    fn affinity_with_foreign_key_is_untouched() {
        let fd = mk_definition();
        let mut builder = mk_builder();
        builder
            .affinity
            .node_affinity
            .as_mut()
            .unwrap()
            .preferred_during_scheduling_ignored_during_execution
            .as_mut()
            .unwrap()[0]
            .preference
            .match_expressions
            .as_mut()
            .unwrap()[0]
            .key = "kubernetes.io/hostname".to_string();

        let id = ServiceIdentity::new(&fd);
        let tmpl = builder.template(&fd, &id, &[]).unwrap();
        let affinity = tmpl.spec.affinity.unwrap();
        let expr = &affinity
            .node_affinity
            .unwrap()
            .preferred_during_scheduling_ignored_during_execution
            .unwrap()[0]
            .preference
            .match_expressions
            .as_ref()
            .unwrap()[0];
        assert!(expr.values.as_ref().unwrap().is_empty());
    }

    #[test]
    fn job_shape() {
        let fd = mk_definition();
        let job = mk_builder()
            .job(&fd, "action-1", "instance-1", 3, &["pull-1".into()])
            .unwrap();

        assert_eq!(job.metadata.generate_name.as_deref(), Some("direktiv-job-"));
        let job_labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(job_labels.get(labels::JOB).unwrap(), "true");
        assert_eq!(
            job_labels.get(labels::ACTION_ID).unwrap(),
            "action-1"
        );

        let spec = job.spec.unwrap();
        assert_eq!(spec.ttl_seconds_after_finished, Some(60));
        assert_eq!(spec.backoff_limit, Some(0));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.image_pull_secrets.as_ref().unwrap().len(), 1);

        let init = &pod.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.env.as_ref().unwrap()[0].name, "LIFECYCLE");
        assert_eq!(init.env.as_ref().unwrap()[0].value.as_deref(), Some("init"));

        let sidecar = pod
            .containers
            .iter()
            .find(|c| c.name == SIDECAR_CONTAINER)
            .unwrap();
        let lifecycle = sidecar.env.as_ref().unwrap().iter().find(|e| e.name == "LIFECYCLE").unwrap();
        assert_eq!(lifecycle.value.as_deref(), Some("run"));
        let step = sidecar
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == "DIREKTIV_STEP")
            .unwrap();
        assert_eq!(step.value.as_deref(), Some("3"));

        assert!(pod.containers.iter().any(|c| c.name == USER_CONTAINER));
    }
}
