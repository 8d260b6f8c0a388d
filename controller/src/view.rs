//! Computes the summaries surfaced to RPC callers from raw cluster objects:
//! scalar status from conditions, replica counts, and traffic percents
//! coalesced across duplicate targets.

use crate::build::USER_CONTAINER;
use crate::k8s::{labels, serving, Pod, ResourceExt};
use direktiv_functions_grpc as proto;
use std::collections::HashMap;

pub fn conditions(list: &[serving::Condition]) -> Vec<proto::Condition> {
    list.iter()
        .map(|c| proto::Condition {
            name: c.type_.clone(),
            status: c.status.clone(),
            reason: c.reason.clone().unwrap_or_default(),
            message: c.message.clone().unwrap_or_default(),
        })
        .collect()
}

/// Reconstructs the logical definition a service was built from.
pub fn function_definition(svc: &serving::Service) -> proto::FunctionDefinition {
    let meta = &svc.metadata;
    let label = |key: &str| meta.labels.get(key).cloned().unwrap_or_default();
    let annotation = |key: &str| meta.annotations.get(key).cloned().unwrap_or_default();

    let mut fd = proto::FunctionDefinition {
        namespace: label(labels::NAMESPACE_ID),
        namespace_name: label(labels::NAMESPACE_NAME),
        workflow: label(labels::WORKFLOW_ID),
        path: label(labels::WORKFLOW_NAME),
        name: label(labels::NAME),
        size: annotation(labels::ANNOTATION_SIZE).parse().unwrap_or(0),
        min_scale: annotation(labels::ANNOTATION_SCALE).parse().unwrap_or(0),
        ..Default::default()
    };

    if let Some(user) = svc
        .spec
        .template
        .spec
        .containers
        .iter()
        .find(|c| c.name == USER_CONTAINER)
    {
        fd.image = user.image.clone().unwrap_or_default();
        fd.cmd = shell_words::join(user.command.iter().map(String::as_str));
        fd.envs = user
            .env
            .iter()
            .filter(|e| !matches!(e.name.as_str(), "HTTP_PROXY" | "HTTPS_PROXY" | "NO_PROXY"))
            .map(|e| proto::EnvVar {
                name: e.name.clone(),
                value: e.value.clone().unwrap_or_default(),
            })
            .collect();
    }

    fd
}

pub fn function_info(svc: &serving::Service) -> proto::FunctionInfo {
    let status = svc.status.as_ref();
    let conds = status.map(|s| s.conditions.as_slice()).unwrap_or_default();
    proto::FunctionInfo {
        service_name: svc.name(),
        info: Some(function_definition(svc)),
        status: serving::ready_status(conds),
        conditions: conditions(conds),
    }
}

/// Sums traffic percents per concrete revision, coalescing duplicate targets.
pub fn coalesced_traffic(targets: &[serving::TrafficTarget]) -> HashMap<String, i64> {
    let mut traffic = HashMap::new();
    for target in targets {
        if let Some(revision) = target.revision_name.as_ref() {
            *traffic.entry(revision.clone()).or_insert(0) += target.percent.unwrap_or(0);
        }
    }
    traffic
}

/// The revision's configuration generation, as stamped by the cluster.
pub fn revision_generation(rev: &serving::Revision) -> i64 {
    rev.metadata
        .labels
        .get(labels::KNATIVE_CONFIGURATION_GENERATION)
        .and_then(|g| g.parse().ok())
        .unwrap_or(0)
}

pub fn revision_created(rev: &serving::Revision) -> i64 {
    rev.metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0.timestamp())
        .unwrap_or(0)
}

pub fn revision_summary(
    rev: &serving::Revision,
    traffic: &HashMap<String, i64>,
) -> proto::Revision {
    let name = rev.name();
    let status = rev.status.as_ref();
    let conds = status.map(|s| s.conditions.as_slice()).unwrap_or_default();
    let annotation = |key: &str| {
        rev.metadata
            .annotations
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };

    let mut summary = proto::Revision {
        generation: revision_generation(rev),
        created: revision_created(rev),
        status: serving::ready_status(conds),
        conditions: conditions(conds),
        actual_replicas: status.and_then(|s| s.actual_replicas).unwrap_or(0) as i64,
        desired_replicas: status.and_then(|s| s.desired_replicas).unwrap_or(0) as i64,
        traffic: traffic.get(&name).copied().unwrap_or(0),
        size: annotation(labels::ANNOTATION_SIZE),
        min_scale: annotation(labels::KNATIVE_MIN_SCALE),
        name,
        ..Default::default()
    };

    if let Some(user) = rev
        .spec
        .containers
        .iter()
        .find(|c| c.name == USER_CONTAINER)
    {
        summary.image = user.image.clone().unwrap_or_default();
        summary.cmd = shell_words::join(user.command.iter().map(String::as_str));
    }

    summary
}

pub fn pod_info(pod: &Pod) -> proto::PodInfo {
    proto::PodInfo {
        name: pod.name(),
        status: pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default(),
        service_name: pod
            .metadata
            .labels
            .get(labels::KNATIVE_SERVICE)
            .cloned()
            .unwrap_or_default(),
        service_revision: pod
            .metadata
            .labels
            .get(labels::KNATIVE_REVISION)
            .cloned()
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::Builder;
    use crate::config::Config;
    use direktiv_functions_core::{FunctionDefinition, ServiceIdentity, Size};
    use std::sync::Arc;

    fn mk_definition() -> FunctionDefinition {
        FunctionDefinition {
            namespace: "ns-uid-1".into(),
            namespace_name: "n1".into(),
            workflow: String::new(),
            path: String::new(),
            name: "echo".into(),
            image: "alpine".into(),
            cmd: "sh -c 'echo hi'".into(),
            size: Size::Medium,
            min_scale: 2,
            envs: vec![("GREETING".into(), "hello".into())],
        }
    }

    fn mk_target(revision: Option<&str>, percent: i64) -> serving::TrafficTarget {
        serving::TrafficTarget {
            revision_name: revision.map(Into::into),
            percent: Some(percent),
            ..Default::default()
        }
    }

    #[test]
    fn traffic_coalesces_duplicate_targets() {
        let traffic = coalesced_traffic(&[
            mk_target(Some("r1"), 40),
            mk_target(Some("r2"), 20),
            mk_target(Some("r1"), 30),
            mk_target(None, 10),
        ]);
        assert_eq!(traffic.get("r1"), Some(&70));
        assert_eq!(traffic.get("r2"), Some(&20));
        assert_eq!(traffic.len(), 2);
    }

    #[test]
    fn definition_round_trips_through_a_built_service() {
        let fd = mk_definition();
        let id = ServiceIdentity::new(&fd);
        let builder = Builder::new(Arc::new(Config::default()));
        let svc = builder.service(&fd, &id, &[]).unwrap();

        let got = function_definition(&svc);
        assert_eq!(got.name, "echo");
        assert_eq!(got.namespace_name, "n1");
        assert_eq!(got.image, "alpine");
        assert_eq!(got.cmd, "sh -c 'echo hi'");
        assert_eq!(got.size, 1);
        assert_eq!(got.min_scale, 2);
        assert_eq!(got.envs.len(), 1);
        assert_eq!(got.envs[0].name, "GREETING");
    }

    #[test]
    fn ready_condition_becomes_the_scalar_status() {
        let conds = vec![
            serving::Condition {
                type_: "ConfigurationsReady".into(),
                status: "True".into(),
                ..Default::default()
            },
            serving::Condition {
                type_: "Ready".into(),
                status: "False".into(),
                reason: Some("RevisionMissing".into()),
                ..Default::default()
            },
        ];
        assert_eq!(serving::ready_status(&conds), "False");
        assert_eq!(serving::ready_status(&[]), "Unknown");

        let echoed = conditions(&conds);
        assert_eq!(echoed.len(), 2);
        assert_eq!(echoed[1].reason, "RevisionMissing");
    }
}
