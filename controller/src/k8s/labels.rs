//! Label and annotation keys written to cluster objects. These are
//! wire-compatible with the operators that already consume them; changing a
//! key is a breaking change.

pub const NAME: &str = "direktiv.io/name";
pub const NAMESPACE_ID: &str = "direktiv.io/namespace-id";
pub const NAMESPACE_NAME: &str = "direktiv.io/namespace-name";
pub const WORKFLOW_ID: &str = "direktiv.io/workflow-id";
pub const WORKFLOW_NAME: &str = "direktiv.io/workflow-name";
pub const REVISION: &str = "direktiv.io/revision";
pub const SCOPE: &str = "direktiv.io/scope";
pub const JOB: &str = "direktiv.io/job";
pub const ACTION_ID: &str = "direktiv.io/action-id";

/// Affinity predicates key node pools by the namespace that owns them.
pub const NODE_NAMESPACE: &str = "direktiv.io/namespace";

pub const REGISTRY_NAMESPACE: &str = "direktiv.io/namespace";
pub const REGISTRY_URL_HASH: &str = "direktiv.io/urlhash";
pub const REGISTRY_TYPE: &str = "direktiv.io/registry-type";
pub const REGISTRY_TYPE_NAMESPACE: &str = "namespace";

pub const ANNOTATION_SCALE: &str = "direktiv.io/scale";
pub const ANNOTATION_SIZE: &str = "direktiv.io/size";
pub const ANNOTATION_URL: &str = "direktiv.io/url";
pub const ANNOTATION_URL_HASH: &str = "direktiv.io/urlhash";
pub const ANNOTATION_OBF_USER: &str = "direktiv.io/obf-user";

pub const KNATIVE_MIN_SCALE: &str = "autoscaling.knative.dev/minScale";
pub const KNATIVE_MAX_SCALE: &str = "autoscaling.knative.dev/maxScale";
pub const KNATIVE_INGRESS_CLASS: &str = "networking.knative.dev/ingress.class";
pub const KNATIVE_VISIBILITY: &str = "networking.knative.dev/visibility";
pub const KNATIVE_VISIBILITY_CLUSTER_LOCAL: &str = "cluster-local";
pub const KNATIVE_ROLLOUT_DURATION: &str = "serving.knative.dev/rollout-duration";
pub const KNATIVE_SERVICE: &str = "serving.knative.dev/service";
pub const KNATIVE_REVISION: &str = "serving.knative.dev/revision";
pub const KNATIVE_CONFIGURATION_GENERATION: &str = "serving.knative.dev/configurationGeneration";

pub const INGRESS_BANDWIDTH: &str = "kubernetes.io/ingress-bandwidth";
pub const EGRESS_BANDWIDTH: &str = "kubernetes.io/egress-bandwidth";

/// Added by the job controller to every pod a job owns.
pub const JOB_NAME: &str = "job-name";

/// Renders `k=v` pairs as a label selector.
pub fn selector<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k.as_ref(), v.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_renders_pairs() {
        assert_eq!(selector(Vec::<(&str, &str)>::new()), "");
        assert_eq!(
            selector(vec![(SCOPE, "ns"), (NAMESPACE_NAME, "n1")]),
            "direktiv.io/scope=ns,direktiv.io/namespace-name=n1"
        );
    }
}
