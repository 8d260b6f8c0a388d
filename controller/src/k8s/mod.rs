pub mod labels;
mod lock;
pub mod serving;
mod watch;

pub use self::{
    lock::{Lock, LockHandle, ACQUIRE_TIMEOUT},
    watch::{Event, Watch},
};
use direktiv_functions_core::Error;
pub use k8s_openapi::{
    api::{
        batch::v1::Job,
        core::v1::{ConfigMap, Pod, Secret},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
pub use kube::api::{
    Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy,
};
pub use kube::ResourceExt;

/// Capability handles over the cluster API, scoped to the namespace this
/// control plane runs in.
#[derive(Clone)]
pub struct Cluster {
    client: kube::Client,
    namespace: String,
}

// === impl Cluster ===

impl Cluster {
    pub async fn connect(namespace: impl Into<String>) -> anyhow::Result<Self> {
        let client = kube::Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }

    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn services(&self) -> Api<serving::Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn revisions(&self) -> Api<serving::Revision> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn watch_services(&self, params: ListParams) -> Watch<serving::Service> {
        Watch::new(self.services(), params)
    }

    pub fn watch_revisions(&self, params: ListParams) -> Watch<serving::Revision> {
        Watch::new(self.revisions(), params)
    }

    pub fn watch_pods(&self, params: ListParams) -> Watch<Pod> {
        Watch::new(self.pods(), params)
    }

    pub fn watch_jobs(&self, params: ListParams) -> Watch<Job> {
        Watch::new(self.jobs(), params)
    }
}

/// Maps a cluster API failure onto the RPC error taxonomy. `what` names the
/// object the call concerned.
pub fn api_error(error: kube::Error, what: &str) -> Error {
    match error {
        kube::Error::Api(e) => match e.code {
            404 => Error::NotFound(what.to_string()),
            409 => Error::AlreadyExists(what.to_string()),
            401 | 403 => Error::Unauthorized(e.message),
            500..=599 => Error::Transient(e.message),
            _ => Error::Internal(anyhow::Error::new(e)),
        },
        error => Error::Internal(error.into()),
    }
}
