//! The function manager: the RPC-facing CRUD surface over autoscaling
//! services. Mutations of one service are serialized through the distributed
//! lock keyed on the service name; operations on different services proceed
//! in parallel.

#[cfg(test)]
mod tests;

use crate::build::Builder;
use crate::config::Config;
use crate::k8s::{
    api_error, labels, serving, Cluster, DeleteParams, ListParams, Lock, LockHandle, Patch,
    PatchParams, Pod, PostParams, ResourceExt, ACQUIRE_TIMEOUT,
};
use crate::registry::Registry;
use crate::view;
use direktiv_functions_core::{Error, FunctionDefinition, Result, Scope, ServiceIdentity};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

pub struct Manager {
    cluster: Cluster,
    builder: Builder,
    registry: Registry,
    lock: Lock,
    config: Arc<Config>,
}

// === impl Manager ===

impl Manager {
    pub fn new(
        cluster: Cluster,
        builder: Builder,
        registry: Registry,
        lock: Lock,
        config: Arc<Config>,
    ) -> Self {
        Self {
            cluster,
            builder,
            registry,
            lock,
            config,
        }
    }

    #[instrument(skip(self, fd), fields(name = %fd.name, namespace = %fd.namespace_name))]
    pub async fn create(&self, fd: &FunctionDefinition) -> Result<()> {
        fd.validate()?;
        let id = ServiceIdentity::new(fd);
        let lock = self.lock.acquire(&id.name, false, ACQUIRE_TIMEOUT).await?;
        let result = self.create_locked(fd, &id).await;
        self.release(&lock).await;
        result
    }

    async fn create_locked(&self, fd: &FunctionDefinition, id: &ServiceIdentity) -> Result<()> {
        let services = self.cluster.services();
        match services.get(&id.name).await {
            Ok(_) => Err(Error::AlreadyExists(id.name.clone())),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                let pull = self.registry.pull_secret_names(tenant(fd)).await?;
                let svc = self.builder.service(fd, id, &pull)?;
                services
                    .create(&PostParams::default(), &svc)
                    .await
                    .map_err(|e| api_error(e, &id.name))?;
                debug!(service = %id.name, scope = %id.scope, "Created service");
                Ok(())
            }
            Err(error) => Err(api_error(error, &id.name)),
        }
    }

    #[instrument(skip(self, fd), fields(service = %name))]
    pub async fn update(
        &self,
        name: &str,
        fd: &FunctionDefinition,
        traffic_percent: i64,
    ) -> Result<()> {
        if !(0..=100).contains(&traffic_percent) {
            return Err(Error::Invalid(format!(
                "traffic percent out of range: {}",
                traffic_percent
            )));
        }
        fd.validate()?;
        let lock = self.lock.acquire(name, false, ACQUIRE_TIMEOUT).await?;
        let result = self.update_locked(name, fd, traffic_percent).await;
        self.release(&lock).await;
        result
    }

    async fn update_locked(
        &self,
        name: &str,
        fd: &FunctionDefinition,
        traffic_percent: i64,
    ) -> Result<()> {
        let services = self.cluster.services();
        let svc = services.get(name).await.map_err(|e| api_error(e, name))?;

        let id = ServiceIdentity::new(fd);
        let pull = self.registry.pull_secret_names(tenant(fd)).await?;
        let template = self.builder.template(fd, &id, &pull)?;
        let traffic = shift_traffic(&existing_targets(&svc), traffic_percent);

        let patch = serde_json::json!({
            "metadata": { "annotations": self.builder.service_annotations(fd) },
            "spec": { "template": template, "traffic": traffic },
        });
        services
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error(e, name))?;

        let in_use = traffic
            .iter()
            .chain(existing_targets(&svc).iter())
            .filter_map(|t| t.revision_name.clone())
            .collect::<HashSet<_>>();
        self.prune(name, &in_use).await
    }

    /// Deletes the oldest unreferenced revisions beyond the keep count.
    async fn prune(&self, name: &str, in_use: &HashSet<String>) -> Result<()> {
        let api = self.cluster.revisions();
        let params =
            ListParams::default().labels(&labels::selector(vec![(labels::KNATIVE_SERVICE, name)]));
        let mut revisions = api
            .list(&params)
            .await
            .map_err(|e| api_error(e, name))?
            .items;
        sort_oldest_first(&mut revisions);

        for victim in prune_candidates(&revisions, in_use, self.config.keep_revisions) {
            match api.delete(&victim, &DeleteParams::default()).await {
                Ok(_) => debug!(service = %name, revision = %victim, "Pruned revision"),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(error) => return Err(api_error(error, &victim)),
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let lock = self.lock.acquire(name, false, ACQUIRE_TIMEOUT).await?;
        let result = self
            .cluster
            .services()
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| api_error(e, name));
        self.release(&lock).await;
        result
    }

    /// Bulk-deletes every service matching the selector, e.g. on namespace
    /// teardown.
    #[instrument(skip(self, selector_labels))]
    pub async fn delete_many(&self, selector_labels: &HashMap<String, String>) -> Result<()> {
        let selector = labels::selector(selector_labels.iter());
        let params = ListParams::default().labels(&selector);
        self.cluster
            .services()
            .delete_collection(&DeleteParams::default(), &params)
            .await
            .map(|_| ())
            .map_err(|e| api_error(e, &selector))
    }

    #[instrument(skip(self, targets), fields(service = %name))]
    pub async fn set_traffic(&self, name: &str, targets: &[(String, i64)]) -> Result<()> {
        let total: i64 = targets.iter().map(|(_, pct)| pct).sum();
        if total != 100 {
            return Err(Error::Invalid(format!(
                "traffic percents must sum to 100, got {}",
                total
            )));
        }

        let lock = self.lock.acquire(name, false, ACQUIRE_TIMEOUT).await?;
        let result = self.set_traffic_locked(name, targets).await;
        self.release(&lock).await;
        result
    }

    async fn set_traffic_locked(&self, name: &str, targets: &[(String, i64)]) -> Result<()> {
        let services = self.cluster.services();
        let svc = services.get(name).await.map_err(|e| api_error(e, name))?;

        let api = self.cluster.revisions();
        let params =
            ListParams::default().labels(&labels::selector(vec![(labels::KNATIVE_SERVICE, name)]));
        let known = api
            .list(&params)
            .await
            .map_err(|e| api_error(e, name))?
            .items
            .iter()
            .map(|r| r.name())
            .collect::<HashSet<_>>();
        for (revision, _) in targets {
            if !known.contains(revision) {
                return Err(Error::Invalid(format!("unknown revision: {}", revision)));
            }
        }

        let latest_ready = svc
            .status
            .as_ref()
            .and_then(|s| s.latest_ready_revision_name.clone());
        let traffic = targets
            .iter()
            .map(|(revision, percent)| serving::TrafficTarget {
                revision_name: Some(revision.clone()),
                percent: Some(*percent),
                latest_revision: Some(Some(revision) == latest_ready.as_ref()),
                tag: None,
            })
            .collect::<Vec<_>>();

        let patch = serde_json::json!({ "spec": { "traffic": traffic } });
        services
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error(e, name))?;
        Ok(())
    }

    /// Fetches a service together with its revisions, newest first.
    pub async fn get(&self, name: &str) -> Result<(serving::Service, Vec<serving::Revision>)> {
        let svc = self
            .cluster
            .services()
            .get(name)
            .await
            .map_err(|e| api_error(e, name))?;
        let params =
            ListParams::default().labels(&labels::selector(vec![(labels::KNATIVE_SERVICE, name)]));
        let mut revisions = self
            .cluster
            .revisions()
            .list(&params)
            .await
            .map_err(|e| api_error(e, name))?
            .items;
        sort_oldest_first(&mut revisions);
        revisions.reverse();
        Ok((svc, revisions))
    }

    pub async fn list(
        &self,
        selector_labels: &HashMap<String, String>,
    ) -> Result<Vec<serving::Service>> {
        let selector = list_selector(selector_labels)?;
        let params = ListParams::default().labels(&selector);
        let list = self
            .cluster
            .services()
            .list(&params)
            .await
            .map_err(|e| api_error(e, &selector))?;
        Ok(list.items)
    }

    pub async fn list_pods(
        &self,
        selector_labels: &HashMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let selector = labels::selector(selector_labels.iter());
        let params = ListParams::default().labels(&selector);
        let list = self
            .cluster
            .pods()
            .list(&params)
            .await
            .map_err(|e| api_error(e, &selector))?;
        Ok(list.items)
    }

    async fn release(&self, handle: &LockHandle) {
        if let Err(error) = self.lock.release(handle).await {
            warn!(%error, key = %handle.key, "Failed to release lock");
        }
    }
}

/// The tenant namespace credentials are keyed by.
fn tenant(fd: &FunctionDefinition) -> &str {
    if fd.namespace_name.is_empty() {
        &fd.namespace
    } else {
        &fd.namespace_name
    }
}

/// The concrete targets currently routing traffic. The cluster's status block
/// resolves `latest` targets to revision names, so it is preferred over the
/// declared spec.
fn existing_targets(svc: &serving::Service) -> Vec<serving::TrafficTarget> {
    match svc.status.as_ref() {
        Some(status) if !status.traffic.is_empty() => status.traffic.clone(),
        _ => svc.spec.traffic.clone(),
    }
}

/// Rewrites traffic targets for an update: `percent` onto the latest
/// revision, the remainder spread over the existing named revisions in
/// proportion to their current weight. Zero-percent targets are dropped.
fn shift_traffic(
    existing: &[serving::TrafficTarget],
    percent: i64,
) -> Vec<serving::TrafficTarget> {
    let mut targets = Vec::new();
    if percent > 0 {
        targets.push(serving::TrafficTarget {
            latest_revision: Some(true),
            percent: Some(percent),
            ..Default::default()
        });
    }

    // Coalesce duplicates before scaling so a revision referenced twice is
    // shifted once.
    let mut order = Vec::new();
    let mut weights: HashMap<String, i64> = HashMap::new();
    for target in existing {
        if let Some(revision) = target.revision_name.as_ref() {
            if !weights.contains_key(revision) {
                order.push(revision.clone());
            }
            *weights.entry(revision.clone()).or_insert(0) += target.percent.unwrap_or(0);
        }
    }

    for revision in order {
        let scaled = weights[&revision] * (100 - percent) / 100;
        if scaled > 0 {
            targets.push(serving::TrafficTarget {
                revision_name: Some(revision),
                percent: Some(scaled),
                latest_revision: Some(false),
                tag: None,
            });
        }
    }
    targets
}

/// Ascending by configuration generation; ties broken by creation time.
fn sort_oldest_first(revisions: &mut [serving::Revision]) {
    revisions.sort_by_key(|r| (view::revision_generation(r), view::revision_created(r)));
}

/// Picks the oldest unreferenced revisions beyond the keep count. The input
/// must already be sorted oldest first.
fn prune_candidates(
    revisions: &[serving::Revision],
    in_use: &HashSet<String>,
    keep: usize,
) -> Vec<String> {
    let mut excess = revisions.len().saturating_sub(keep);
    let mut victims = Vec::new();
    for revision in revisions {
        if excess == 0 {
            break;
        }
        let name = revision.name();
        if in_use.contains(&name) {
            continue;
        }
        victims.push(name);
        excess -= 1;
    }
    victims
}

/// Applies the scope consistency table to a list request and returns the
/// effective scope. `service` requests are rewritten to `workflow` so the
/// same underlying service is found.
pub fn classify(selector_labels: &HashMap<String, String>) -> Result<Scope> {
    let scope: Scope = selector_labels
        .get(labels::SCOPE)
        .ok_or_else(|| Error::Invalid("missing scope label".to_string()))?
        .parse()?;

    let has_name = selector_labels.contains_key(labels::NAME);
    let has_workflow = selector_labels.contains_key(labels::WORKFLOW_ID);
    let has_namespace = selector_labels.contains_key(labels::NAMESPACE_ID);

    let allowed = match (has_namespace, has_workflow, has_name) {
        (true, true, true) => Scope::Service,
        (true, true, false) => Scope::Workflow,
        (true, false, _) => Scope::Namespace,
        (false, false, false) => Scope::Global,
        _ => {
            return Err(Error::Invalid(format!(
                "inconsistent scope selectors: namespace={} workflow={} name={}",
                has_namespace, has_workflow, has_name
            )))
        }
    };
    if scope != allowed {
        return Err(Error::Invalid(format!(
            "scope {} does not match the provided selectors",
            scope
        )));
    }

    if scope == Scope::Service {
        debug!("rewriting scope service to workflow");
        return Ok(Scope::Workflow);
    }
    Ok(scope)
}

/// Builds the list selector for a request, with the scope label rewritten to
/// the effective scope.
pub fn list_selector(selector_labels: &HashMap<String, String>) -> Result<String> {
    let scope = classify(selector_labels)?;
    let pairs = selector_labels.iter().map(|(k, v)| {
        if k == labels::SCOPE {
            (k.clone(), scope.as_str().to_string())
        } else {
            (k.clone(), v.clone())
        }
    });
    Ok(labels::selector(pairs))
}
