//! The tonic server exposing the RPC surface consumed by the workflow
//! engine. Unary calls delegate to the manager, scheduler, and registry; the
//! four watch RPCs stream computed summaries until the caller disconnects or
//! the control plane drains.

use crate::build::USER_CONTAINER;
use crate::config::Config;
use crate::functions::{self, Manager};
use crate::k8s::{api_error, labels, Cluster, Event, ListParams, ResourceExt};
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::view;
use direktiv_functions_core::{Error, FunctionDefinition, Size};
use direktiv_functions_grpc as proto;
use direktiv_functions_grpc::functions_service_server::{
    FunctionsService, FunctionsServiceServer,
};
use futures::prelude::*;
use kube::api::LogParams;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct Server {
    cluster: Cluster,
    manager: Arc<Manager>,
    scheduler: Arc<Scheduler>,
    registry: Registry,
    config: Arc<Config>,
    drain: drain::Watch,
}

type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T, tonic::Status>> + Send>>;

// === impl Server ===

impl Server {
    pub fn new(
        cluster: Cluster,
        manager: Arc<Manager>,
        scheduler: Arc<Scheduler>,
        registry: Registry,
        config: Arc<Config>,
        drain: drain::Watch,
    ) -> Self {
        Self {
            cluster,
            manager,
            scheduler,
            registry,
            config,
            drain,
        }
    }

    pub async fn serve(
        self,
        addr: std::net::SocketAddr,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<(), tonic::transport::Error> {
        tonic::transport::Server::builder()
            .add_service(FunctionsServiceServer::new(self))
            .serve_with_shutdown(addr, shutdown)
            .await
    }

    fn config_message(&self) -> proto::FunctionsConfig {
        proto::FunctionsConfig {
            maxscale: self.config.max_scale,
            concurrency: self.config.concurrency as i32,
            rollout_duration: self.config.rollout_duration as i32,
            keep_revisions: self.config.keep_revisions as i32,
        }
    }
}

#[async_trait::async_trait]
impl FunctionsService for Server {
    async fn create_function(
        &self,
        req: tonic::Request<proto::CreateFunctionRequest>,
    ) -> Result<tonic::Response<()>, tonic::Status> {
        let fd = definition(req.into_inner().info)?;
        self.manager.create(&fd).await.map_err(status)?;
        Ok(tonic::Response::new(()))
    }

    async fn update_function(
        &self,
        req: tonic::Request<proto::UpdateFunctionRequest>,
    ) -> Result<tonic::Response<()>, tonic::Status> {
        let proto::UpdateFunctionRequest {
            service_name,
            info,
            traffic_percent,
        } = req.into_inner();
        let fd = definition(info)?;
        self.manager
            .update(&service_name, &fd, traffic_percent as i64)
            .await
            .map_err(status)?;
        Ok(tonic::Response::new(()))
    }

    async fn delete_function(
        &self,
        req: tonic::Request<proto::FunctionRequest>,
    ) -> Result<tonic::Response<()>, tonic::Status> {
        let name = req.into_inner().service_name;
        self.manager.delete(&name).await.map_err(status)?;
        Ok(tonic::Response::new(()))
    }

    async fn delete_functions(
        &self,
        req: tonic::Request<proto::ListFunctionsRequest>,
    ) -> Result<tonic::Response<()>, tonic::Status> {
        let selector = req.into_inner().labels.into_iter().collect();
        self.manager.delete_many(&selector).await.map_err(status)?;
        Ok(tonic::Response::new(()))
    }

    async fn set_functions_traffic(
        &self,
        req: tonic::Request<proto::SetTrafficRequest>,
    ) -> Result<tonic::Response<()>, tonic::Status> {
        let proto::SetTrafficRequest { name, traffic } = req.into_inner();
        let targets = traffic
            .into_iter()
            .map(|t| (t.revision, t.percent))
            .collect::<Vec<_>>();
        self.manager
            .set_traffic(&name, &targets)
            .await
            .map_err(status)?;
        Ok(tonic::Response::new(()))
    }

    async fn get_function(
        &self,
        req: tonic::Request<proto::FunctionRequest>,
    ) -> Result<tonic::Response<proto::GetFunctionResponse>, tonic::Status> {
        let name = req.into_inner().service_name;
        let (svc, revisions) = self.manager.get(&name).await.map_err(status)?;

        let traffic = view::coalesced_traffic(
            svc.status
                .as_ref()
                .map(|s| s.traffic.as_slice())
                .unwrap_or_default(),
        );
        let label = |key: &str| svc.metadata.labels.get(key).cloned().unwrap_or_default();
        Ok(tonic::Response::new(proto::GetFunctionResponse {
            name: label(labels::NAME),
            namespace: label(labels::NAMESPACE_NAME),
            workflow: label(labels::WORKFLOW_ID),
            scope: label(labels::SCOPE),
            config: Some(self.config_message()),
            info: Some(view::function_definition(&svc)),
            revisions: revisions
                .iter()
                .map(|r| view::revision_summary(r, &traffic))
                .collect(),
        }))
    }

    async fn list_functions(
        &self,
        req: tonic::Request<proto::ListFunctionsRequest>,
    ) -> Result<tonic::Response<proto::ListFunctionsResponse>, tonic::Status> {
        let selector = req.into_inner().labels.into_iter().collect();
        let services = self.manager.list(&selector).await.map_err(status)?;
        Ok(tonic::Response::new(proto::ListFunctionsResponse {
            config: Some(self.config_message()),
            functions: services.iter().map(view::function_info).collect(),
        }))
    }

    async fn list_pods(
        &self,
        req: tonic::Request<proto::ListPodsRequest>,
    ) -> Result<tonic::Response<proto::ListPodsResponse>, tonic::Status> {
        let selector = req.into_inner().labels.into_iter().collect();
        let pods = self.manager.list_pods(&selector).await.map_err(status)?;
        Ok(tonic::Response::new(proto::ListPodsResponse {
            pods: pods.iter().map(view::pod_info).collect(),
        }))
    }

    async fn create_pod(
        &self,
        req: tonic::Request<proto::CreatePodRequest>,
    ) -> Result<tonic::Response<proto::CreatePodResponse>, tonic::Status> {
        let proto::CreatePodRequest {
            info,
            action_id,
            instance_id,
            step,
        } = req.into_inner();
        let fd = definition(info)?;
        let (ip, hostname) = self
            .scheduler
            .create(&fd, &action_id, &instance_id, step)
            .await
            .map_err(status)?;
        Ok(tonic::Response::new(proto::CreatePodResponse { ip, hostname }))
    }

    async fn cancel_pod(
        &self,
        req: tonic::Request<proto::CancelPodRequest>,
    ) -> Result<tonic::Response<()>, tonic::Status> {
        let action_id = req.into_inner().action_id;
        self.scheduler.cancel(&action_id).await.map_err(status)?;
        Ok(tonic::Response::new(()))
    }

    type WatchFunctionsStream = BoxStream<proto::WatchFunctionsResponse>;

    async fn watch_functions(
        &self,
        req: tonic::Request<proto::WatchFunctionsRequest>,
    ) -> Result<tonic::Response<Self::WatchFunctionsStream>, tonic::Status> {
        let selector_labels = req.into_inner().labels.into_iter().collect();
        let selector = functions::list_selector(&selector_labels).map_err(status)?;
        let mut watch = self
            .cluster
            .watch_services(ListParams::default().labels(&selector));
        let drain = self.drain.clone();

        let stream: Self::WatchFunctionsStream = Box::pin(async_stream::try_stream! {
            tokio::pin! {
                let shutdown = drain.signaled();
            }
            let mut seen = HashSet::new();
            loop {
                let ticks = tokio::select! {
                    ev = watch.recv() => flatten(ev, &mut seen),
                    _ = (&mut shutdown) => { return; }
                };
                for (event, svc) in ticks {
                    yield proto::WatchFunctionsResponse {
                        event,
                        function: Some(view::function_info(&svc)),
                    };
                }
            }
        });
        Ok(tonic::Response::new(stream))
    }

    type WatchRevisionsStream = BoxStream<proto::WatchRevisionsResponse>;

    async fn watch_revisions(
        &self,
        req: tonic::Request<proto::WatchRevisionsRequest>,
    ) -> Result<tonic::Response<Self::WatchRevisionsStream>, tonic::Status> {
        let proto::WatchRevisionsRequest {
            service_name,
            revision_name,
        } = req.into_inner();
        if service_name.is_empty() {
            return Err(tonic::Status::invalid_argument("missing service name"));
        }

        let mut params = ListParams::default().labels(&labels::selector(vec![(
            labels::KNATIVE_SERVICE,
            service_name.as_str(),
        )]));
        if !revision_name.is_empty() {
            params = params.fields(&format!("metadata.name={}", revision_name));
        }
        let mut watch = self.cluster.watch_revisions(params);
        let services = self.cluster.services();
        let drain = self.drain.clone();

        let stream: Self::WatchRevisionsStream = Box::pin(async_stream::try_stream! {
            tokio::pin! {
                let shutdown = drain.signaled();
            }
            let mut seen = HashSet::new();
            loop {
                let ticks = tokio::select! {
                    ev = watch.recv() => flatten(ev, &mut seen),
                    _ = (&mut shutdown) => { return; }
                };
                // Traffic weights live on the service, not the revision;
                // refresh them per tick.
                let traffic = match services.get(&service_name).await {
                    Ok(svc) => view::coalesced_traffic(
                        svc.status.as_ref().map(|s| s.traffic.as_slice()).unwrap_or_default(),
                    ),
                    Err(_) => Default::default(),
                };
                for (event, rev) in ticks {
                    yield proto::WatchRevisionsResponse {
                        event,
                        revision: Some(view::revision_summary(&rev, &traffic)),
                    };
                }
            }
        });
        Ok(tonic::Response::new(stream))
    }

    type WatchPodsStream = BoxStream<proto::WatchPodsResponse>;

    async fn watch_pods(
        &self,
        req: tonic::Request<proto::WatchPodsRequest>,
    ) -> Result<tonic::Response<Self::WatchPodsStream>, tonic::Status> {
        let proto::WatchPodsRequest {
            service_name,
            revision_name,
        } = req.into_inner();
        if service_name.is_empty() {
            return Err(tonic::Status::invalid_argument("missing service name"));
        }

        let mut pairs = vec![(labels::KNATIVE_SERVICE, service_name)];
        if !revision_name.is_empty() {
            pairs.push((labels::KNATIVE_REVISION, revision_name));
        }
        let mut watch = self
            .cluster
            .watch_pods(ListParams::default().labels(&labels::selector(pairs)));
        let drain = self.drain.clone();

        let stream: Self::WatchPodsStream = Box::pin(async_stream::try_stream! {
            tokio::pin! {
                let shutdown = drain.signaled();
            }
            let mut seen = HashSet::new();
            loop {
                let ticks = tokio::select! {
                    ev = watch.recv() => flatten(ev, &mut seen),
                    _ = (&mut shutdown) => { return; }
                };
                for (event, pod) in ticks {
                    yield proto::WatchPodsResponse {
                        event,
                        pod: Some(view::pod_info(&pod)),
                    };
                }
            }
        });
        Ok(tonic::Response::new(stream))
    }

    type WatchLogsStream = BoxStream<proto::WatchLogsResponse>;

    async fn watch_logs(
        &self,
        req: tonic::Request<proto::WatchLogsRequest>,
    ) -> Result<tonic::Response<Self::WatchLogsStream>, tonic::Status> {
        let pod_name = req.into_inner().pod_name;
        if pod_name.is_empty() {
            return Err(tonic::Status::invalid_argument("missing pod name"));
        }

        let params = LogParams {
            container: Some(USER_CONTAINER.to_string()),
            follow: true,
            ..Default::default()
        };
        let reader = self
            .cluster
            .pods()
            .log_stream(&pod_name, &params)
            .await
            .map_err(|e| status(api_error(e, &pod_name)))?;
        let drain = self.drain.clone();

        let stream: Self::WatchLogsStream = Box::pin(async_stream::try_stream! {
            tokio::pin! {
                let shutdown = drain.signaled();
            }
            futures::pin_mut!(reader);
            let mut buf = [0u8; 2048];
            loop {
                let res = tokio::select! {
                    res = reader.read(&mut buf) => res,
                    _ = (&mut shutdown) => { return; }
                };
                match res {
                    // EOF ends the stream gracefully.
                    Ok(0) => { return; }
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if !data.is_empty() {
                            yield proto::WatchLogsResponse { data };
                        }
                    }
                    Err(error) => {
                        debug!(%error, pod = %pod_name, "Log stream ended");
                        return;
                    }
                }
            }
        });
        Ok(tonic::Response::new(stream))
    }

    async fn store_registry(
        &self,
        req: tonic::Request<proto::StoreRegistryRequest>,
    ) -> Result<tonic::Response<()>, tonic::Status> {
        let proto::StoreRegistryRequest {
            namespace,
            name,
            data,
        } = req.into_inner();
        let data = String::from_utf8(data)
            .map_err(|_| tonic::Status::invalid_argument("registry data is not utf-8"))?;
        self.registry
            .store(&namespace, &name, &data)
            .await
            .map_err(status)?;
        Ok(tonic::Response::new(()))
    }

    async fn get_registries(
        &self,
        req: tonic::Request<proto::GetRegistriesRequest>,
    ) -> Result<tonic::Response<proto::GetRegistriesResponse>, tonic::Status> {
        let namespace = req.into_inner().namespace;
        let registries = self
            .registry
            .list(&namespace)
            .await
            .map_err(status)?
            .into_iter()
            .map(|entry| proto::get_registries_response::Registry {
                name: entry.name,
                id: entry.id,
                user: entry.user,
            })
            .collect();
        Ok(tonic::Response::new(proto::GetRegistriesResponse {
            registries,
        }))
    }

    async fn delete_registry(
        &self,
        req: tonic::Request<proto::DeleteRegistryRequest>,
    ) -> Result<tonic::Response<()>, tonic::Status> {
        let proto::DeleteRegistryRequest { namespace, name } = req.into_inner();
        self.registry
            .delete(&namespace, &name)
            .await
            .map_err(status)?;
        Ok(tonic::Response::new(()))
    }
}

/// Expands a watch event into `(eventKind, object)` ticks, reconstructing
/// added-vs-modified from what this stream has already delivered.
fn flatten<T: ResourceExt>(ev: Event<T>, seen: &mut HashSet<String>) -> Vec<(String, T)> {
    match ev {
        Event::Applied(obj) => {
            let kind = if seen.insert(obj.name()) {
                "ADDED"
            } else {
                "MODIFIED"
            };
            vec![(kind.to_string(), obj)]
        }
        Event::Deleted(obj) => {
            seen.remove(&obj.name());
            vec![("DELETED".to_string(), obj)]
        }
        Event::Restarted(objs) => {
            seen.clear();
            objs.into_iter()
                .map(|obj| {
                    seen.insert(obj.name());
                    ("ADDED".to_string(), obj)
                })
                .collect()
        }
    }
}

fn definition(info: Option<proto::FunctionDefinition>) -> Result<FunctionDefinition, tonic::Status> {
    let fd = info.ok_or_else(|| tonic::Status::invalid_argument("missing function definition"))?;
    Ok(FunctionDefinition {
        namespace: fd.namespace,
        namespace_name: fd.namespace_name,
        workflow: fd.workflow,
        path: fd.path,
        name: fd.name,
        image: fd.image,
        cmd: fd.cmd,
        size: Size::from_i32(fd.size),
        min_scale: fd.min_scale,
        envs: fd.envs.into_iter().map(|e| (e.name, e.value)).collect(),
    })
}

fn status(err: Error) -> tonic::Status {
    match err {
        Error::Invalid(m) => tonic::Status::invalid_argument(m),
        Error::NotFound(m) => tonic::Status::not_found(m),
        Error::AlreadyExists(m) => tonic::Status::already_exists(m),
        Error::MaxJobsExceeded(ns) => {
            tonic::Status::resource_exhausted(format!("namespace {} is at its max-jobs limit", ns))
        }
        Error::Timeout(m) => tonic::Status::deadline_exceeded(m),
        Error::Unauthorized(m) => tonic::Status::permission_denied(m),
        Error::Transient(m) => tonic::Status::unavailable(m),
        Error::Internal(e) => tonic::Status::internal(format!("{:#}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::serving;

    fn mk_service(name: &str) -> serving::Service {
        serving::Service::new(
            name,
            serving::ServiceSpec {
                template: serving::RevisionTemplate::default(),
                traffic: Vec::new(),
            },
        )
    }

    #[test]
    fn flatten_reconstructs_added_and_modified() {
        let mut seen = HashSet::new();

        let ticks = flatten(Event::Applied(mk_service("a")), &mut seen);
        assert_eq!(ticks[0].0, "ADDED");

        let ticks = flatten(Event::Applied(mk_service("a")), &mut seen);
        assert_eq!(ticks[0].0, "MODIFIED");

        let ticks = flatten(Event::Deleted(mk_service("a")), &mut seen);
        assert_eq!(ticks[0].0, "DELETED");

        let ticks = flatten(Event::Applied(mk_service("a")), &mut seen);
        assert_eq!(ticks[0].0, "ADDED");
    }

    #[test]
    fn flatten_resets_on_restart() {
        let mut seen = HashSet::new();
        flatten(Event::Applied(mk_service("a")), &mut seen);

        let ticks = flatten(
            Event::Restarted(vec![mk_service("a"), mk_service("b")]),
            &mut seen,
        );
        assert_eq!(ticks.len(), 2);
        assert!(ticks.iter().all(|(kind, _)| kind == "ADDED"));

        let ticks = flatten(Event::Applied(mk_service("b")), &mut seen);
        assert_eq!(ticks[0].0, "MODIFIED");
    }

    #[test]
    fn errors_map_onto_grpc_codes() {
        assert_eq!(
            status(Error::Invalid("x".into())).code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(
            status(Error::NotFound("x".into())).code(),
            tonic::Code::NotFound
        );
        assert_eq!(
            status(Error::AlreadyExists("x".into())).code(),
            tonic::Code::AlreadyExists
        );
        assert_eq!(
            status(Error::MaxJobsExceeded("n1".into())).code(),
            tonic::Code::ResourceExhausted
        );
        assert_eq!(
            status(Error::Timeout("x".into())).code(),
            tonic::Code::DeadlineExceeded
        );
        assert_eq!(
            status(Error::Unauthorized("x".into())).code(),
            tonic::Code::PermissionDenied
        );
        assert_eq!(
            status(Error::Transient("x".into())).code(),
            tonic::Code::Unavailable
        );
    }
}
