#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! A typed client over the functions control plane's gRPC surface.

use anyhow::Result;
use direktiv_functions_core::FunctionDefinition;
use direktiv_functions_grpc::{self as proto, functions_service_client::FunctionsServiceClient};
use futures::prelude::*;
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub struct Client {
    client: FunctionsServiceClient<tonic::transport::Channel>,
}

// === impl Client ===

impl Client {
    pub async fn connect<D>(dst: D) -> Result<Self>
    where
        D: std::convert::TryInto<tonic::transport::Endpoint>,
        D::Error: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        let client = FunctionsServiceClient::connect(dst).await?;
        Ok(Client { client })
    }

    pub async fn create_function(&mut self, fd: &FunctionDefinition) -> Result<()> {
        let req = tonic::Request::new(proto::CreateFunctionRequest {
            info: Some(to_proto(fd)),
        });
        self.client.create_function(req).await?;
        Ok(())
    }

    pub async fn update_function(
        &mut self,
        service_name: String,
        fd: &FunctionDefinition,
        traffic_percent: i32,
    ) -> Result<()> {
        let req = tonic::Request::new(proto::UpdateFunctionRequest {
            service_name,
            info: Some(to_proto(fd)),
            traffic_percent,
        });
        self.client.update_function(req).await?;
        Ok(())
    }

    pub async fn delete_function(&mut self, service_name: String) -> Result<()> {
        let req = tonic::Request::new(proto::FunctionRequest { service_name });
        self.client.delete_function(req).await?;
        Ok(())
    }

    pub async fn get_function(
        &mut self,
        service_name: String,
    ) -> Result<proto::GetFunctionResponse> {
        let req = tonic::Request::new(proto::FunctionRequest { service_name });
        Ok(self.client.get_function(req).await?.into_inner())
    }

    pub async fn list_functions(
        &mut self,
        labels: HashMap<String, String>,
    ) -> Result<proto::ListFunctionsResponse> {
        let req = tonic::Request::new(proto::ListFunctionsRequest { labels });
        Ok(self.client.list_functions(req).await?.into_inner())
    }

    pub async fn set_traffic(
        &mut self,
        name: String,
        traffic: Vec<(String, i64)>,
    ) -> Result<()> {
        let traffic = traffic
            .into_iter()
            .map(|(revision, percent)| proto::TrafficValue { revision, percent })
            .collect();
        let req = tonic::Request::new(proto::SetTrafficRequest { name, traffic });
        self.client.set_functions_traffic(req).await?;
        Ok(())
    }

    pub async fn list_pods(
        &mut self,
        labels: HashMap<String, String>,
    ) -> Result<Vec<proto::PodInfo>> {
        let req = tonic::Request::new(proto::ListPodsRequest { labels });
        Ok(self.client.list_pods(req).await?.into_inner().pods)
    }

    pub async fn create_pod(
        &mut self,
        fd: &FunctionDefinition,
        action_id: String,
        instance_id: String,
        step: i64,
    ) -> Result<proto::CreatePodResponse> {
        let req = tonic::Request::new(proto::CreatePodRequest {
            info: Some(to_proto(fd)),
            action_id,
            instance_id,
            step,
        });
        Ok(self.client.create_pod(req).await?.into_inner())
    }

    pub async fn cancel_pod(&mut self, action_id: String) -> Result<()> {
        let req = tonic::Request::new(proto::CancelPodRequest { action_id });
        self.client.cancel_pod(req).await?;
        Ok(())
    }

    pub async fn watch_functions(
        &mut self,
        labels: HashMap<String, String>,
    ) -> Result<impl Stream<Item = Result<proto::WatchFunctionsResponse>>> {
        let req = tonic::Request::new(proto::WatchFunctionsRequest { labels });
        let rsp = self.client.watch_functions(req).await?;
        Ok(rsp.into_inner().map_err(Into::into))
    }

    pub async fn watch_revisions(
        &mut self,
        service_name: String,
        revision_name: String,
    ) -> Result<impl Stream<Item = Result<proto::WatchRevisionsResponse>>> {
        let req = tonic::Request::new(proto::WatchRevisionsRequest {
            service_name,
            revision_name,
        });
        let rsp = self.client.watch_revisions(req).await?;
        Ok(rsp.into_inner().map_err(Into::into))
    }

    pub async fn watch_pods(
        &mut self,
        service_name: String,
        revision_name: String,
    ) -> Result<impl Stream<Item = Result<proto::WatchPodsResponse>>> {
        let req = tonic::Request::new(proto::WatchPodsRequest {
            service_name,
            revision_name,
        });
        let rsp = self.client.watch_pods(req).await?;
        Ok(rsp.into_inner().map_err(Into::into))
    }

    pub async fn watch_logs(
        &mut self,
        pod_name: String,
    ) -> Result<impl Stream<Item = Result<String>>> {
        let req = tonic::Request::new(proto::WatchLogsRequest { pod_name });
        let rsp = self.client.watch_logs(req).await?;
        Ok(rsp
            .into_inner()
            .map_ok(|chunk| chunk.data)
            .map_err(Into::into))
    }

    pub async fn store_registry(
        &mut self,
        namespace: String,
        name: String,
        data: String,
    ) -> Result<()> {
        let req = tonic::Request::new(proto::StoreRegistryRequest {
            namespace,
            name,
            data: data.into_bytes(),
        });
        self.client.store_registry(req).await?;
        Ok(())
    }

    pub async fn get_registries(
        &mut self,
        namespace: String,
    ) -> Result<Vec<proto::get_registries_response::Registry>> {
        let req = tonic::Request::new(proto::GetRegistriesRequest { namespace });
        Ok(self.client.get_registries(req).await?.into_inner().registries)
    }

    pub async fn delete_registry(&mut self, namespace: String, name: String) -> Result<()> {
        let req = tonic::Request::new(proto::DeleteRegistryRequest { namespace, name });
        self.client.delete_registry(req).await?;
        Ok(())
    }
}

fn to_proto(fd: &FunctionDefinition) -> proto::FunctionDefinition {
    proto::FunctionDefinition {
        namespace: fd.namespace.clone(),
        namespace_name: fd.namespace_name.clone(),
        workflow: fd.workflow.clone(),
        path: fd.path.clone(),
        name: fd.name.clone(),
        image: fd.image.clone(),
        cmd: fd.cmd.clone(),
        size: fd.size.as_i32(),
        min_scale: fd.min_scale,
        envs: fd
            .envs
            .iter()
            .map(|(name, value)| proto::EnvVar {
                name: name.clone(),
                value: value.clone(),
            })
            .collect(),
    }
}
