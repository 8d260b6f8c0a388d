use futures::prelude::*;
use kube::api::{Api, ListParams};
use kube::Resource;
use kube_runtime::watcher;
use serde::de::DeserializeOwned;
use std::{fmt, hash::Hash, pin::Pin};
use tokio::time;
use tracing::{debug, info};

pub use kube_runtime::watcher::Event;

/// Delay before reopening a closed or failed upstream watch.
const RESTART_DELAY: time::Duration = time::Duration::from_secs(5);

/// A watch that has seen no event for this long is forcibly re-listed.
const IDLE_TIMEOUT: time::Duration = time::Duration::from_secs(60 * 60);

/// Wraps an event stream that never terminates.
///
/// The underlying watch is reopened with the same selector whenever it fails,
/// ends, or idles out, so `recv` only ever resolves to an event.
pub struct Watch<T> {
    api: Api<T>,
    params: ListParams,
    stream: Pin<Box<dyn Stream<Item = watcher::Result<Event<T>>> + Send + 'static>>,
}

// === impl Watch ===

impl<T> Watch<T>
where
    T: Resource + Clone + DeserializeOwned + fmt::Debug + Send + 'static,
    T::DynamicType: Clone + Eq + Hash + Default,
{
    pub fn new(api: Api<T>, params: ListParams) -> Self {
        let stream = watcher(api.clone(), params.clone()).boxed();
        Self {
            api,
            params,
            stream,
        }
    }

    /// Receive the next event in the stream.
    ///
    /// If the stream fails, log the error and sleep briefly before reopening
    /// it with the same selector.
    pub async fn recv(&mut self) -> Event<T> {
        loop {
            match time::timeout(IDLE_TIMEOUT, self.stream.next()).await {
                Ok(Some(Ok(ev))) => return ev,
                Ok(Some(Err(error))) => {
                    info!(%error, "Disconnected");
                    time::sleep(RESTART_DELAY).await;
                    self.restart();
                }
                Ok(None) => {
                    info!("Watch ended");
                    time::sleep(RESTART_DELAY).await;
                    self.restart();
                }
                Err(_) => {
                    debug!("Watch idled out; re-listing");
                    self.restart();
                }
            }
        }
    }

    fn restart(&mut self) {
        self.stream = watcher(self.api.clone(), self.params.clone()).boxed();
    }
}
