use super::api_error;
use direktiv_functions_core::{fingerprint, Error, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use std::collections::BTreeMap;
use tokio::time;
use tracing::debug;

/// Default bound on lock acquisition.
pub const ACQUIRE_TIMEOUT: time::Duration = time::Duration::from_secs(30);

const RETRY_DELAY: time::Duration = time::Duration::from_millis(100);

/// Advisory per-key mutual exclusion backed by cluster config maps.
///
/// A key is held by whoever created its config map; contenders retry until
/// the creation succeeds or their deadline passes. Mutations of a single
/// service are serialized by locking its name.
#[derive(Clone)]
pub struct Lock {
    api: Api<ConfigMap>,
}

/// An acquired grant. Releasing it is idempotent.
#[derive(Clone, Debug)]
pub struct LockHandle {
    pub key: String,
    name: String,
    owner: String,
}

// === impl Lock ===

impl Lock {
    pub fn new(api: Api<ConfigMap>) -> Self {
        Self { api }
    }

    /// Acquires the lock for `key`, retrying until `timeout`.
    ///
    /// Shared grants are honored as exclusive: the config-map backend cannot
    /// distinguish readers, and no caller in this control plane requires it.
    pub async fn acquire(&self, key: &str, _shared: bool, timeout: time::Duration) -> Result<LockHandle> {
        let deadline = time::Instant::now() + timeout;
        let handle = LockHandle::new(key);
        loop {
            match self
                .api
                .create(&PostParams::default(), &handle.config_map())
                .await
            {
                Ok(_) => {
                    debug!(%key, owner = %handle.owner, "Lock acquired");
                    return Ok(handle);
                }
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    if time::Instant::now() >= deadline {
                        return Err(Error::Timeout(format!("lock {}", key)));
                    }
                    time::sleep(RETRY_DELAY).await;
                }
                Err(error) => return Err(api_error(error, key)),
            }
        }
    }

    /// Single-attempt acquire for callers that must not block. Returns `None`
    /// when the key is already held.
    pub async fn try_acquire(&self, key: &str) -> Result<Option<LockHandle>> {
        let handle = LockHandle::new(key);
        match self
            .api
            .create(&PostParams::default(), &handle.config_map())
            .await
        {
            Ok(_) => Ok(Some(handle)),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(None),
            Err(error) => Err(api_error(error, key)),
        }
    }

    /// Releases a grant. A grant that is already gone is not an error.
    pub async fn release(&self, handle: &LockHandle) -> Result<()> {
        match self.api.delete(&handle.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(error) => Err(api_error(error, &handle.key)),
        }
    }
}

// === impl LockHandle ===

impl LockHandle {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            name: format!("direktiv-lock-{}", fingerprint(key)),
            owner: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn config_map(&self) -> ConfigMap {
        let mut data = BTreeMap::new();
        data.insert("key".to_string(), self.key.clone());
        data.insert("owner".to_string(), self.owner.clone());
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            data,
            ..Default::default()
        }
    }
}
