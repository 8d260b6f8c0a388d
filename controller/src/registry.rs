//! Per-namespace image-pull credentials, persisted as docker-config secrets
//! and discovered by label.

use crate::k8s::{api_error, labels, Api, Cluster, DeleteParams, ListParams, PostParams, Secret};
use direktiv_functions_core::{fingerprint, obfuscate_user, sanitize_label, Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use tracing::debug;

const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";
const DOCKER_CONFIG_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// A stored credential as reported to callers. The token itself is never
/// echoed back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryEntry {
    /// The registry URL.
    pub name: String,
    /// The URL fingerprint used for selection.
    pub id: String,
    /// The obfuscated user.
    pub user: String,
}

#[derive(Clone)]
pub struct Registry {
    secrets: Api<Secret>,
}

// === impl Registry ===

impl Registry {
    pub fn new(cluster: &Cluster) -> Self {
        Self {
            secrets: cluster.secrets(),
        }
    }

    /// Stores a credential, replacing any existing entry for the same
    /// `(namespace, url)` pair. The payload must be `user:token`.
    pub async fn store(&self, namespace: &str, url: &str, data: &str) -> Result<()> {
        let user = parse_user(data)?;

        // Replace rather than update: the old entry is removed first so a
        // failed create cannot leave two credentials selectable.
        for secret in self.select(namespace, Some(url)).await? {
            if let Some(name) = secret.metadata.name.as_ref() {
                match self.secrets.delete(name, &DeleteParams::default()).await {
                    Ok(_) => debug!(%namespace, %url, %name, "Replaced registry secret"),
                    Err(kube::Error::Api(e)) if e.code == 404 => {}
                    Err(error) => return Err(api_error(error, name)),
                }
            }
        }

        let secret = mk_secret(namespace, url, user, data);
        self.secrets
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|e| api_error(e, url))?;
        Ok(())
    }

    /// Deletes the credential for `(namespace, url)`.
    pub async fn delete(&self, namespace: &str, url: &str) -> Result<()> {
        let matches = self.select(namespace, Some(url)).await?;
        if matches.is_empty() {
            return Err(Error::NotFound(format!("registry {}", url)));
        }
        for secret in matches {
            if let Some(name) = secret.metadata.name.as_ref() {
                match self.secrets.delete(name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(e)) if e.code == 404 => {}
                    Err(error) => return Err(api_error(error, name)),
                }
            }
        }
        Ok(())
    }

    /// Lists stored credentials for a namespace.
    pub async fn list(&self, namespace: &str) -> Result<Vec<RegistryEntry>> {
        let entries = self
            .select(namespace, None)
            .await?
            .into_iter()
            .map(|secret| RegistryEntry {
                name: secret
                    .metadata
                    .annotations
                    .get(labels::ANNOTATION_URL)
                    .cloned()
                    .unwrap_or_default(),
                id: secret
                    .metadata
                    .labels
                    .get(labels::REGISTRY_URL_HASH)
                    .cloned()
                    .unwrap_or_default(),
                user: secret
                    .metadata
                    .annotations
                    .get(labels::ANNOTATION_OBF_USER)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();
        Ok(entries)
    }

    /// The secret names attached to services and jobs as image pull secrets.
    pub async fn pull_secret_names(&self, namespace: &str) -> Result<Vec<String>> {
        let names = self
            .select(namespace, None)
            .await?
            .into_iter()
            .filter_map(|secret| secret.metadata.name)
            .collect();
        Ok(names)
    }

    async fn select(&self, namespace: &str, url: Option<&str>) -> Result<Vec<Secret>> {
        // Always the explicit selector; a partial namespace match must never
        // leak another tenant's credentials.
        let mut pairs = vec![
            (labels::REGISTRY_NAMESPACE, sanitize_label(namespace)),
            (
                labels::REGISTRY_TYPE,
                labels::REGISTRY_TYPE_NAMESPACE.to_string(),
            ),
        ];
        if let Some(url) = url {
            pairs.push((labels::REGISTRY_URL_HASH, fingerprint(url).to_string()));
        }
        let params = ListParams::default().labels(&labels::selector(pairs));
        let list = self
            .secrets
            .list(&params)
            .await
            .map_err(|e| api_error(e, namespace))?;
        Ok(list.items)
    }
}

/// The payload must contain exactly one colon separating user and token.
fn parse_user(data: &str) -> Result<&str> {
    if data.matches(':').count() != 1 {
        return Err(Error::Invalid(
            "registry data must be a `user:token` pair".to_string(),
        ));
    }
    Ok(data.split_once(':').expect("payload contains a colon").0)
}

fn mk_secret(namespace: &str, url: &str, user: &str, data: &str) -> Secret {
    let mut secret_labels = BTreeMap::new();
    secret_labels.insert(
        labels::REGISTRY_NAMESPACE.to_string(),
        sanitize_label(namespace),
    );
    secret_labels.insert(
        labels::REGISTRY_URL_HASH.to_string(),
        fingerprint(url).to_string(),
    );
    secret_labels.insert(
        labels::REGISTRY_TYPE.to_string(),
        labels::REGISTRY_TYPE_NAMESPACE.to_string(),
    );

    let mut annotations = BTreeMap::new();
    annotations.insert(labels::ANNOTATION_URL.to_string(), url.to_string());
    annotations.insert(labels::ANNOTATION_URL_HASH.to_string(), base64::encode(url));
    annotations.insert(labels::ANNOTATION_OBF_USER.to_string(), obfuscate_user(user));

    let config = serde_json::json!({
        "auths": {
            url: {
                "username": user,
                "password": data.split_once(':').map(|(_, t)| t).unwrap_or_default(),
                "auth": base64::encode(data),
            }
        }
    });

    let mut string_data = BTreeMap::new();
    string_data.insert(DOCKER_CONFIG_KEY.to_string(), config.to_string());

    Secret {
        metadata: ObjectMeta {
            name: Some(secret_name(namespace, url)),
            labels: secret_labels,
            annotations,
            ..Default::default()
        },
        type_: Some(DOCKER_CONFIG_TYPE.to_string()),
        string_data,
        ..Default::default()
    }
}

/// Derives the secret name from the namespace and the registry host.
fn secret_name(namespace: &str, url: &str) -> String {
    let host = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| {
            // Bare hosts parse without a scheme only when one is supplied.
            url::Url::parse(&format!("https://{}", url))
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| url.to_string())
        });
    sanitize_label(&format!("direktiv-secret-{}-{}", namespace, host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_names_use_the_url_host() {
        assert_eq!(
            secret_name("n1", "https://reg.example.com/v2"),
            "direktiv-secret-n1-reg.example.com"
        );
        assert_eq!(
            secret_name("n1", "reg.example.com"),
            "direktiv-secret-n1-reg.example.com"
        );
    }

    #[test]
    fn payload_requires_exactly_one_colon() {
        assert_eq!(parse_user("alice:secret").unwrap(), "alice");
        assert!(matches!(parse_user("alice"), Err(Error::Invalid(_))));
        assert!(matches!(parse_user("a:b:c"), Err(Error::Invalid(_))));
    }

    #[test]
    fn secrets_carry_selection_labels_and_obfuscated_user() {
        let secret = mk_secret("n1", "https://reg.example.com", "alice", "alice:secret");

        let labels_map = &secret.metadata.labels;
        assert_eq!(labels_map.get(labels::REGISTRY_NAMESPACE).unwrap(), "n1");
        assert_eq!(
            labels_map.get(labels::REGISTRY_URL_HASH).unwrap(),
            &fingerprint("https://reg.example.com").to_string()
        );
        assert_eq!(
            labels_map.get(labels::REGISTRY_TYPE).unwrap(),
            labels::REGISTRY_TYPE_NAMESPACE
        );

        let annotations = &secret.metadata.annotations;
        assert_eq!(
            annotations.get(labels::ANNOTATION_URL).unwrap(),
            "https://reg.example.com"
        );
        assert_eq!(annotations.get(labels::ANNOTATION_OBF_USER).unwrap(), "a***e");

        assert_eq!(secret.type_.as_deref(), Some(DOCKER_CONFIG_TYPE));
        let payload = secret.string_data.get(DOCKER_CONFIG_KEY).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(
            parsed["auths"]["https://reg.example.com"]["auth"],
            base64::encode("alice:secret")
        );
        assert_eq!(
            parsed["auths"]["https://reg.example.com"]["username"],
            "alice"
        );
    }
}
