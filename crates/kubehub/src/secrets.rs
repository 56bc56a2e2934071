use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::{api::Api, Client};
use tenant_core::SecretReader;

/// Reads `core/v1` Secrets from one namespace.
pub struct KubeSecretReader {
    api: Api<Secret>,
    namespace: String,
}

impl KubeSecretReader {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), namespace: namespace.to_string() }
    }
}

#[async_trait::async_trait]
impl SecretReader for KubeSecretReader {
    async fn read_secret(&self, name: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let secret = self.api.get(name).await.with_context(|| format!("reading secret {}/{}", self.namespace, name))?;
        Ok(secret.data.unwrap_or_default().into_iter().map(|(k, v)| (k, v.0)).collect())
    }
}
