use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::conf::Vault;
use crate::Result;

const VAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of named secrets such as the license.
#[async_trait]
pub trait SecretStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_secret(&self, name: &str) -> Option<String>;
}

/// Reads secrets from environment variables, `rmesh/license` is looked up
/// as `RMESH_LICENSE`.
#[derive(Debug, Default)]
pub struct EnvironmentSecrets;

impl EnvironmentSecrets {
    #[inline]
    fn var_name(name: &str) -> String {
        name.to_uppercase().replace('/', "_")
    }
}

#[async_trait]
impl SecretStore for EnvironmentSecrets {
    fn name(&self) -> &'static str {
        "env"
    }

    async fn get_secret(&self, name: &str) -> Option<String> {
        std::env::var(Self::var_name(name)).ok().filter(|v| !v.is_empty())
    }
}

#[derive(Serialize)]
struct AppIdLogin<'a> {
    app_id: &'a str,
    user_id: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: Auth,
}

#[derive(Deserialize)]
struct Auth {
    client_token: String,
}

#[derive(Serialize, Deserialize)]
struct SecretValue {
    value: String,
}

#[derive(Deserialize)]
struct SecretResponse {
    data: SecretValue,
}

/// HashiCorp Vault client using app-id authentication. Secrets live under
/// `/v1/secret/<name>` as `{"value": ...}`; it also keeps TLS certificates
/// under `/v1/secret/certs/<key>`.
pub struct VaultSecrets {
    address: String,
    app: String,
    user: String,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl VaultSecrets {
    pub fn new(address: &str, app: &str, user: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(VAULT_TIMEOUT).build()?;
        Ok(Self {
            address: address.trim_end_matches('/').to_owned(),
            app: app.to_owned(),
            user: user.to_owned(),
            client,
            token: RwLock::new(None),
        })
    }

    async fn login(&self) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/v1/auth/app-id/login", self.address))
            .json(&AppIdLogin { app_id: &self.app, user_id: &self.user })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(anyhow!("vault login failed, status: {}", resp.status()));
        }
        let login: LoginResponse = resp.json().await?;
        Ok(login.auth.client_token)
    }

    async fn token(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }
        let mut slot = self.token.write().await;
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }
        let token = self.login().await?;
        *slot = Some(token.clone());
        Ok(token)
    }

    async fn read(&self, path: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .get(format!("{}/v1/secret/{}", self.address, path))
            .header("X-Vault-Token", self.token().await?)
            .send()
            .await?;
        match resp.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(resp.json::<SecretResponse>().await?.data.value)),
            s => Err(anyhow!("vault read {} failed, status: {}", path, s)),
        }
    }

    async fn write(&self, path: &str, value: String) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/v1/secret/{}", self.address, path))
            .header("X-Vault-Token", self.token().await?)
            .json(&SecretValue { value })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(anyhow!("vault write {} failed, status: {}", path, resp.status()));
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let resp = self
            .client
            .delete(format!("{}/v1/secret/{}", self.address, path))
            .header("X-Vault-Token", self.token().await?)
            .send()
            .await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(anyhow!("vault delete {} failed, status: {}", path, resp.status()));
        }
        Ok(())
    }

    pub async fn get_certificate(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.read(&format!("certs/{key}")).await? {
            Some(v) => Ok(Some(STANDARD.decode(v)?)),
            None => Ok(None),
        }
    }

    pub async fn put_certificate(&self, key: &str, data: &[u8]) -> Result<()> {
        self.write(&format!("certs/{key}"), STANDARD.encode(data)).await
    }

    pub async fn delete_certificate(&self, key: &str) -> Result<()> {
        self.delete(&format!("certs/{key}")).await
    }
}

#[async_trait]
impl SecretStore for VaultSecrets {
    fn name(&self) -> &'static str {
        "vault"
    }

    async fn get_secret(&self, name: &str) -> Option<String> {
        match self.read(name).await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("vault secret {:?} unavailable, {:?}", name, e);
                None
            }
        }
    }
}

/// Vault when an address is configured, the environment otherwise.
pub fn new_secret_store(vault: &Vault, user: &str) -> Result<Arc<dyn SecretStore>> {
    if vault.enabled() {
        Ok(Arc::new(VaultSecrets::new(&vault.address, &vault.app, user)?))
    } else {
        Ok(Arc::new(EnvironmentSecrets))
    }
}
