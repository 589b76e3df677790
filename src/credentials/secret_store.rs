//! Password storage in Kubernetes Secrets

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;
use thiserror::Error;
use tracing::{debug, info};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "postgres-access-operator";

/// Label set on every Secret the operator writes
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";

#[derive(Error, Debug)]
pub enum SecretStoreError {
    #[error("Kubernetes API error for secret {namespace}/{name}: {source}")]
    Kube {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("Timed out after {timeout:?} accessing secret {namespace}/{name}")]
    Timeout {
        namespace: String,
        name: String,
        timeout: Duration,
    },
}

/// Where a role's credential lives
#[derive(Clone, Debug, PartialEq)]
pub struct SecretLocation {
    pub namespace: String,
    pub name: String,
    /// Set when the Secret lives next to the resource and should be garbage collected with it
    pub owner: Option<OwnerReference>,
}

/// Contents of a credential Secret
#[derive(Clone, PartialEq, Eq)]
pub struct SecretPayload {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SecretPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretPayload")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Storage for role passwords
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Current payload, `None` when the Secret or its password is missing
    async fn get(&self, location: &SecretLocation)
    -> Result<Option<SecretPayload>, SecretStoreError>;

    /// Create or replace the payload
    async fn put(
        &self,
        location: &SecretLocation,
        payload: &SecretPayload,
    ) -> Result<(), SecretStoreError>;
}

/// [`SecretStore`] backed by the Kubernetes API
pub struct KubeSecretStore {
    client: Client,
    timeout: Duration,
}

impl KubeSecretStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api(&self, location: &SecretLocation) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &location.namespace)
    }

    fn kube_error(location: &SecretLocation) -> impl FnOnce(kube::Error) -> SecretStoreError + '_ {
        move |source| SecretStoreError::Kube {
            namespace: location.namespace.clone(),
            name: location.name.clone(),
            source,
        }
    }

    fn timeout_error(&self, location: &SecretLocation) -> SecretStoreError {
        SecretStoreError::Timeout {
            namespace: location.namespace.clone(),
            name: location.name.clone(),
            timeout: self.timeout,
        }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(
        &self,
        location: &SecretLocation,
    ) -> Result<Option<SecretPayload>, SecretStoreError> {
        let api = self.api(location);
        let secret = tokio::time::timeout(self.timeout, api.get_opt(&location.name))
            .await
            .map_err(|_| self.timeout_error(location))?
            .map_err(Self::kube_error(location))?;

        Ok(secret.and_then(|s| payload_from_secret(&s)))
    }

    async fn put(
        &self,
        location: &SecretLocation,
        payload: &SecretPayload,
    ) -> Result<(), SecretStoreError> {
        let secret = secret_for(location, payload);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let api = self.api(location);
        tokio::time::timeout(
            self.timeout,
            api.patch(&location.name, &params, &Patch::Apply(&secret)),
        )
        .await
        .map_err(|_| self.timeout_error(location))?
        .map_err(Self::kube_error(location))?;

        info!(
            secret = %location.name,
            namespace = %location.namespace,
            role = %payload.username,
            "Wrote credential secret"
        );
        Ok(())
    }
}

/// Read the payload out of a Secret
///
/// The username falls back to an empty string so a Secret holding only a
/// password is still usable; the caller rewrites it with the role name.
pub fn payload_from_secret(secret: &Secret) -> Option<SecretPayload> {
    let data = secret.data.as_ref();
    let field = |key: &str| -> Option<String> {
        data.and_then(|d| d.get(key))
            .and_then(|v| String::from_utf8(v.0.clone()).ok())
    };

    let password = field(PASSWORD_KEY).filter(|p| !p.is_empty());
    if password.is_none() {
        debug!(
            secret = %secret.metadata.name.as_deref().unwrap_or_default(),
            "Secret has no password"
        );
    }
    Some(SecretPayload {
        username: field(USERNAME_KEY).unwrap_or_default(),
        password: password?,
    })
}

/// Secret manifest for server-side apply
pub fn secret_for(location: &SecretLocation, payload: &SecretPayload) -> Secret {
    let data: BTreeMap<String, ByteString> = [
        (
            USERNAME_KEY.to_string(),
            ByteString(payload.username.as_bytes().to_vec()),
        ),
        (
            PASSWORD_KEY.to_string(),
            ByteString(payload.password.as_bytes().to_vec()),
        ),
    ]
    .into_iter()
    .collect();

    Secret {
        metadata: ObjectMeta {
            name: Some(location.name.clone()),
            namespace: Some(location.namespace.clone()),
            labels: Some(
                [(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string())]
                    .into_iter()
                    .collect(),
            ),
            owner_references: location.owner.clone().map(|o| vec![o]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}
