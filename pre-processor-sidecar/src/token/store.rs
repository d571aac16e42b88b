//! C1 — Token Store: persist/read the current token tuple, either against a
//! Kubernetes Secret or the process environment.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::Client;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::models::TokenTuple;

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> CoreResult<TokenTuple>;
    async fn save(&self, tuple: &TokenTuple) -> CoreResult<()>;

    /// Subscribe to external changes to the backing store. Only the
    /// Kubernetes-backed variant implements this; other variants return
    /// `None`, signalling that C3 should not start a watch loop.
    fn watch(&self) -> Option<mpsc::Receiver<TokenTuple>> {
        None
    }
}

fn tuple_to_string_data(tuple: &TokenTuple) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    data.insert("access_token".to_string(), tuple.access_token.clone());
    data.insert("refresh_token".to_string(), tuple.refresh_token.clone());
    data.insert("token_type".to_string(), tuple.token_type.clone());
    data.insert("expires_at".to_string(), tuple.expires_at.to_rfc3339());
    data.insert("issued_at".to_string(), tuple.issued_at.to_rfc3339());
    data
}

fn string_data_to_tuple(data: &BTreeMap<String, String>) -> CoreResult<TokenTuple> {
    let get = |key: &str| -> CoreResult<String> {
        data.get(key)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("secret key {key} missing")))
    };

    let expires_at = DateTime::parse_from_rfc3339(&get("expires_at")?)
        .map_err(|e| CoreError::Internal(format!("invalid expires_at in secret: {e}")))?
        .with_timezone(&Utc);
    let issued_at = DateTime::parse_from_rfc3339(&get("issued_at")?)
        .map_err(|e| CoreError::Internal(format!("invalid issued_at in secret: {e}")))?
        .with_timezone(&Utc);

    Ok(TokenTuple {
        access_token: get("access_token")?,
        refresh_token: get("refresh_token")?,
        token_type: get("token_type").unwrap_or_else(|_| "Bearer".to_string()),
        expires_at,
        issued_at,
    })
}

/// Kubernetes-Secret-backed token store. Writes are full replacements;
/// reads return whatever the API server currently holds.
pub struct SecretTokenStore {
    client: Client,
    namespace: String,
    secret_name: String,
    resource_version: RwLock<Option<String>>,
}

impl SecretTokenStore {
    pub fn new(client: Client, namespace: impl Into<String>, secret_name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            secret_name: secret_name.into(),
            resource_version: RwLock::new(None),
        }
    }

    fn api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl TokenStore for SecretTokenStore {
    async fn load(&self) -> CoreResult<TokenTuple> {
        let secret = self
            .api()
            .get(&self.secret_name)
            .await
            .map_err(|e| match e {
                kube::Error::Api(ref ae) if ae.code == 404 => {
                    CoreError::NotFound(format!("secret {} not found", self.secret_name))
                }
                other => CoreError::Transient(other.to_string()),
            })?;

        *self.resource_version.write().expect("resource version lock poisoned") =
            secret.metadata.resource_version.clone();

        let string_data = secret
            .data
            .map(|map| {
                map.into_iter()
                    .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).to_string()))
                    .collect::<BTreeMap<_, _>>()
            })
            .unwrap_or_default();

        string_data_to_tuple(&string_data)
    }

    async fn save(&self, tuple: &TokenTuple) -> CoreResult<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.secret_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            string_data: Some(
                tuple_to_string_data(tuple)
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };

        self.api()
            .replace(&self.secret_name, &PostParams::default(), &secret)
            .await
            .map_err(|e| CoreError::Transient(format!("failed to persist token secret: {e}")))?;

        Ok(())
    }

    fn watch(&self) -> Option<mpsc::Receiver<TokenTuple>> {
        let (tx, rx) = mpsc::channel(4);
        let client = self.client.clone();
        let namespace = self.namespace.clone();
        let secret_name = self.secret_name.clone();

        tokio::spawn(async move {
            let api: Api<Secret> = Api::namespaced(client, &namespace);
            let watcher_config = watcher::Config::default()
                .fields(&format!("metadata.name={secret_name}"));
            let mut stream = Box::pin(watcher::watcher(api, watcher_config));

            while let Some(event) = stream.next().await {
                match event {
                    Ok(Event::Applied(secret)) => {
                        if let Some(tuple) = secret_to_tuple_lenient(&secret) {
                            debug!(secret = %secret_name, "observed external secret change");
                            if tx.send(tuple).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Event::Restarted(secrets)) => {
                        if let Some(secret) = secrets.into_iter().find(|s| {
                            s.metadata.name.as_deref() == Some(secret_name.as_str())
                        }) {
                            if let Some(tuple) = secret_to_tuple_lenient(&secret) {
                                if tx.send(tuple).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Event::Deleted(_)) => {
                        warn!(secret = %secret_name, "token secret deleted externally");
                    }
                    Err(e) => {
                        warn!(error = %e, "secret watch stream error, continuing");
                    }
                }
            }
            info!(secret = %secret_name, "secret watch loop terminated");
        });

        Some(rx)
    }
}

fn secret_to_tuple_lenient(secret: &Secret) -> Option<TokenTuple> {
    let string_data = secret.data.as_ref()?.iter()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).to_string()))
        .collect::<BTreeMap<_, _>>();
    string_data_to_tuple(&string_data).ok()
}

/// Process-environment-backed token store. Read-only after process start;
/// `save` only updates the in-process view (there is no orchestrator to
/// persist to), which is sufficient for dev and for deployments without a
/// Kubernetes control plane.
pub struct EnvVarTokenStore {
    cached: RwLock<Option<TokenTuple>>,
}

impl EnvVarTokenStore {
    pub fn new(bootstrap_access: Option<String>, bootstrap_refresh: Option<String>) -> Self {
        // Only the refresh token is strictly required to bootstrap (the
        // access token, if present, is treated as already-expired so C3
        // proactively refreshes rather than trusting an externally-issued
        // lifetime it cannot see). A bare access token with no refresh token
        // cannot bootstrap anything, so that combination is dropped.
        let cached = bootstrap_refresh.map(|refresh_token| {
            let now = Utc::now();
            TokenTuple {
                access_token: bootstrap_access.unwrap_or_default(),
                refresh_token,
                token_type: "Bearer".to_string(),
                expires_at: now,
                issued_at: now - chrono::Duration::seconds(1),
            }
        });

        Self {
            cached: RwLock::new(cached),
        }
    }
}

#[async_trait]
impl TokenStore for EnvVarTokenStore {
    async fn load(&self) -> CoreResult<TokenTuple> {
        self.cached
            .read()
            .expect("env token store lock poisoned")
            .clone()
            .ok_or_else(|| CoreError::NotFound("no bootstrap token in environment".to_string()))
    }

    async fn save(&self, tuple: &TokenTuple) -> CoreResult<()> {
        *self.cached.write().expect("env token store lock poisoned") = Some(tuple.clone());
        Ok(())
    }
}

pub fn build_token_store(
    kube_client: Option<Arc<Client>>,
    settings: &crate::config::TokenStoreSettings,
    bootstrap_access: Option<String>,
    bootstrap_refresh: Option<String>,
) -> CoreResult<Arc<dyn TokenStore>> {
    use crate::config::TokenStorageType;

    match settings.storage_type {
        TokenStorageType::KubernetesSecret => {
            let client = kube_client.ok_or_else(|| {
                CoreError::Internal(
                    "kubernetes_secret storage selected but no kube client was constructed".into(),
                )
            })?;
            Ok(Arc::new(SecretTokenStore::new(
                (*client).clone(),
                settings.namespace.clone(),
                settings.secret_name.clone(),
            )))
        }
        TokenStorageType::EnvVar => Ok(Arc::new(EnvVarTokenStore::new(
            bootstrap_access,
            bootstrap_refresh,
        ))),
    }
}
