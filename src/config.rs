/**
 * Connection and client configuration
 *
 * Everything the client needs is passed in explicitly; nothing is read from
 * the environment or the home directory.
 */
use crate::error::{Error, Result};
use crate::k8s::client::Query;
use crate::k8s::watch::WatchConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

/// Collection that custom resource definitions are registered in
pub const CRD_COLLECTION_PATH: &str = "apis/apiextensions.k8s.io/v1/customresourcedefinitions";

/// Collection namespaces are created in when `ensure_namespace` is set
pub const NAMESPACE_COLLECTION_PATH: &str = "api/v1/namespaces";

const fn reject_unauthorized_default() -> bool {
    true
}

/// Where the API server lives and how to authenticate against it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    pub base_url: Url,
    /// PEM encoded certificate authority bundle
    #[serde(default)]
    pub ca: Option<String>,
    /// PEM encoded client certificate
    #[serde(default)]
    pub cert: Option<String>,
    /// PEM encoded private key for `cert`
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "reject_unauthorized_default")]
    pub reject_unauthorized: bool,
    /// Full value of the `authorization` header, e.g. `Bearer <token>`
    #[serde(default)]
    pub authorization: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ConnectionDescriptor {
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            ca: None,
            cert: None,
            key: None,
            reject_unauthorized: true,
            authorization: None,
            headers: BTreeMap::new(),
        }
    }

    /// Parse `base_url` and build a descriptor without credentials
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an absolute URL
    pub fn from_url(base_url: &str) -> Result<Self> {
        Ok(Self::new(Url::parse(base_url)?))
    }

    #[must_use]
    pub fn with_ca(mut self, pem: impl Into<String>) -> Self {
        self.ca = Some(pem.into());
        self
    }

    #[must_use]
    pub fn with_client_identity(mut self, cert: impl Into<String>, key: impl Into<String>) -> Self {
        self.cert = Some(cert.into());
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_bearer_token(mut self, token: &str) -> Self {
        self.authorization = Some(format!("Bearer {}", token.trim()));
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub const fn reject_unauthorized(mut self, reject: bool) -> Self {
        self.reject_unauthorized = reject;
        self
    }

    /// Check that the TLS material is usable as a pair
    ///
    /// # Errors
    ///
    /// Returns an error if only one of `cert` and `key` is present
    pub fn validate(&self) -> Result<()> {
        match (&self.cert, &self.key) {
            (Some(_), None) => Err(Error::Connection(
                "client certificate given without a private key".to_string(),
            )),
            (None, Some(_)) => Err(Error::Connection(
                "private key given without a client certificate".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Supplies the connection descriptor before the client is constructed.
///
/// Kubeconfig parsing, in-cluster service accounts or a spawned
/// `kubectl proxy` all live behind this trait, outside of this crate.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// # Errors
    ///
    /// Any error is fatal to client construction
    async fn connection(&self) -> Result<ConnectionDescriptor>;
}

#[async_trait]
impl ConnectionProvider for ConnectionDescriptor {
    async fn connection(&self) -> Result<ConnectionDescriptor> {
        self.validate()?;
        Ok(self.clone())
    }
}

/// Options for building the facade
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiOptions {
    /// Namespace inserted into the urls of namespaced resources
    pub namespace: Option<String>,
    /// Create `namespace` before anything else if it does not exist
    pub ensure_namespace: bool,
    /// Top-level shortcuts, alias -> dotted tree path (e.g. `api.v1.configmaps`)
    pub aliases: BTreeMap<String, String>,
    /// CustomResourceDefinition manifests registered before discovery
    pub custom_resources: Vec<Value>,
    /// Query parameters applied to every verb unless overridden per call
    pub query: Query,
    pub watch: WatchConfig,
}

impl ApiOptions {
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub const fn ensure_namespace(mut self, ensure: bool) -> Self {
        self.ensure_namespace = ensure;
        self
    }

    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>, path: impl Into<String>) -> Self {
        self.aliases.insert(alias.into(), path.into());
        self
    }

    #[must_use]
    pub fn custom_resource(mut self, manifest: Value) -> Self {
        self.custom_resources.push(manifest);
        self
    }

    #[must_use]
    pub fn query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    #[must_use]
    pub const fn watch(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }
}
