// Generic resource client: url building, query merging and the verb set
use super::transport::{ApiRequest, MERGE_PATCH_CONTENT_TYPE, Method, Transport};
use super::watch::{Watch, WatchConfig};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Operations a resource can advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verb {
    Get,
    List,
    Delete,
    DeleteCollection,
    Create,
    Update,
    Upsert,
    Patch,
    Watch,
}

impl Verb {
    pub const ALL: [Self; 9] = [
        Self::Get,
        Self::List,
        Self::Delete,
        Self::DeleteCollection,
        Self::Create,
        Self::Update,
        Self::Upsert,
        Self::Patch,
        Self::Watch,
    ];

    /// Name as it appears in discovery documents
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Delete => "delete",
            Self::DeleteCollection => "deletecollection",
            Self::Create => "create",
            Self::Update => "update",
            Self::Upsert => "upsert",
            Self::Patch => "patch",
            Self::Watch => "watch",
        }
    }

    /// Parse a discovery verb; verbs this crate does not model (`proxy`, ...) yield `None`
    #[must_use]
    pub fn parse(verb: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == verb)
    }

    const fn method(self) -> Method {
        match self {
            Self::Get | Self::List | Self::Watch => Method::Get,
            Self::Delete | Self::DeleteCollection => Method::Delete,
            Self::Create | Self::Upsert => Method::Post,
            Self::Update => Method::Put,
            Self::Patch => Method::Patch,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query string parameters.
///
/// Merging keeps every default and lets the call site override individual keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query(BTreeMap<String, String>);

impl Query {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    #[must_use]
    pub fn label_selector(self, selector: &str) -> Self {
        self.param("labelSelector", selector)
    }

    #[must_use]
    pub fn field_selector(self, selector: &str) -> Self {
        self.param("fieldSelector", selector)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }

    /// `self` as defaults, `overrides` on top
    #[must_use]
    pub fn merged(&self, overrides: &Self) -> Self {
        let mut merged = self.clone();
        for (key, value) in overrides.iter() {
            merged.0.insert(key.clone(), value.clone());
        }
        merged
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Query {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// What a [`ResourceClient`] addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceTarget {
    /// Literal path below the base url, e.g. `api/v1/namespaces/default/configmaps`
    Path(String),
    /// A discovered resource; the url is assembled per verb
    Resource {
        /// Group/version path, `api/v1` or `apis/<group>/<version>`
        base_path: String,
        /// Resource name, possibly a sub-resource such as `pods/log`
        name: String,
        namespaced: bool,
    },
}

impl ResourceTarget {
    #[must_use]
    pub fn path(path: impl AsRef<str>) -> Self {
        Self::Path(path.as_ref().trim_matches('/').to_string())
    }

    #[must_use]
    pub fn resource(base_path: impl AsRef<str>, name: impl Into<String>, namespaced: bool) -> Self {
        Self::Resource {
            base_path: base_path.as_ref().trim_matches('/').to_string(),
            name: name.into(),
            namespaced,
        }
    }

    /// Resolve the url path for one verb.
    ///
    /// For discovered resources the `watch` segment follows the group/version,
    /// `namespaces/<ns>` follows that when the resource is namespaced and a
    /// namespace is set, and a sub-resource (`pods/log`) gets the instance
    /// name spliced in between its two halves.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingName` for a sub-resource without an instance name
    pub fn url(&self, verb: Verb, namespace: Option<&str>, name: Option<&str>) -> Result<String> {
        match self {
            Self::Path(path) => Ok(join(
                [Some(path.as_str()), name].into_iter().flatten(),
            )),
            Self::Resource {
                base_path,
                name: resource,
                namespaced,
            } => {
                let mut segments = vec![base_path.as_str()];
                if verb == Verb::Watch {
                    segments.push("watch");
                }
                if let (true, Some(ns)) = (*namespaced, namespace) {
                    segments.push("namespaces");
                    segments.push(ns);
                }
                match resource.split_once('/') {
                    Some((parent, sub)) => {
                        let instance = name.ok_or_else(|| Error::MissingName {
                            resource: resource.clone(),
                        })?;
                        segments.extend([parent, instance, sub]);
                    }
                    None => {
                        segments.push(resource);
                        segments.extend(name);
                    }
                }
                Ok(join(segments))
            }
        }
    }

    #[must_use]
    pub const fn is_path(&self) -> bool {
        matches!(self, Self::Path(_))
    }
}

impl From<&str> for ResourceTarget {
    fn from(path: &str) -> Self {
        Self::path(path)
    }
}

impl From<String> for ResourceTarget {
    fn from(path: String) -> Self {
        Self::path(path)
    }
}

impl fmt::Display for ResourceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "/{path}"),
            Self::Resource {
                base_path, name, ..
            } => write!(f, "/{base_path}/{name}"),
        }
    }
}

fn join<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    segments
        .into_iter()
        .map(|segment| segment.trim_matches('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Issues the verb set against one target.
///
/// Every call is an independent exchange; clones share the transport.
#[derive(Debug, Clone)]
pub struct ResourceClient {
    transport: Arc<dyn Transport>,
    target: ResourceTarget,
    namespace: Option<String>,
    defaults: Query,
    watch_config: WatchConfig,
}

impl ResourceClient {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, target: impl Into<ResourceTarget>) -> Self {
        Self {
            transport,
            target: target.into(),
            namespace: None,
            defaults: Query::default(),
            watch_config: WatchConfig::default(),
        }
    }

    /// Namespace used for namespaced discovered resources; ignored for literal paths
    #[must_use]
    pub fn namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Query parameters merged under every call's own parameters
    #[must_use]
    pub fn defaults(mut self, defaults: Query) -> Self {
        self.defaults = defaults;
        self
    }

    #[must_use]
    pub const fn watch_config(mut self, config: WatchConfig) -> Self {
        self.watch_config = config;
        self
    }

    /// Same transport and configuration, different target
    #[must_use]
    pub fn retarget(&self, target: impl Into<ResourceTarget>) -> Self {
        Self {
            target: target.into(),
            ..self.clone()
        }
    }

    #[must_use]
    pub const fn target(&self) -> &ResourceTarget {
        &self.target
    }

    #[must_use]
    pub const fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn request(&self, verb: Verb, name: Option<&str>, query: &Query) -> Result<ApiRequest> {
        let path = self.target.url(verb, self.namespace.as_deref(), name)?;
        let request = ApiRequest::new(verb.method(), path).query(self.defaults.merged(query));
        debug!("invoking resource `{}` {} {:?}", verb, request.path, request.query);
        Ok(request)
    }

    /// # Errors
    ///
    /// Returns the transport error for non-2xx responses
    pub async fn get(&self, name: &str, query: &Query) -> Result<Value> {
        let request = self.request(Verb::Get, Some(name), query)?;
        self.transport.send(request).await
    }

    /// # Errors
    ///
    /// Returns the transport error for non-2xx responses
    pub async fn list(&self, query: &Query) -> Result<Value> {
        let request = self.request(Verb::List, None, query)?;
        self.transport.send(request).await
    }

    /// # Errors
    ///
    /// Returns the transport error for non-2xx responses
    pub async fn delete(&self, name: &str, query: &Query) -> Result<Value> {
        let request = self.request(Verb::Delete, Some(name), query)?;
        self.transport.send(request).await
    }

    /// # Errors
    ///
    /// Returns the transport error for non-2xx responses
    pub async fn delete_collection(&self, query: &Query) -> Result<Value> {
        let request = self.request(Verb::DeleteCollection, None, query)?;
        self.transport.send(request).await
    }

    /// # Errors
    ///
    /// Returns the transport error for non-2xx responses; 409 if the object exists
    pub async fn create(&self, body: &Value, query: &Query) -> Result<Value> {
        let request = self
            .request(Verb::Create, None, query)?
            .body(body.clone());
        self.transport.send(request).await
    }

    /// # Errors
    ///
    /// Returns the transport error for non-2xx responses
    pub async fn update(&self, name: &str, body: &Value, query: &Query) -> Result<Value> {
        let request = self
            .request(Verb::Update, Some(name), query)?
            .body(body.clone());
        self.transport.send(request).await
    }

    /// Create, or update with the same arguments when the object already exists
    ///
    /// # Errors
    ///
    /// Any failure other than the create conflict is returned unchanged
    pub async fn upsert(&self, name: &str, body: &Value, query: &Query) -> Result<Value> {
        match self.create(body, query).await {
            Err(e) if e.is_conflict() => {
                debug!("`{}` exists at {}, updating instead", name, self.target);
                self.update(name, body, query).await
            }
            other => other,
        }
    }

    /// JSON merge patch (RFC 7386)
    ///
    /// # Errors
    ///
    /// Returns the transport error for non-2xx responses
    pub async fn patch(&self, name: &str, body: &Value, query: &Query) -> Result<Value> {
        let request = self
            .request(Verb::Patch, Some(name), query)?
            .header("content-type", MERGE_PATCH_CONTENT_TYPE)
            .body(body.clone());
        self.transport.send(request).await
    }

    /// Start a resumable watch of the collection, or of one object when `name` is given.
    ///
    /// The connection opens once the first subscriber attaches. Must be
    /// called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the watch url cannot be built
    pub fn watch(&self, name: Option<&str>, query: &Query) -> Result<Watch> {
        let mut query = self.defaults.merged(query);
        let path = if self.target.is_path() {
            // Object urls take no watch flag, narrow the collection instead
            if let Some(name) = name {
                query.insert("fieldSelector", format!("metadata.name={name}"));
            }
            if query.get("watch").is_none() {
                query.insert("watch", "true");
            }
            self.target.url(Verb::Watch, self.namespace.as_deref(), None)?
        } else {
            self.target.url(Verb::Watch, self.namespace.as_deref(), name)?
        };
        debug!("invoking resource `watch` {} {:?}", path, query);
        Ok(Watch::start(
            Arc::clone(&self.transport),
            path,
            query,
            self.watch_config.clone(),
        ))
    }
}
