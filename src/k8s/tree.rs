// Call surface built from the discovery catalog
use super::client::{Query, ResourceClient, Verb};
use super::discovery::ResourceDescriptor;
use super::transport::Transport;
use super::watch::{Watch, WatchConfig};
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A discovered resource with its verbs bound to a scoped [`ResourceClient`]
#[derive(Debug, Clone)]
pub struct BoundResource {
    descriptor: Arc<ResourceDescriptor>,
    client: ResourceClient,
}

impl BoundResource {
    #[must_use]
    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub const fn client(&self) -> &ResourceClient {
        &self.client
    }

    #[must_use]
    pub fn supports(&self, verb: Verb) -> bool {
        self.descriptor.supports(verb)
    }

    fn ensure(&self, verb: Verb) -> Result<()> {
        if self.supports(verb) {
            Ok(())
        } else {
            Err(Error::UnsupportedVerb {
                resource: self.descriptor.dotted_path(),
                verb,
            })
        }
    }

    /// # Errors
    ///
    /// `Error::UnsupportedVerb` if the server does not advertise `get`, else the transport error
    pub async fn get(&self, name: &str, query: &Query) -> Result<Value> {
        self.ensure(Verb::Get)?;
        self.client.get(name, query).await
    }

    /// # Errors
    ///
    /// `Error::UnsupportedVerb` if the server does not advertise `list`, else the transport error
    pub async fn list(&self, query: &Query) -> Result<Value> {
        self.ensure(Verb::List)?;
        self.client.list(query).await
    }

    /// # Errors
    ///
    /// `Error::UnsupportedVerb` if the server does not advertise `delete`, else the transport error
    pub async fn delete(&self, name: &str, query: &Query) -> Result<Value> {
        self.ensure(Verb::Delete)?;
        self.client.delete(name, query).await
    }

    /// # Errors
    ///
    /// `Error::UnsupportedVerb` if the server does not advertise `deletecollection`, else the transport error
    pub async fn delete_collection(&self, query: &Query) -> Result<Value> {
        self.ensure(Verb::DeleteCollection)?;
        self.client.delete_collection(query).await
    }

    /// # Errors
    ///
    /// `Error::UnsupportedVerb` if the server does not advertise `create`, else the transport error
    pub async fn create(&self, body: &Value, query: &Query) -> Result<Value> {
        self.ensure(Verb::Create)?;
        self.client.create(body, query).await
    }

    /// # Errors
    ///
    /// `Error::UnsupportedVerb` if the server does not advertise `update`, else the transport error
    pub async fn update(&self, name: &str, body: &Value, query: &Query) -> Result<Value> {
        self.ensure(Verb::Update)?;
        self.client.update(name, body, query).await
    }

    /// # Errors
    ///
    /// `Error::UnsupportedVerb` unless the resource can be updated, else the transport error
    pub async fn upsert(&self, name: &str, body: &Value, query: &Query) -> Result<Value> {
        self.ensure(Verb::Upsert)?;
        self.client.upsert(name, body, query).await
    }

    /// # Errors
    ///
    /// `Error::UnsupportedVerb` if the server does not advertise `patch`, else the transport error
    pub async fn patch(&self, name: &str, body: &Value, query: &Query) -> Result<Value> {
        self.ensure(Verb::Patch)?;
        self.client.patch(name, body, query).await
    }

    /// # Errors
    ///
    /// `Error::UnsupportedVerb` if the server does not advertise `watch`
    pub fn watch(&self, name: Option<&str>, query: &Query) -> Result<Watch> {
        self.ensure(Verb::Watch)?;
        self.client.watch(name, query)
    }
}

#[derive(Debug, Clone)]
pub enum ApiNode {
    Group(BTreeMap<String, ApiNode>),
    Resource(BoundResource),
}

impl ApiNode {
    #[must_use]
    pub const fn as_resource(&self) -> Option<&BoundResource> {
        match self {
            Self::Resource(resource) => Some(resource),
            Self::Group(_) => None,
        }
    }

    #[must_use]
    pub const fn children(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Group(children) => Some(children),
            Self::Resource(_) => None,
        }
    }

    /// Resolve a dotted or slashed path below this node
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&Self> {
        let path = path.trim_matches(|c: char| c == '.' || c == '/');
        if path.is_empty() {
            return Some(self);
        }
        descend(self.children()?, path)
    }
}

/// Keys may contain dots themselves (`foobar.com`), so every key that is a
/// prefix of the remaining path up to a separator is a candidate; longer keys
/// are tried first and a dead end backtracks to the next candidate.
fn descend<'a>(children: &'a BTreeMap<String, ApiNode>, rest: &str) -> Option<&'a ApiNode> {
    let mut candidates: Vec<(&String, &ApiNode, &str)> = children
        .iter()
        .filter_map(|(key, node)| {
            let tail = rest.strip_prefix(key.as_str())?;
            if tail.is_empty() {
                Some((key, node, tail))
            } else {
                tail.strip_prefix(['.', '/']).map(|tail| (key, node, tail))
            }
        })
        .collect();
    candidates.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    candidates.into_iter().find_map(|(_, node, tail)| {
        if tail.is_empty() {
            Some(node)
        } else {
            descend(node.children()?, tail)
        }
    })
}

/// Immutable group → version → resource registry
#[derive(Debug, Clone)]
pub struct ApiTree {
    root: ApiNode,
}

impl Default for ApiTree {
    fn default() -> Self {
        Self {
            root: ApiNode::Group(BTreeMap::new()),
        }
    }
}

impl ApiTree {
    #[must_use]
    pub const fn root(&self) -> &ApiNode {
        &self.root
    }

    /// Resolve `api.v1.configmaps`, `apis/apps/v1/deployments` and the like
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&ApiNode> {
        self.root.lookup(path)
    }

    #[must_use]
    pub fn resource(&self, path: &str) -> Option<&BoundResource> {
        self.lookup(path).and_then(ApiNode::as_resource)
    }

    /// Bound resource for a group/version path and resource name
    #[must_use]
    pub fn resource_at(&self, base_path: &str, name: &str) -> Option<&BoundResource> {
        let mut node = &self.root;
        for segment in base_path.trim_matches('/').split('/').chain([name]) {
            node = node.children()?.get(segment)?;
        }
        node.as_resource()
    }

    /// Every bound resource, in key order
    #[must_use]
    pub fn resources(&self) -> Vec<&BoundResource> {
        fn collect<'a>(node: &'a ApiNode, out: &mut Vec<&'a BoundResource>) {
            match node {
                ApiNode::Resource(resource) => out.push(resource),
                ApiNode::Group(children) => {
                    for child in children.values() {
                        collect(child, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.root, &mut out);
        out
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.children().is_none_or(BTreeMap::is_empty)
    }
}

/// Binds discovered descriptors into an [`ApiTree`]
#[derive(Debug, Clone)]
pub struct ApiTreeBuilder {
    transport: Arc<dyn Transport>,
    namespace: Option<String>,
    defaults: Query,
    watch_config: WatchConfig,
}

impl ApiTreeBuilder {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            namespace: None,
            defaults: Query::default(),
            watch_config: WatchConfig::default(),
        }
    }

    #[must_use]
    pub fn namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    #[must_use]
    pub fn defaults(mut self, defaults: Query) -> Self {
        self.defaults = defaults;
        self
    }

    #[must_use]
    pub fn watch_config(mut self, config: WatchConfig) -> Self {
        self.watch_config = config;
        self
    }

    fn bind(&self, descriptor: &ResourceDescriptor) -> BoundResource {
        let client = ResourceClient::new(Arc::clone(&self.transport), descriptor.target())
            .namespace(self.namespace.clone())
            .defaults(self.defaults.clone())
            .watch_config(self.watch_config.clone());
        BoundResource {
            descriptor: Arc::new(descriptor.clone()),
            client,
        }
    }

    #[must_use]
    pub fn build(&self, descriptors: &[ResourceDescriptor]) -> ApiTree {
        let mut root = BTreeMap::new();

        'descriptors: for descriptor in descriptors {
            let mut children = &mut root;
            for segment in descriptor.base_path.split('/').filter(|s| !s.is_empty()) {
                children = match children
                    .entry(segment.to_string())
                    .or_insert_with(|| ApiNode::Group(BTreeMap::new()))
                {
                    ApiNode::Group(next) => next,
                    ApiNode::Resource(_) => {
                        warn!(
                            "Skipping {}: `{}` is already bound to a resource",
                            descriptor.dotted_path(),
                            segment
                        );
                        continue 'descriptors;
                    }
                };
            }
            children.insert(descriptor.name.clone(), ApiNode::Resource(self.bind(descriptor)));
        }

        let tree = ApiTree {
            root: ApiNode::Group(root),
        };
        debug!("🌳 Built api tree with {} resources", tree.resources().len());
        tree
    }
}
