use super::client::{Query, ResourceClient, ResourceTarget};
use super::discovery::discover;
use super::transport::{HttpTransport, Transport};
use super::tree::{ApiNode, ApiTree, ApiTreeBuilder, BoundResource};
use crate::config::{
    ApiOptions, CRD_COLLECTION_PATH, ConnectionProvider, NAMESPACE_COLLECTION_PATH,
};
use crate::error::{Error, Result, ignore_conflict};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Entry point: raw resource access, the discovered tree and caller aliases.
///
/// Everything is resolved during construction; afterwards the value is
/// read-only and can be shared between tasks behind an `Arc`.
#[derive(Debug, Clone)]
pub struct KubernetesApi {
    transport: Arc<dyn Transport>,
    options: ApiOptions,
    version: Value,
    tree: ApiTree,
    aliases: BTreeMap<String, ApiNode>,
}

impl KubernetesApi {
    /// Resolve the connection and build the client over HTTP
    ///
    /// # Errors
    ///
    /// Fails if the provider fails, the TLS material is unusable, or any
    /// construction step in [`KubernetesApi::with_transport`] fails
    pub async fn connect(provider: &dyn ConnectionProvider, options: ApiOptions) -> Result<Self> {
        let descriptor = provider.connection().await.map_err(|e| {
            error!("❌ Failed to resolve connection: {}", e);
            e
        })?;
        debug!("🔧 Connecting to {}", descriptor.base_url);

        let transport = HttpTransport::new(&descriptor)?;
        Self::with_transport(Arc::new(transport), options).await
    }

    /// Build the client over an existing transport.
    ///
    /// In order: provision the namespace (if asked), register custom
    /// resources, read the server version, discover, build the tree and
    /// resolve aliases.
    ///
    /// # Errors
    ///
    /// `Error::Discovery` for any non-conflict failure before the tree is
    /// built, `Error::UnresolvedAlias` for an alias that names no node
    pub async fn with_transport(transport: Arc<dyn Transport>, options: ApiOptions) -> Result<Self> {
        if options.ensure_namespace {
            if let Some(namespace) = &options.namespace {
                ensure_namespace(&transport, namespace).await?;
            }
        }

        register_custom_resources(&transport, &options.custom_resources).await?;

        let version = ResourceClient::new(Arc::clone(&transport), "version")
            .list(&Query::default())
            .await
            .map_err(|e| Error::discovery("server version", e))?;

        let root = ResourceClient::new(Arc::clone(&transport), ResourceTarget::path(""));
        let descriptors = discover(&root).await?;

        let tree = ApiTreeBuilder::new(Arc::clone(&transport))
            .namespace(options.namespace.clone())
            .defaults(options.query.clone())
            .watch_config(options.watch.clone())
            .build(&descriptors);

        let aliases = resolve_aliases(&tree, &options.aliases)?;

        let git_version = version
            .get("gitVersion")
            .and_then(Value::as_str)
            .unwrap_or("(unknown version)");
        info!(
            "✅ Connected to Kubernetes {} with {} resources",
            git_version,
            descriptors.len()
        );

        Ok(Self {
            transport,
            options,
            version,
            tree,
            aliases,
        })
    }

    /// Raw client for a literal path such as `api/v1/namespaces/default/configmaps`
    #[must_use]
    pub fn resource(&self, path: &str) -> ResourceClient {
        ResourceClient::new(Arc::clone(&self.transport), path)
            .namespace(self.options.namespace.clone())
            .defaults(self.options.query.clone())
            .watch_config(self.options.watch.clone())
    }

    #[must_use]
    pub const fn tree(&self) -> &ApiTree {
        &self.tree
    }

    /// Resolve a path through the aliases first, then the tree.
    ///
    /// `mapz` and `mapz.x` style paths resolve below the aliased node.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&ApiNode> {
        let path = path.trim_matches(|c: char| c == '.' || c == '/');
        let aliased = self.aliases.iter().find_map(|(alias, node)| {
            let rest = path.strip_prefix(alias.as_str())?;
            if rest.is_empty() || rest.starts_with(['.', '/']) {
                node.lookup(rest)
            } else {
                None
            }
        });
        aliased.or_else(|| self.tree.lookup(path))
    }

    /// Bound resource at `path`
    ///
    /// # Errors
    ///
    /// `Error::UnknownResource` if the path names nothing or names a group
    pub fn at(&self, path: &str) -> Result<&BoundResource> {
        self.lookup(path)
            .and_then(ApiNode::as_resource)
            .ok_or_else(|| Error::UnknownResource(path.to_string()))
    }

    #[must_use]
    pub fn alias(&self, alias: &str) -> Option<&ApiNode> {
        self.aliases.get(alias)
    }

    /// The `/version` document read at construction
    #[must_use]
    pub const fn version(&self) -> &Value {
        &self.version
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.options.namespace.as_deref()
    }

    #[must_use]
    pub const fn options(&self) -> &ApiOptions {
        &self.options
    }
}

async fn ensure_namespace(transport: &Arc<dyn Transport>, namespace: &str) -> Result<()> {
    let manifest = json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": namespace }
    });
    let created = ignore_conflict(
        ResourceClient::new(Arc::clone(transport), NAMESPACE_COLLECTION_PATH)
            .create(&manifest, &Query::default())
            .await,
    )
    .map_err(|e| Error::discovery("namespace provisioning", e))?;

    if created.is_some() {
        info!("📁 Created namespace {}", namespace);
    } else {
        debug!("Namespace {} already exists", namespace);
    }
    Ok(())
}

async fn register_custom_resources(transport: &Arc<dyn Transport>, manifests: &[Value]) -> Result<()> {
    let client = ResourceClient::new(Arc::clone(transport), CRD_COLLECTION_PATH);
    for manifest in manifests {
        let name = manifest
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>");

        let created = ignore_conflict(client.create(manifest, &Query::default()).await)
            .map_err(|e| Error::discovery(format!("custom resource registration of {name}"), e))?;

        if created.is_some() {
            info!("🧩 Registered custom resource {}", name);
        } else {
            debug!("Custom resource {} already registered", name);
        }
    }
    Ok(())
}

fn resolve_aliases(
    tree: &ApiTree,
    aliases: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, ApiNode>> {
    aliases
        .iter()
        .map(|(alias, path)| {
            let node = tree.lookup(path).ok_or_else(|| Error::UnresolvedAlias {
                alias: alias.clone(),
                path: path.clone(),
            })?;
            debug!("Alias {} -> {}", alias, path);
            Ok((alias.clone(), node.clone()))
        })
        .collect()
}
