//! Resource discovery for Kubernetes API servers.
//!
//! Reads the API root, then every advertised group/version document, and
//! flattens the result into a catalog of [`ResourceDescriptor`]s. Group
//! versions that fail or do not answer with an `APIResourceList` are
//! skipped so one broken aggregated API cannot take the whole surface down.

use super::client::{Query, ResourceClient, ResourceTarget, Verb};
use crate::error::{Error, Result};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// One discovered resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// API group, empty for the core group
    pub group: String,
    pub version: String,
    /// Group/version path the resource lives under, `api/v1` or `apis/<group>/<version>`
    pub base_path: String,
    /// Plural resource name, possibly a sub-resource such as `pods/log`
    pub name: String,
    pub kind: String,
    pub namespaced: bool,
    pub verbs: BTreeSet<Verb>,
}

impl ResourceDescriptor {
    /// `v1` for the core group, `<group>/<version>` otherwise
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    #[must_use]
    pub fn supports(&self, verb: Verb) -> bool {
        self.verbs.contains(&verb)
    }

    #[must_use]
    pub fn is_subresource(&self) -> bool {
        self.name.contains('/')
    }

    #[must_use]
    pub fn target(&self) -> ResourceTarget {
        ResourceTarget::resource(&self.base_path, self.name.clone(), self.namespaced)
    }

    /// Tree path with dots, e.g. `apis.apps.v1.deployments`
    #[must_use]
    pub fn dotted_path(&self) -> String {
        format!("{}.{}", self.base_path.replace('/', "."), self.name)
    }
}

#[derive(Debug, Deserialize)]
struct RootPaths {
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiVersions {
    #[serde(default)]
    versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiGroupList {
    #[serde(default)]
    groups: Vec<ApiGroup>,
}

#[derive(Debug, Deserialize)]
struct ApiGroup {
    #[serde(default)]
    versions: Vec<GroupVersionForDiscovery>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupVersionForDiscovery {
    group_version: String,
}

#[derive(Debug, Deserialize)]
struct ApiResourceList {
    #[serde(default)]
    resources: Vec<ApiResource>,
}

#[derive(Debug, Deserialize)]
struct ApiResource {
    name: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    namespaced: bool,
    #[serde(default)]
    verbs: Vec<String>,
}

/// Split a root path into `(group, version)` if it is a group/version endpoint
fn group_version(path: &str) -> Option<(String, String)> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["api", version] if !version.is_empty() => Some((String::new(), (*version).to_string())),
        ["apis", group, version] if !group.is_empty() && !version.is_empty() => {
            Some(((*group).to_string(), (*version).to_string()))
        }
        _ => None,
    }
}

/// Build the catalog of every resource the server advertises
///
/// # Errors
///
/// Returns `Error::Discovery` if the API root cannot be read. Individual
/// group versions never fail discovery.
pub async fn discover(client: &ResourceClient) -> Result<Vec<ResourceDescriptor>> {
    let root = client.retarget(ResourceTarget::path(""));
    let document = root
        .list(&Query::default())
        .await
        .map_err(|e| Error::discovery("api root", e))?;

    let mut paths = advertised_group_versions(&document);
    if paths.is_empty() {
        debug!("API root advertises no group versions, falling back to /api and /apis");
        paths = fallback_group_versions(client).await?;
    }

    debug!("📄 Discovering {} group versions", paths.len());

    let lists = join_all(paths.iter().map(|path| fetch_resource_list(client, path))).await;
    let descriptors: Vec<ResourceDescriptor> = lists.into_iter().flatten().flatten().collect();

    info!(
        "🔍 Discovered {} resources across {} group versions",
        descriptors.len(),
        paths.len()
    );
    Ok(descriptors)
}

fn advertised_group_versions(root: &Value) -> Vec<String> {
    let Ok(root) = RootPaths::deserialize(root) else {
        return Vec::new();
    };
    let mut paths: Vec<String> = root
        .paths
        .into_iter()
        .filter(|path| group_version(path).is_some())
        .map(|path| path.trim_matches('/').to_string())
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

async fn fallback_group_versions(client: &ResourceClient) -> Result<Vec<String>> {
    let core = client
        .retarget("api")
        .list(&Query::default())
        .await
        .map_err(|e| Error::discovery("core api versions", e))?;
    let groups = client
        .retarget("apis")
        .list(&Query::default())
        .await
        .map_err(|e| Error::discovery("api group list", e))?;

    let core = ApiVersions::deserialize(&core).map_err(|e| Error::discovery("core api versions", e.into()))?;
    let groups = ApiGroupList::deserialize(&groups).map_err(|e| Error::discovery("api group list", e.into()))?;

    let mut paths: Vec<String> = core.versions.iter().map(|v| format!("api/{v}")).collect();
    paths.extend(
        groups
            .groups
            .iter()
            .flat_map(|group| &group.versions)
            .map(|gv| format!("apis/{}", gv.group_version)),
    );
    Ok(paths)
}

/// Fetch one group version; `None` means the path was skipped
async fn fetch_resource_list(client: &ResourceClient, path: &str) -> Option<Vec<ResourceDescriptor>> {
    let document = match client.retarget(path).list(&Query::default()).await {
        Ok(document) => document,
        Err(e) => {
            warn!("Skipping {}: {}", path, e);
            return None;
        }
    };
    let descriptors = parse_resource_list(path, &document);
    if descriptors.is_none() {
        debug!("Skipping {}: not an APIResourceList", path);
    }
    descriptors
}

/// Turn an `APIResourceList` document into descriptors.
///
/// Returns `None` for anything that is not a resource list. Top-level
/// resources that can be both created and updated also get a synthesized
/// `upsert` verb.
#[must_use]
pub fn parse_resource_list(path: &str, document: &Value) -> Option<Vec<ResourceDescriptor>> {
    if document.get("kind").and_then(Value::as_str) != Some("APIResourceList") {
        return None;
    }
    let (group, version) = group_version(path)?;
    let list = ApiResourceList::deserialize(document).ok()?;
    let base_path = path.trim_matches('/').to_string();

    let descriptors = list
        .resources
        .into_iter()
        .map(|resource| {
            let mut verbs: BTreeSet<Verb> = resource
                .verbs
                .iter()
                .filter_map(|verb| Verb::parse(verb))
                .collect();
            // upsert falls back from create to update, so both must work on a named object
            if verbs.contains(&Verb::Create)
                && verbs.contains(&Verb::Update)
                && !resource.name.contains('/')
            {
                verbs.insert(Verb::Upsert);
            }
            ResourceDescriptor {
                group: group.clone(),
                version: version.clone(),
                base_path: base_path.clone(),
                name: resource.name,
                kind: resource.kind,
                namespaced: resource.namespaced,
                verbs,
            }
        })
        .collect();

    Some(descriptors)
}
