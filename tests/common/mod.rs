//! In-memory API server used by the integration tests.
//!
//! Serves discovery documents, stores objects per collection with a global
//! `resourceVersion` counter, and streams watch events with list-then-watch,
//! resume and compaction semantics close to a real API server.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use kapi::{ApiRequest, ByteStream, Error, Method, Result, Transport};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

pub const MERGE_PATCH: &str = "application/merge-patch+json";

#[derive(Debug, Clone)]
struct Change {
    collection: String,
    namespace: String,
    name: String,
    kind: &'static str,
    object: Value,
    rv: u64,
}

impl Change {
    fn frame(&self) -> String {
        format!("{}\n", json!({"type": self.kind, "object": self.object}))
    }
}

#[derive(Debug)]
struct ResourceSpec {
    name: String,
    kind: String,
    namespaced: bool,
    verbs: Vec<&'static str>,
}

#[derive(Debug, Default)]
struct State {
    next_rv: u64,
    compacted: u64,
    /// group/version path -> resources served there
    group_versions: BTreeMap<String, Vec<ResourceSpec>>,
    /// collection -> "namespace/name" -> object
    objects: BTreeMap<String, BTreeMap<String, Value>>,
    log: Vec<Change>,
    failures: BTreeMap<String, u16>,
    overrides: BTreeMap<String, Value>,
    advertise_paths: bool,
    watches_paused: bool,
    requests: Vec<ApiRequest>,
}

#[derive(Debug)]
struct Route {
    collection: String,
    namespace: Option<String>,
    name: Option<String>,
    subresource: Option<String>,
    watch: bool,
}

#[derive(Debug)]
pub struct FakeCluster {
    state: Mutex<State>,
    changes: broadcast::Sender<Change>,
    disconnect: Mutex<CancellationToken>,
}

const ALL_VERBS: [&str; 8] = [
    "create",
    "delete",
    "deletecollection",
    "get",
    "list",
    "patch",
    "update",
    "watch",
];

fn status(method: Method, path: &str, code: u16, reason: &str, message: String) -> Error {
    Error::Api {
        method: method.to_string(),
        url: path.to_string(),
        status: code,
        body: json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": code
        }),
    }
}

/// RFC 7386 merge patch
pub fn merge_json(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_json(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn matches_selector(object: &Value, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => {
                object.pointer(&format!("/metadata/labels/{key}")).and_then(Value::as_str)
                    == Some(value)
            }
            None => false,
        })
}

fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl FakeCluster {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        let cluster = Self {
            state: Mutex::new(State {
                next_rv: 1,
                advertise_paths: true,
                ..State::default()
            }),
            changes,
            disconnect: Mutex::new(CancellationToken::new()),
        };

        cluster.serve("api/v1", "configmaps", "ConfigMap", true, &ALL_VERBS);
        cluster.serve("api/v1", "namespaces", "Namespace", false, &["create", "delete", "get", "list", "patch", "update", "watch"]);
        cluster.serve("api/v1", "pods", "Pod", true, &["get", "list", "watch"]);
        cluster.serve("api/v1", "pods/log", "Pod", true, &["get"]);
        cluster.serve("api/v1", "nodes", "Node", false, &["get", "list", "proxy"]);
        cluster.serve("apis/apps/v1", "deployments", "Deployment", true, &ALL_VERBS);
        cluster.serve(
            "apis/apiextensions.k8s.io/v1",
            "customresourcedefinitions",
            "CustomResourceDefinition",
            false,
            &ALL_VERBS,
        );
        cluster
    }

    /// Advertise a resource under a group/version path
    pub fn serve(&self, group_version: &str, name: &str, kind: &str, namespaced: bool, verbs: &[&'static str]) {
        self.state
            .lock()
            .unwrap()
            .group_versions
            .entry(group_version.to_string())
            .or_default()
            .push(ResourceSpec {
                name: name.to_string(),
                kind: kind.to_string(),
                namespaced,
                verbs: verbs.to_vec(),
            });
    }

    /// Answer every request for `path` with `code`
    pub fn fail_path(&self, path: &str, code: u16) {
        self.state.lock().unwrap().failures.insert(path.to_string(), code);
    }

    /// Answer every request for `path` with `body`
    pub fn override_body(&self, path: &str, body: Value) {
        self.state.lock().unwrap().overrides.insert(path.to_string(), body);
    }

    /// Serve an API root without `paths`, like servers that only answer `/api` and `/apis`
    pub fn hide_root_paths(&self) {
        self.state.lock().unwrap().advertise_paths = false;
    }

    /// Refuse new watch connections until `resume_watches`
    pub fn pause_watches(&self) {
        self.state.lock().unwrap().watches_paused = true;
    }

    pub fn resume_watches(&self) {
        self.state.lock().unwrap().watches_paused = false;
    }

    /// End every open watch stream
    pub fn disconnect_watchers(&self) {
        let mut token = self.disconnect.lock().unwrap();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Drop all history up to now; older cursors get `410 Expired`
    pub fn compact(&self) {
        let mut state = self.state.lock().unwrap();
        state.compacted = state.next_rv - 1;
        let compacted = state.compacted;
        state.log.retain(|change| change.rv > compacted);
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        self.requests().into_iter().filter(|r| r.path == path).collect()
    }

    /// Stored object, bypassing the transport
    pub fn object(&self, collection: &str, namespace: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(collection)
            .and_then(|objects| objects.get(&object_key(namespace, name)))
            .cloned()
    }

    pub fn resource_version(&self) -> u64 {
        self.state.lock().unwrap().next_rv - 1
    }

    fn root(state: &State) -> Value {
        let mut paths: Vec<String> = vec![
            "/api".to_string(),
            "/apis".to_string(),
            "/healthz".to_string(),
            "/openapi/v2".to_string(),
            "/version".to_string(),
        ];
        paths.extend(state.group_versions.keys().map(|gv| format!("/{gv}")));
        if state.advertise_paths {
            json!({ "paths": paths })
        } else {
            json!({})
        }
    }

    fn core_versions(state: &State) -> Value {
        let versions: Vec<&str> = state
            .group_versions
            .keys()
            .filter_map(|gv| gv.strip_prefix("api/"))
            .collect();
        json!({ "kind": "APIVersions", "versions": versions })
    }

    fn group_list(state: &State) -> Value {
        let mut groups: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
        for gv in state.group_versions.keys() {
            if let Some(group_version) = gv.strip_prefix("apis/") {
                if let Some((group, version)) = group_version.split_once('/') {
                    groups.entry(group).or_default().push(json!({
                        "groupVersion": group_version,
                        "version": version
                    }));
                }
            }
        }
        let groups: Vec<Value> = groups
            .into_iter()
            .map(|(name, versions)| json!({ "name": name, "versions": versions }))
            .collect();
        json!({ "kind": "APIGroupList", "apiVersion": "v1", "groups": groups })
    }

    fn resource_list(group_version: &str, resources: &[ResourceSpec]) -> Value {
        let resources: Vec<Value> = resources
            .iter()
            .map(|r| {
                json!({
                    "name": r.name,
                    "singularName": "",
                    "namespaced": r.namespaced,
                    "kind": r.kind,
                    "verbs": r.verbs,
                })
            })
            .collect();
        json!({
            "kind": "APIResourceList",
            "apiVersion": "v1",
            "groupVersion": group_version.trim_start_matches("apis/").trim_start_matches("api/"),
            "resources": resources
        })
    }

    fn route(state: &State, path: &str, query: &kapi::Query) -> Option<Route> {
        let base = state
            .group_versions
            .keys()
            .filter(|gv| path.starts_with(&format!("{gv}/")))
            .max_by_key(|gv| gv.len())?;
        let mut segments: Vec<&str> = path[base.len() + 1..].split('/').collect();

        let watch_segment = segments.first() == Some(&"watch");
        if watch_segment {
            segments.remove(0);
        }
        let mut namespace = None;
        if segments.len() >= 3 && segments[0] == "namespaces" {
            namespace = Some(segments[1].to_string());
            segments.drain(..2);
        }
        // the watch flag only applies to collections; an object GET ignores it
        let watch = watch_segment || (query.get("watch") == Some("true") && segments.len() == 1);
        let resource = (*segments.first()?).to_string();
        Some(Route {
            collection: format!("{base}/{resource}"),
            namespace,
            name: segments.get(1).map(|s| (*s).to_string()),
            subresource: segments.get(2).map(|s| (*s).to_string()),
            watch,
        })
    }

    fn record(&self, state: &mut State, collection: &str, namespace: &str, name: &str, kind: &'static str, object: Value) -> u64 {
        let rv = object
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .and_then(|rv| rv.parse().ok())
            .unwrap_or(state.next_rv);
        let change = Change {
            collection: collection.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            kind,
            object,
            rv,
        };
        state.log.push(change.clone());
        let _ = self.changes.send(change);
        rv
    }

    fn stamp(state: &mut State, object: &mut Value, namespace: &str, name: &str) {
        let rv = state.next_rv;
        state.next_rv += 1;
        merge_json(
            object,
            &json!({"metadata": {"name": name, "resourceVersion": rv.to_string()}}),
        );
        if !namespace.is_empty() {
            merge_json(object, &json!({"metadata": {"namespace": namespace}}));
        }
    }

    fn handle(&self, request: &ApiRequest) -> Result<Value> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        let path = request.path.as_str();

        if let Some(code) = state.failures.get(path) {
            return Err(status(request.method, path, *code, "InternalError", format!("injected failure for {path}")));
        }
        if let Some(body) = state.overrides.get(path) {
            return Ok(body.clone());
        }

        match path {
            "" => return Ok(Self::root(&state)),
            "version" => {
                return Ok(json!({"major": "1", "minor": "30", "gitVersion": "v1.30.0-fake"}));
            }
            "api" => return Ok(Self::core_versions(&state)),
            "apis" => return Ok(Self::group_list(&state)),
            _ => {}
        }
        if let Some(resources) = state.group_versions.get(path) {
            return Ok(Self::resource_list(path, resources));
        }

        let not_found = || status(request.method, path, 404, "NotFound", format!("{path} not found"));
        let route = Self::route(&state, path, &request.query).ok_or_else(not_found)?;
        let namespace = route.namespace.clone().unwrap_or_default();
        let selector = request.query.get("labelSelector");

        match (request.method, &route.name, &route.subresource) {
            (Method::Get, Some(name), Some(sub)) if sub == "log" => {
                let key = object_key(&namespace, name);
                let exists = state.objects.get(&route.collection).is_some_and(|o| o.contains_key(&key));
                if exists { Ok(Value::String(format!("logs of {name}"))) } else { Err(not_found()) }
            }
            (_, _, Some(_)) => Err(not_found()),
            (Method::Get, Some(name), None) => state
                .objects
                .get(&route.collection)
                .and_then(|objects| objects.get(&object_key(&namespace, name)))
                .cloned()
                .ok_or_else(not_found),
            (Method::Get, None, None) => {
                let items: Vec<Value> = state
                    .objects
                    .get(&route.collection)
                    .map(|objects| {
                        objects
                            .iter()
                            .filter(|(key, _)| route.namespace.is_none() || key.starts_with(&format!("{namespace}/")))
                            .map(|(_, object)| object)
                            .filter(|object| matches_selector(object, selector))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(json!({
                    "kind": "List",
                    "apiVersion": "v1",
                    "metadata": {"resourceVersion": (state.next_rv - 1).to_string()},
                    "items": items
                }))
            }
            (Method::Post, None, None) => {
                let mut object = request.body.clone().unwrap_or_else(|| json!({}));
                let name = object
                    .pointer("/metadata/name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| status(request.method, path, 422, "Invalid", "metadata.name is required".to_string()))?;
                let key = object_key(&namespace, &name);
                if state.objects.get(&route.collection).is_some_and(|o| o.contains_key(&key)) {
                    return Err(status(request.method, path, 409, "AlreadyExists", format!("\"{name}\" already exists")));
                }
                Self::stamp(&mut state, &mut object, &namespace, &name);
                if route.collection == "apis/apiextensions.k8s.io/v1/customresourcedefinitions" {
                    Self::register_definition(&mut state, &object);
                }
                state.objects.entry(route.collection.clone()).or_default().insert(key, object.clone());
                self.record(&mut state, &route.collection, &namespace, &name, "ADDED", object.clone());
                Ok(object)
            }
            (Method::Put | Method::Patch, Some(name), None) => {
                if request.method == Method::Patch && request.header_value("content-type") != Some(MERGE_PATCH) {
                    return Err(status(request.method, path, 415, "UnsupportedMediaType", "expected a merge patch".to_string()));
                }
                let key = object_key(&namespace, name);
                let mut object = state
                    .objects
                    .get(&route.collection)
                    .and_then(|objects| objects.get(&key))
                    .cloned()
                    .ok_or_else(not_found)?;
                let body = request.body.clone().unwrap_or_else(|| json!({}));
                if request.method == Method::Patch {
                    merge_json(&mut object, &body);
                } else {
                    object = body;
                }
                Self::stamp(&mut state, &mut object, &namespace, name);
                state.objects.entry(route.collection.clone()).or_default().insert(key, object.clone());
                self.record(&mut state, &route.collection, &namespace, name, "MODIFIED", object.clone());
                Ok(object)
            }
            (Method::Delete, Some(name), None) => {
                let key = object_key(&namespace, name);
                let mut object = state
                    .objects
                    .get_mut(&route.collection)
                    .and_then(|objects| objects.remove(&key))
                    .ok_or_else(not_found)?;
                Self::stamp(&mut state, &mut object, &namespace, name);
                self.record(&mut state, &route.collection, &namespace, name, "DELETED", object.clone());
                Ok(object)
            }
            (Method::Delete, None, None) => {
                let removed: Vec<(String, Value)> = state
                    .objects
                    .get(&route.collection)
                    .map(|objects| {
                        objects
                            .iter()
                            .filter(|(key, _)| route.namespace.is_none() || key.starts_with(&format!("{namespace}/")))
                            .filter(|(_, object)| matches_selector(object, selector))
                            .map(|(key, object)| (key.clone(), object.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                let mut items = Vec::new();
                for (key, mut object) in removed {
                    if let Some(objects) = state.objects.get_mut(&route.collection) {
                        objects.remove(&key);
                    }
                    let (ns, name) = key.split_once('/').unwrap_or(("", key.as_str()));
                    let (ns, name) = (ns.to_string(), name.to_string());
                    Self::stamp(&mut state, &mut object, &ns, &name);
                    self.record(&mut state, &route.collection, &ns, &name, "DELETED", object.clone());
                    items.push(object);
                }
                Ok(json!({"kind": "List", "apiVersion": "v1", "metadata": {}, "items": items}))
            }
            _ => Err(status(request.method, path, 405, "MethodNotAllowed", format!("{} {path}", request.method))),
        }
    }

    /// Serve the group described by a CustomResourceDefinition manifest
    fn register_definition(state: &mut State, definition: &Value) {
        let group = definition.pointer("/spec/group").and_then(Value::as_str).unwrap_or_default();
        let plural = definition.pointer("/spec/names/plural").and_then(Value::as_str).unwrap_or_default();
        let kind = definition.pointer("/spec/names/kind").and_then(Value::as_str).unwrap_or_default();
        let namespaced = definition.pointer("/spec/scope").and_then(Value::as_str) == Some("Namespaced");
        let versions = definition
            .pointer("/spec/versions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for version in versions.iter().filter_map(|v| v.get("name").and_then(Value::as_str)) {
            state
                .group_versions
                .entry(format!("apis/{group}/{version}"))
                .or_default()
                .push(ResourceSpec {
                    name: plural.to_string(),
                    kind: kind.to_string(),
                    namespaced,
                    verbs: ALL_VERBS.to_vec(),
                });
        }
    }

    fn open_watch(&self, request: &ApiRequest) -> Result<ByteStream> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        let path = request.path.as_str();

        if let Some(code) = state.failures.get(path) {
            return Err(status(request.method, path, *code, "InternalError", format!("injected failure for {path}")));
        }
        if state.watches_paused {
            return Err(status(request.method, path, 503, "ServiceUnavailable", "watches paused".to_string()));
        }
        let route = Self::route(&state, path, &request.query)
            .filter(|route| route.watch)
            .ok_or_else(|| status(request.method, path, 404, "NotFound", format!("{path} is not watchable")))?;

        let cursor: u64 = request
            .query
            .get("resourceVersion")
            .and_then(|rv| rv.parse().ok())
            .unwrap_or(0);
        let timeout = request
            .query
            .get("timeoutSeconds")
            .and_then(|t| t.parse().ok())
            .unwrap_or(86_400);

        let by_field = request
            .query
            .get("fieldSelector")
            .and_then(|selector| selector.strip_prefix("metadata.name="))
            .map(str::to_string);
        let wanted = {
            let collection = route.collection.clone();
            let namespace = route.namespace.clone();
            let name = route.name.clone().or(by_field);
            move |change: &Change| {
                change.collection == collection
                    && namespace.as_ref().is_none_or(|ns| *ns == change.namespace)
                    && name.as_ref().is_none_or(|n| *n == change.name)
            }
        };

        let (tx, rx) = mpsc::unbounded_channel::<String>();

        let last_sent = if cursor == 0 {
            // list-then-watch: current state as synthetic ADDED events
            let objects = state.objects.get(&route.collection).cloned().unwrap_or_default();
            for (key, object) in objects {
                let (ns, name) = key.split_once('/').unwrap_or(("", key.as_str()));
                let change = Change {
                    collection: route.collection.clone(),
                    namespace: ns.to_string(),
                    name: name.to_string(),
                    kind: "ADDED",
                    object,
                    rv: 0,
                };
                if wanted(&change) {
                    let _ = tx.send(change.frame());
                }
            }
            state.next_rv - 1
        } else if cursor < state.compacted {
            let expired = json!({
                "type": "ERROR",
                "object": {
                    "kind": "Status",
                    "apiVersion": "v1",
                    "status": "Failure",
                    "message": format!("too old resource version: {cursor} ({})", state.compacted),
                    "reason": "Expired",
                    "code": 410
                }
            });
            let _ = tx.send(format!("{expired}\n"));
            drop(tx);
            return Ok(UnboundedReceiverStream::new(rx).map(|line| Ok::<_, std::io::Error>(Bytes::from(line))).boxed());
        } else {
            for change in state.log.iter().filter(|c| c.rv > cursor) {
                if wanted(change) {
                    let _ = tx.send(change.frame());
                }
            }
            state.next_rv - 1
        };

        let mut live = self.changes.subscribe();
        let disconnect = self.disconnect.lock().unwrap().clone();
        drop(state);

        tokio::spawn(async move {
            let deadline = tokio::time::sleep(Duration::from_secs(timeout));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    () = disconnect.cancelled() => break,
                    () = &mut deadline => break,
                    change = live.recv() => match change {
                        Ok(change) if change.rv > last_sent && wanted(&change) => {
                            if tx.send(change.frame()).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    },
                }
            }
        });

        Ok(UnboundedReceiverStream::new(rx).map(|line| Ok::<_, std::io::Error>(Bytes::from(line))).boxed())
    }
}

#[async_trait]
impl Transport for FakeCluster {
    async fn send(&self, request: ApiRequest) -> Result<Value> {
        self.handle(&request)
    }

    async fn stream(&self, request: ApiRequest) -> Result<ByteStream> {
        self.open_watch(&request)
    }
}

pub fn configmap(name: &str, labels: Value, data: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "labels": labels},
        "data": data
    })
}

pub fn foobar_definition() -> Value {
    json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": {"name": "foobars.foobar.com"},
        "spec": {
            "group": "foobar.com",
            "scope": "Namespaced",
            "names": {"plural": "foobars", "singular": "foobar", "kind": "Foobar"},
            "versions": [{"name": "v1", "served": true, "storage": true}]
        }
    })
}

/// Poll `check` until it holds or a few seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
