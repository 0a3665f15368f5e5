//! Dynamic Kubernetes REST client.
//!
//! [`KubernetesApi`] reads the API server's discovery documents and turns
//! them into an [`ApiTree`] of bound resource handles, keeps caller-defined
//! aliases, and exposes a raw [`ResourceClient`] for literal paths. Watches
//! run as resumable subscriptions that reconnect on their own and carry the
//! last seen `resourceVersion` forward.

pub mod config;
pub mod error;
pub mod k8s;

pub use config::{ApiOptions, ConnectionDescriptor, ConnectionProvider};
pub use error::{Error, Result, ignore_conflict};
pub use k8s::api::KubernetesApi;
pub use k8s::client::{Query, ResourceClient, ResourceTarget, Verb};
pub use k8s::discovery::{ResourceDescriptor, discover};
pub use k8s::transport::{ApiRequest, ByteStream, HttpTransport, Method, Transport};
pub use k8s::tree::{ApiNode, ApiTree, ApiTreeBuilder, BoundResource};
pub use k8s::watch::{
    Watch, WatchConfig, WatchEvent, WatchNotification, WatchReceiver, WatchState, WatchStats,
};
