pub mod api;
pub mod client;
pub mod discovery;
pub mod transport;
pub mod tree;
pub mod watch;

/// Default user agent for `kapi` - automatically uses the package version
///
/// Every request issued through [`transport::HttpTransport`] carries it, which
/// makes kapi traffic easy to pick out of API server audit logs.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
