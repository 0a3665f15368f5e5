use crate::k8s::client::Verb;
use serde_json::Value;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// HTTP status the API server answers with when an object already exists
pub const CONFLICT: u16 = 409;

/// HTTP status for a watch cursor that has been compacted away
pub const GONE: u16 = 410;

#[derive(Debug, Error)]
pub enum Error {
    /// The API server answered with a non-2xx status
    #[error("{method} {url} returned {status}: {}", status_message(.body))]
    Api {
        method: String,
        url: String,
        status: u16,
        body: Value,
    },

    /// Network or TLS failure before a status was received
    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    /// The connection descriptor could not be resolved or is incomplete
    #[error("connection: {0}")]
    Connection(String),

    /// A watch frame could not be decoded
    #[error("malformed watch stream: {0}")]
    MalformedStream(String),

    /// Construction-time failure while registering resources or reading the API root
    #[error("discovery failed during {stage}: {source}")]
    Discovery {
        stage: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{resource} does not support `{verb}`")]
    UnsupportedVerb { resource: String, verb: Verb },

    #[error("{resource} requires an instance name")]
    MissingName { resource: String },

    #[error("alias `{alias}` points at `{path}`, which is not in the discovered api")]
    UnresolvedAlias { alias: String, path: String },

    #[error("no resource at `{0}`")]
    UnknownResource(String),
}

impl Error {
    /// Wrap an error raised while building the api surface
    pub fn discovery(stage: impl Into<String>, source: Self) -> Self {
        Self::Discovery {
            stage: stage.into(),
            source: Box::new(source),
        }
    }

    /// HTTP status carried by the error, if the server answered at all
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Decoded response body of a failed request
    #[must_use]
    pub const fn body(&self) -> Option<&Value> {
        match self {
            Self::Api { body, .. } => Some(body),
            _ => None,
        }
    }

    /// True for 409 responses, either by HTTP status or by the `code` of a
    /// returned `Status` object.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.has_code(CONFLICT)
    }

    /// True for 410 responses, the server no longer has history at the
    /// requested `resourceVersion`.
    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.has_code(GONE)
    }

    fn has_code(&self, code: u16) -> bool {
        match self {
            Self::Api { status, body, .. } => {
                *status == code || body.get("code").and_then(Value::as_u64) == Some(u64::from(code))
            }
            _ => false,
        }
    }
}

/// Turn a conflict into `Ok(None)` and pass every other outcome through.
///
/// # Errors
///
/// Returns the original error unless it is a conflict
pub fn ignore_conflict<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_conflict() => Ok(None),
        Err(e) => Err(e),
    }
}

fn status_message(body: &Value) -> String {
    match body {
        Value::Null => "<empty body>".to_string(),
        Value::String(text) => text.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| other.to_string(), str::to_string),
    }
}
