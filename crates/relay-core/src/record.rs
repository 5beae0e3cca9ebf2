//! Persisted record types shared by every storage backend.
//!
//! Constructors own id, timestamp, and credential key generation so all
//! backends persist identically shaped records.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A key/value configuration row. One row per key; writes are upserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(rename = "config_key")]
    pub key: String,
    #[serde(rename = "config_value")]
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Configuration {
    pub fn new(key: &str, value: &str) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            value: value.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported HTTP method {0:?}")]
pub struct ParseMethodError(pub String);

/// HTTP methods a registered endpoint may bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ParseMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(ParseMethodError(s.to_string())),
        }
    }
}

/// A dynamically registered proxy endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDefinition {
    pub id: Uuid,
    pub path: String,
    pub method: HttpMethod,
    pub model: String,
    pub prompt_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EndpointDefinition {
    pub fn new(input: NewEndpoint) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: input.path,
            method: input.method,
            model: input.model,
            prompt_template: input.prompt_template,
            strategy: input.strategy,
            created_at: Utc::now(),
        }
    }
}

/// Input for registering a new endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEndpoint {
    pub path: String,
    pub method: HttpMethod,
    pub model: String,
    pub prompt_template: String,
    #[serde(default)]
    pub strategy: Option<String>,
}

/// Partial update for an endpoint. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<HttpMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

impl EndpointPatch {
    /// True when no field is set, i.e. applying it changes nothing.
    pub fn is_empty(&self) -> bool {
        self.path.is_none()
            && self.method.is_none()
            && self.model.is_none()
            && self.prompt_template.is_none()
            && self.strategy.is_none()
    }

    pub fn apply(&self, endpoint: &mut EndpointDefinition) {
        if let Some(path) = &self.path {
            endpoint.path = path.clone();
        }
        if let Some(method) = self.method {
            endpoint.method = method;
        }
        if let Some(model) = &self.model {
            endpoint.model = model.clone();
        }
        if let Some(prompt_template) = &self.prompt_template {
            endpoint.prompt_template = prompt_template.clone();
        }
        if let Some(strategy) = &self.strategy {
            endpoint.strategy = Some(strategy.clone());
        }
    }
}

/// One request/response log entry. Append-only, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: Uuid,
    pub prompt: String,
    pub response: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(input: NewLogRecord) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: input.prompt,
            response: input.response,
            model: input.model,
            created_at: Utc::now(),
        }
    }
}

/// Input for recording one inference call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLogRecord {
    pub prompt: String,
    pub response: String,
    pub model: String,
}

/// An access credential: an opaque token plus its capability settings.
///
/// The token is the lookup key the authorization middleware presents; it is
/// generated non-sequentially so tokens cannot be enumerated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_label: Option<String>,
    #[serde(default)]
    pub capabilities: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    /// Build a credential, generating the token when the input carries none.
    pub fn new(input: NewCredential) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: input.key.unwrap_or_else(generate_key),
            owner_label: input.owner_label,
            capabilities: input.capabilities,
            created_at: Utc::now(),
        }
    }
}

/// Input for issuing a credential. All fields optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewCredential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_label: Option<String>,
    #[serde(default)]
    pub capabilities: HashMap<String, serde_json::Value>,
}

/// Partial update for a credential. The token itself is immutable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<HashMap<String, serde_json::Value>>,
}

impl CredentialPatch {
    /// True when no field is set, i.e. applying it changes nothing.
    pub fn is_empty(&self) -> bool {
        self.owner_label.is_none() && self.capabilities.is_none()
    }

    pub fn apply(&self, credential: &mut Credential) {
        if let Some(owner_label) = &self.owner_label {
            credential.owner_label = Some(owner_label.clone());
        }
        if let Some(capabilities) = &self.capabilities {
            credential.capabilities = capabilities.clone();
        }
    }
}

/// Generate an opaque credential token: `rk_` + 32 random alphanumerics.
pub fn generate_key() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    format!("rk_{token}")
}
