//! Decision request and response types exposed to callers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::codec::value::Attributes;

/// The subject asking for access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Principal {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Principal {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

/// The object access is requested on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Resource {
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Resource {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            attributes: Attributes::new(),
        }
    }
}

/// A single decision request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Caller-unique identifier echoed back by the server.
    pub request_id: String,
    pub principal: Principal,
    pub resource: Resource,
    pub actions: Vec<String>,
    #[serde(default)]
    pub context: Attributes,
}

impl CheckRequest {
    /// Build a request with a freshly generated request ID.
    pub fn new<I, S>(principal: Principal, resource: Resource, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            principal,
            resource,
            actions: actions.into_iter().map(Into::into).collect(),
            context: Attributes::new(),
        }
    }
}

/// Outcome for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Effect {
    Allow,
    Deny,
    #[default]
    Unspecified,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "ALLOW",
            Effect::Deny => "DENY",
            Effect::Unspecified => "UNSPECIFIED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ActionResult {
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default)]
    pub matched: bool,
}

/// Server-side evaluation details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResponseMetadata {
    pub evaluation_duration_us: u64,
    pub policies_evaluated: u32,
    pub cache_hit: bool,
}

/// Decision response for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CheckResponse {
    pub request_id: String,
    #[serde(default)]
    pub results: BTreeMap<String, ActionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResponse {
    /// True when the action is explicitly allowed.
    pub fn is_allowed(&self, action: &str) -> bool {
        self.results
            .get(action)
            .map(|r| r.effect == Effect::Allow)
            .unwrap_or(false)
    }

    /// Effect reported for every action, if all actions agree.
    pub fn overall_effect(&self) -> Effect {
        let mut effects = self.results.values().map(|r| r.effect);
        match effects.next() {
            Some(first) if effects.all(|e| e == first) => first,
            _ => Effect::Unspecified,
        }
    }
}
