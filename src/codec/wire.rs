//! On-wire message shapes and conversions.
//!
//! The wire schema mirrors the service's RPC definition: attribute trees are
//! encoded as `Value`/`Struct`/`ListValue` messages and effects as integer
//! enum codes. Conversions in both directions are total.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::codec::types::{
    ActionResult, CheckRequest, CheckResponse, Effect, Principal, Resource, ResponseMetadata,
};
use crate::codec::value::{AttributeValue, Attributes};

pub const EFFECT_UNSPECIFIED: i32 = 0;
pub const EFFECT_ALLOW: i32 = 1;
pub const EFFECT_DENY: i32 = 2;

/// Structured value as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireValue {
    NullValue,
    BoolValue(bool),
    NumberValue(f64),
    StringValue(String),
    StructValue(WireStruct),
    ListValue(WireList),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WireStruct {
    #[serde(default)]
    pub fields: BTreeMap<String, WireValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WireList {
    #[serde(default)]
    pub values: Vec<WireValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WirePrincipal {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub attributes: WireStruct,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WireResource {
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub attributes: WireStruct,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WireCheckRequest {
    pub request_id: String,
    pub principal: WirePrincipal,
    pub resource: WireResource,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub context: WireStruct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WireActionResult {
    pub effect: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default)]
    pub matched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WireMetadata {
    pub evaluation_duration_us: u64,
    pub policies_evaluated: u32,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WireCheckResponse {
    pub request_id: String,
    #[serde(default)]
    pub results: BTreeMap<String, WireActionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<WireMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WireBatchRequest {
    pub requests: Vec<WireCheckRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WireBatchResponse {
    pub responses: Vec<WireCheckResponse>,
}

// --- values ---

impl From<&AttributeValue> for WireValue {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::Null => WireValue::NullValue,
            AttributeValue::Bool(b) => WireValue::BoolValue(*b),
            AttributeValue::Number(n) => WireValue::NumberValue(*n),
            AttributeValue::String(s) => WireValue::StringValue(s.clone()),
            AttributeValue::List(items) => WireValue::ListValue(WireList {
                values: items.iter().map(WireValue::from).collect(),
            }),
            AttributeValue::Map(fields) => WireValue::StructValue(WireStruct::from(fields)),
        }
    }
}

impl From<WireValue> for AttributeValue {
    fn from(value: WireValue) -> Self {
        match value {
            WireValue::NullValue => AttributeValue::Null,
            WireValue::BoolValue(b) => AttributeValue::Bool(b),
            WireValue::NumberValue(n) => AttributeValue::Number(n),
            WireValue::StringValue(s) => AttributeValue::String(s),
            WireValue::ListValue(list) => {
                AttributeValue::List(list.values.into_iter().map(Into::into).collect())
            }
            WireValue::StructValue(s) => AttributeValue::Map(s.into()),
        }
    }
}

impl From<&Attributes> for WireStruct {
    fn from(attrs: &Attributes) -> Self {
        WireStruct {
            fields: attrs
                .iter()
                .map(|(k, v)| (k.clone(), WireValue::from(v)))
                .collect(),
        }
    }
}

impl From<WireStruct> for Attributes {
    fn from(s: WireStruct) -> Self {
        s.fields.into_iter().map(|(k, v)| (k, v.into())).collect()
    }
}

// --- effects ---

impl From<Effect> for i32 {
    fn from(effect: Effect) -> Self {
        match effect {
            Effect::Unspecified => EFFECT_UNSPECIFIED,
            Effect::Allow => EFFECT_ALLOW,
            Effect::Deny => EFFECT_DENY,
        }
    }
}

/// Unknown codes decode as `Unspecified`.
pub fn effect_from_code(code: i32) -> Effect {
    match code {
        EFFECT_ALLOW => Effect::Allow,
        EFFECT_DENY => Effect::Deny,
        _ => Effect::Unspecified,
    }
}

// --- requests ---

impl From<&CheckRequest> for WireCheckRequest {
    fn from(req: &CheckRequest) -> Self {
        WireCheckRequest {
            request_id: req.request_id.clone(),
            principal: WirePrincipal {
                id: req.principal.id.clone(),
                kind: req.principal.kind.clone(),
                roles: req.principal.roles.clone(),
                attributes: (&req.principal.attributes).into(),
            },
            resource: WireResource {
                kind: req.resource.kind.clone(),
                id: req.resource.id.clone(),
                attributes: (&req.resource.attributes).into(),
            },
            actions: req.actions.clone(),
            context: (&req.context).into(),
        }
    }
}

impl From<WireCheckRequest> for CheckRequest {
    fn from(wire: WireCheckRequest) -> Self {
        CheckRequest {
            request_id: wire.request_id,
            principal: Principal {
                id: wire.principal.id,
                kind: wire.principal.kind,
                roles: wire.principal.roles,
                attributes: wire.principal.attributes.into(),
            },
            resource: Resource {
                kind: wire.resource.kind,
                id: wire.resource.id,
                attributes: wire.resource.attributes.into(),
            },
            actions: wire.actions,
            context: wire.context.into(),
        }
    }
}

// --- responses ---

impl From<&CheckResponse> for WireCheckResponse {
    fn from(resp: &CheckResponse) -> Self {
        WireCheckResponse {
            request_id: resp.request_id.clone(),
            results: resp
                .results
                .iter()
                .map(|(action, r)| {
                    (
                        action.clone(),
                        WireActionResult {
                            effect: r.effect.into(),
                            policy: r.policy.clone(),
                            rule: r.rule.clone(),
                            matched: r.matched,
                        },
                    )
                })
                .collect(),
            metadata: resp.metadata.as_ref().map(|m| WireMetadata {
                evaluation_duration_us: m.evaluation_duration_us,
                policies_evaluated: m.policies_evaluated,
                cache_hit: m.cache_hit,
            }),
            error: resp.error.clone(),
        }
    }
}

impl From<WireCheckResponse> for CheckResponse {
    fn from(wire: WireCheckResponse) -> Self {
        CheckResponse {
            request_id: wire.request_id,
            results: wire
                .results
                .into_iter()
                .map(|(action, r)| {
                    (
                        action,
                        ActionResult {
                            effect: effect_from_code(r.effect),
                            policy: r.policy,
                            rule: r.rule,
                            matched: r.matched,
                        },
                    )
                })
                .collect(),
            metadata: wire.metadata.map(|m| ResponseMetadata {
                evaluation_duration_us: m.evaluation_duration_us,
                policies_evaluated: m.policies_evaluated,
                cache_hit: m.cache_hit,
            }),
            error: wire.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_request() -> CheckRequest {
        let mut req = CheckRequest::new(
            Principal::new("alice", "user").with_roles(["admin", "auditor"]),
            Resource::new("document", "doc-1"),
            ["read", "write"],
        );
        req.principal.attributes.insert(
            "profile".into(),
            AttributeValue::from(json!({
                "department": "eng",
                "clearance": 4,
                "manager": null,
                "teams": [["core"], [], {"lead": true}]
            })),
        );
        req.resource.attributes.insert("empty".into(), AttributeValue::Map(Attributes::new()));
        req.context.insert("ip".into(), "10.1.1.1".into());
        req.context.insert("nothing".into(), AttributeValue::Null);
        req
    }

    #[test]
    fn test_request_round_trip_through_bytes() {
        let req = sample_request();
        let wire = WireCheckRequest::from(&req);
        let bytes = serde_json::to_vec(&wire).unwrap();
        let decoded: WireCheckRequest = serde_json::from_slice(&bytes).unwrap();
        let back = CheckRequest::from(decoded);

        assert_eq!(back.request_id, req.request_id);
        assert_eq!(back.actions, req.actions);
        assert_eq!(back.principal.attributes, req.principal.attributes);
        assert_eq!(back.resource.attributes, req.resource.attributes);
        assert_eq!(back.context, req.context);
        assert_eq!(back, req);
    }

    #[test]
    fn test_empty_attribute_maps_survive() {
        let req = CheckRequest::new(Principal::default(), Resource::default(), Vec::<String>::new());
        let back = CheckRequest::from(WireCheckRequest::from(&req));
        assert_eq!(back, req);
    }

    #[test]
    fn test_wire_value_shape() {
        let value = WireValue::from(&AttributeValue::List(vec![AttributeValue::Null, 2.0.into()]));
        assert_eq!(
            serde_json::to_value(&value).unwrap(),
            json!({"list_value": {"values": ["null_value", {"number_value": 2.0}]}})
        );
    }

    #[test]
    fn test_unknown_effect_code() {
        assert_eq!(effect_from_code(EFFECT_ALLOW), Effect::Allow);
        assert_eq!(effect_from_code(EFFECT_DENY), Effect::Deny);
        assert_eq!(effect_from_code(42), Effect::Unspecified);
    }

    #[test]
    fn test_response_conversion() {
        let wire = WireCheckResponse {
            request_id: "r-9".into(),
            results: BTreeMap::from([(
                "read".to_string(),
                WireActionResult {
                    effect: EFFECT_ALLOW,
                    policy: Some("resource.document.v1".into()),
                    rule: None,
                    matched: true,
                },
            )]),
            metadata: Some(WireMetadata {
                evaluation_duration_us: 120,
                policies_evaluated: 2,
                cache_hit: true,
            }),
            error: None,
        };

        let resp = CheckResponse::from(wire.clone());
        assert!(resp.is_allowed("read"));
        assert_eq!(resp.metadata.as_ref().unwrap().evaluation_duration_us, 120);
        assert_eq!(WireCheckResponse::from(&resp), wire);
    }
}
