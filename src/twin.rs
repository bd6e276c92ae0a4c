//! Device twin bookkeeping: which desired properties still need applying and
//! what the reported acknowledgment for each one looks like.

use serde_json::{Map, Value, json};

use crate::dispatch::HandlerStatus;
use crate::error::{AgentError, Result};

pub const VERSION_KEY: &str = "$version";

/// Whether the hub delivered a desired-property patch or the whole twin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinUpdateState {
    Partial,
    Complete,
}

/// What a complete twin asks of the device for one desired property
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwinAction {
    /// Desired value differs from the reported one: run the handler.
    Apply(String),
    /// Value already in place but acknowledged for an older version.
    Acknowledge(String),
}

impl TwinAction {
    pub fn property(&self) -> &str {
        match self {
            TwinAction::Apply(name) | TwinAction::Acknowledge(name) => name,
        }
    }
}

/// Parse a twin payload keeping member order.
pub fn parse(payload: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AgentError::malformed("twin", "payload is not an object")),
        Err(e) => Err(AgentError::malformed("twin", e)),
    }
}

/// First property of a desired patch, skipping the version marker.
pub fn first_property(patch: &Map<String, Value>) -> Option<(&str, &Value)> {
    patch
        .iter()
        .find(|(name, _)| name.as_str() != VERSION_KEY)
        .map(|(name, value)| (name.as_str(), value))
}

/// The value a desired property carries: `{"value": v}` yields `v`,
/// a bare value yields itself.
pub fn property_value(property: &Value) -> &Value {
    match property.get("value") {
        Some(value) if property.is_object() => value,
        _ => property,
    }
}

/// Build the reported patch acknowledging `name` from its enclosing desired
/// document:
///
/// `{"<name>":{"value":v,"statusCode":c,"status":"s","desiredVersion":n}}`
pub fn reported_echo(name: &str, enclosing: &Map<String, Value>, status: &HandlerStatus) -> Value {
    let value = enclosing
        .get(name)
        .map(property_value)
        .cloned()
        .unwrap_or(Value::Null);
    let version = enclosing.get(VERSION_KEY).cloned().unwrap_or(Value::Null);

    let mut body = Map::new();
    body.insert("value".into(), value);
    body.insert("statusCode".into(), json!(status.code));
    body.insert("status".into(), json!(status.text));
    body.insert("desiredVersion".into(), version);

    let mut patch = Map::new();
    patch.insert(name.to_string(), Value::Object(body));
    Value::Object(patch)
}

/// Walk a complete twin and decide, per desired property that also appears in
/// `reported`, whether it must be applied or only acknowledged.
///
/// Properties whose reported `desiredVersion` equals the desired `$version`
/// are already settled and produce nothing.
pub fn reconcile(twin: &Map<String, Value>) -> Result<Vec<TwinAction>> {
    let desired = section(twin, "desired")?;
    let reported = match twin.get("reported") {
        None => return Ok(Vec::new()),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(AgentError::malformed("twin", "'reported' is not an object")),
    };
    let version = desired.get(VERSION_KEY).unwrap_or(&Value::Null);

    let mut actions = Vec::new();
    for (name, wanted) in desired {
        if name == VERSION_KEY {
            continue;
        }
        let Some(current) = reported.get(name) else {
            continue;
        };
        let acknowledged = current.get("desiredVersion").unwrap_or(&Value::Null);
        if acknowledged == version {
            continue;
        }
        if current.get("value") != Some(property_value(wanted)) {
            actions.push(TwinAction::Apply(name.clone()));
        } else {
            actions.push(TwinAction::Acknowledge(name.clone()));
        }
    }
    Ok(actions)
}

pub fn section<'a>(twin: &'a Map<String, Value>, name: &'static str) -> Result<&'a Map<String, Value>> {
    match twin.get(name) {
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(AgentError::malformed("twin", format!("'{}' is not an object", name))),
        None => Err(AgentError::malformed("twin", format!("missing '{}' section", name))),
    }
}
