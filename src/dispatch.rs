use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use serde_json::Value;

use crate::error::{AgentError, Result};

/// Outcome a handler hands back to the hub: a status code and a short text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerStatus {
    pub code: i32,
    pub text: String,
}

impl HandlerStatus {
    pub fn new(code: i32, text: impl Into<String>) -> Self {
        Self { code, text: text.into() }
    }

    pub fn completed() -> Self {
        Self::new(200, "completed")
    }
}

/// Handler invoked with the JSON payload of a method call, C2D message or
/// desired property.
pub type Handler = Arc<dyn Fn(&Value) -> HandlerStatus + Send + Sync>;

/// Method or property name compared without regard to case.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerName(String);

impl HandlerName {
    pub fn new(name: &str) -> Self {
        Self(name.to_lowercase())
    }
}

/// Name → handler table. Entries are never removed; registering a name
/// again replaces the previous handler.
#[derive(Default)]
pub struct DispatchTable {
    handlers: RwLock<HashMap<HandlerName, Handler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when an earlier handler was replaced.
    pub fn register<F>(&self, name: &str, handler: F) -> bool
    where
        F: Fn(&Value) -> HandlerStatus + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(HandlerName::new(name), Arc::new(handler)).is_some()
    }

    pub fn lookup(&self, name: &str) -> Result<Handler> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers
            .get(&HandlerName::new(name))
            .cloned()
            .ok_or_else(|| AgentError::UnregisteredHandler(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.contains_key(&HandlerName::new(name))
    }

    pub fn names(&self) -> Vec<HandlerName> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<HandlerName> = handlers.keys().cloned().collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));
        names
    }

    /// Look up `name` and run its handler outside the table lock.
    pub fn dispatch(&self, name: &str, payload: &Value) -> Result<HandlerStatus> {
        let handler = self.lookup(name)?;
        Ok(handler(payload))
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable").field("handlers", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_lookup_ignores_case() {
        let table = DispatchTable::new();
        table.register("Reboot", |_| HandlerStatus::new(200, "rebooting"));

        assert!(table.contains("reboot"));
        assert!(table.contains("REBOOT"));
        let status = table.dispatch("rEbOoT", &Value::Null).unwrap();
        assert_eq!(status, HandlerStatus::new(200, "rebooting"));
    }

    #[test]
    fn test_register_overwrites() {
        let table = DispatchTable::new();
        assert!(!table.register("ping", |_| HandlerStatus::new(200, "one")));
        assert!(table.register("PING", |_| HandlerStatus::new(200, "two")));

        assert_eq!(table.names().len(), 1);
        assert_eq!(table.dispatch("ping", &Value::Null).unwrap().text, "two");
    }

    #[test]
    fn test_unknown_name_is_explicit() {
        let table = DispatchTable::new();
        match table.dispatch("missing", &json!({})) {
            Err(AgentError::UnregisteredHandler(name)) => assert_eq!(name, "missing"),
            other => panic!("unexpected {:?}", other.map(|s| s.code)),
        }
    }

    #[test]
    fn test_handler_sees_payload() {
        let table = DispatchTable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        table.register("setLed", move |payload| {
            seen.fetch_add(1, Ordering::SeqCst);
            let on = payload["on"].as_bool().unwrap_or(false);
            HandlerStatus::new(200, if on { "on" } else { "off" })
        });

        assert_eq!(table.dispatch("setled", &json!({"on": true})).unwrap().text, "on");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
