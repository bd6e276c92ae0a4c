use std::sync::Arc;
use chrono::Local;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::device::DeviceState;
use crate::dispatch::{DispatchTable, HandlerStatus};
use crate::error::{AgentError, Result};
use crate::logger::Logger;
use crate::twin::{self, TwinAction, TwinUpdateState};

/// Status code answered for a direct method nobody registered.
pub const STATUS_NOT_IMPLEMENTED: i32 = 501;
/// Status code answered for a direct method whose payload is not JSON.
pub const STATUS_BAD_REQUEST: i32 = 400;

/// Telemetry message handed to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub properties: Vec<(String, String)>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            properties: Vec::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.push((key.to_string(), value.into()));
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Answer to the transport on what to do with a cloud-to-device message.
/// MQTT offers no reject or abandon, so acceptance is the only answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Accepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Authenticated,
    Unauthenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionReason {
    ConnectionOk,
    NoNetwork,
    BadCredential,
    CommunicationError,
    RetryExpired,
}

/// Delivery result of a telemetry message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationResult {
    Ok,
    MessageTimeout,
    Error,
}

/// Reply to a direct method invocation
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResponse {
    pub status: i32,
    pub body: String,
}

impl MethodResponse {
    /// Wrap a handler message as `{"Response": message}`.
    pub fn new(status: i32, message: &str) -> Self {
        Self {
            status,
            body: json!({ "Response": message }).to_string(),
        }
    }
}

/// Outbound side of the hub connection. Submissions must not block; the
/// outcome arrives later through the matching [`HubEvents`] confirmation.
pub trait HubTransport: Send + Sync {
    fn send_event(&self, message: OutboundMessage, context: u64) -> Result<()>;

    fn send_reported_state(&self, patch: &str, context: u64) -> Result<()>;
}

/// Inbound side of the hub connection, driven by the transport adapter.
pub trait HubEvents: Send + Sync {
    fn on_message(&self, body: &[u8], properties: &[(String, String)]) -> Disposition;

    fn on_twin_update(&self, state: TwinUpdateState, payload: &str);

    fn on_method_invoke(&self, method_name: &str, payload: &[u8]) -> MethodResponse;

    fn on_connection_status(&self, status: ConnectionStatus, reason: ConnectionReason);

    fn on_send_confirmation(&self, context: u64, result: ConfirmationResult);

    fn on_reported_confirmation(&self, context: u64, status_code: i32);
}

/// Expected body of a cloud-to-device message
#[derive(Debug, Deserialize)]
struct InboundMessage {
    #[serde(rename = "methodName")]
    method_name: String,
    #[serde(default)]
    payload: Value,
}

/// Bridges hub traffic to the registered method and desired-property handlers.
pub struct HubClient {
    transport: Arc<dyn HubTransport>,
    state: Arc<DeviceState>,
    methods: DispatchTable,
    desired: DispatchTable,
    logger: Logger,
}

impl HubClient {
    pub fn new(transport: Arc<dyn HubTransport>, state: Arc<DeviceState>, logger: Logger) -> Self {
        Self {
            transport,
            state,
            methods: DispatchTable::new(),
            desired: DispatchTable::new(),
            logger,
        }
    }

    pub fn state(&self) -> &Arc<DeviceState> {
        &self.state
    }

    pub fn register_method<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Value) -> HandlerStatus + Send + Sync + 'static,
    {
        if self.methods.register(name, handler) {
            self.logger.log_debug(&format!("Replaced handler for method {}", name));
        }
    }

    pub fn register_desired_property<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Value) -> HandlerStatus + Send + Sync + 'static,
    {
        if self.desired.register(name, handler) {
            self.logger.log_debug(&format!("Replaced handler for desired property {}", name));
        }
    }

    /// Submit a telemetry message stamped with the current time.
    ///
    /// The sent counter moves as soon as the transport accepts the message,
    /// whether or not the hub later confirms delivery.
    pub fn send_message(&self, payload: &str) -> Result<()> {
        let now = Local::now();
        let message = OutboundMessage::new(payload.as_bytes())
            .with_property("timestamp", now.to_rfc3339())
            .with_property("$.ct", "application/json")
            .with_property("$.ce", "utf-8");

        self.state.set_last_send(now);
        self.state.set_last_payload(payload);

        self.transport.send_event(message, self.state.sent_count())?;
        self.state.inc_sent_count();
        Ok(())
    }

    /// Submit a reported-property patch and fold it into the stored twin.
    pub fn send_reported_property(&self, patch: &Value) -> Result<()> {
        let payload = patch.to_string();
        self.transport.send_reported_state(&payload, self.state.reported_count())?;
        self.state.inc_reported_count();
        self.state.patch_last_twin(patch, false);
        Ok(())
    }

    /// Report the outcome of applying desired property `name`.
    pub fn echo_back_reported(&self, name: &str, enclosing: &Map<String, Value>, status: &HandlerStatus) -> Result<()> {
        let patch = twin::reported_echo(name, enclosing, status);
        self.send_reported_property(&patch)
    }

    fn log_dropped(&self, err: &AgentError) {
        if err.is_recoverable() {
            self.logger.log_warning(&format!("Dropped: {}", err));
        } else {
            self.logger.log_error(&err.to_string());
        }
    }

    fn apply_partial(&self, payload: &str) -> Result<()> {
        let patch = twin::parse(payload)?;
        if let Some((name, property)) = twin::first_property(&patch) {
            let echoed = self.desired
                .dispatch(name, property)
                .and_then(|status| self.echo_back_reported(name, &patch, &status));
            if let Err(e) = echoed {
                self.log_dropped(&e);
            }
        }
        self.state.patch_last_twin(&Value::Object(patch), true);
        Ok(())
    }

    fn apply_complete(&self, payload: &str) -> Result<()> {
        let complete = twin::parse(payload)?;
        let actions = twin::reconcile(&complete)?;
        let desired = twin::section(&complete, "desired")?;

        for action in actions {
            let name = action.property();
            let status = match &action {
                TwinAction::Apply(_) => match self.desired.dispatch(name, &desired[name]) {
                    Ok(status) => status,
                    Err(e) => {
                        self.log_dropped(&e);
                        continue;
                    }
                },
                TwinAction::Acknowledge(_) => HandlerStatus::completed(),
            };
            if let Err(e) = self.echo_back_reported(name, desired, &status) {
                self.log_dropped(&e);
            }
        }

        self.state.set_last_twin(Value::Object(complete));
        Ok(())
    }
}

impl HubEvents for HubClient {
    fn on_message(&self, body: &[u8], properties: &[(String, String)]) -> Disposition {
        let count = self.state.inc_c2d_count();
        let text = String::from_utf8_lossy(body);
        self.logger.log_info(&format!("Received Message [{}]:", count));
        self.logger.log_info(&format!("    Data: <<<{}>>> & Size={}", text, body.len()));
        self.logger.log_info(&format!("    Properties: {:?}", properties));

        // poison messages are still accepted so the hub does not redeliver them
        let message = match std::str::from_utf8(body)
            .map_err(|e| AgentError::malformed("message", e))
            .and_then(|s| serde_json::from_str::<InboundMessage>(s).map_err(|e| AgentError::malformed("message", e)))
        {
            Ok(message) => message,
            Err(e) => {
                self.log_dropped(&e);
                return Disposition::Accepted;
            }
        };

        if let Err(e) = self.methods.dispatch(&message.method_name, &message.payload) {
            self.log_dropped(&e);
        }
        Disposition::Accepted
    }

    fn on_twin_update(&self, state: TwinUpdateState, payload: &str) {
        let count = self.state.inc_desired_count();
        self.logger.log_info(&format!("Twin callback called with updateStatus: {:?}", state));
        self.logger.log_debug(&format!("payload: {}", payload));
        self.logger.log_info(&format!("Total twin updates: {}", count));

        let result = match state {
            TwinUpdateState::Partial => self.apply_partial(payload),
            TwinUpdateState::Complete => self.apply_complete(payload),
        };
        if let Err(e) = result {
            self.log_dropped(&e);
        }
    }

    fn on_method_invoke(&self, method_name: &str, payload: &[u8]) -> MethodResponse {
        let count = self.state.inc_direct_count();
        self.logger.log_info(&format!(
            "Method callback called with methodName = {} payload = {}",
            method_name,
            String::from_utf8_lossy(payload)
        ));
        self.logger.log_info(&format!("Total method calls: {}", count));

        let handler = match self.methods.lookup(method_name) {
            Ok(handler) => handler,
            Err(e) => {
                self.log_dropped(&e);
                return MethodResponse::new(
                    STATUS_NOT_IMPLEMENTED,
                    &format!("method '{}' not implemented", method_name),
                );
            }
        };

        let params = if payload.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            match serde_json::from_slice::<Value>(payload) {
                Ok(params) => params,
                Err(e) => {
                    let err = AgentError::malformed("method payload", e);
                    self.log_dropped(&err);
                    return MethodResponse::new(STATUS_BAD_REQUEST, &err.to_string());
                }
            }
        };

        let status = handler(&params);
        MethodResponse::new(status.code, &status.text)
    }

    fn on_connection_status(&self, status: ConnectionStatus, reason: ConnectionReason) {
        let count = self.state.inc_connection_count();
        self.logger.log_info(&format!(
            "Connection status changed: result {:?}, reason {:?} (total calls: {})",
            status, reason, count
        ));
    }

    fn on_send_confirmation(&self, context: u64, result: ConfirmationResult) {
        let count = self.state.inc_send_confirmed_count();
        let message = format!(
            "Confirmation[{}] received for message with result = {:?} (total confirmed: {})",
            context, result, count
        );
        match result {
            ConfirmationResult::Ok => self.logger.log_info(&message),
            _ => self.logger.log_warning(&message),
        }
    }

    fn on_reported_confirmation(&self, context: u64, status_code: i32) {
        let count = self.state.inc_reported_confirmed_count();
        self.logger.log_info(&format!(
            "Confirmation[{}] for reported state received with status_code: {} (total confirmed: {})",
            context, status_code, count
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport double that records what the shim submits
    #[derive(Default)]
    struct RecordingTransport {
        events: Mutex<Vec<(OutboundMessage, u64)>>,
        reported: Mutex<Vec<(String, u64)>>,
        fail: bool,
    }

    impl RecordingTransport {
        fn reported(&self) -> Vec<String> {
            self.reported.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
        }
    }

    impl HubTransport for RecordingTransport {
        fn send_event(&self, message: OutboundMessage, context: u64) -> Result<()> {
            if self.fail {
                return Err(AgentError::Transport("queue full".into()));
            }
            self.events.lock().unwrap().push((message, context));
            Ok(())
        }

        fn send_reported_state(&self, patch: &str, context: u64) -> Result<()> {
            self.reported.lock().unwrap().push((patch.to_string(), context));
            Ok(())
        }
    }

    fn client() -> (HubClient, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let client = HubClient::new(transport.clone(), Arc::new(DeviceState::new()), Logger::default());
        (client, transport)
    }

    fn counting_handler(calls: Arc<AtomicUsize>, status: HandlerStatus) -> impl Fn(&Value) -> HandlerStatus + Send + Sync + 'static {
        move |_: &Value| {
            calls.fetch_add(1, Ordering::SeqCst);
            status.clone()
        }
    }

    #[test]
    fn test_method_dispatch_ignores_case() {
        let (client, _) = client();
        let calls = Arc::new(AtomicUsize::new(0));
        client.register_method("Reboot", counting_handler(calls.clone(), HandlerStatus::new(200, "rebooting")));

        let response = client.on_method_invoke("reboot", b"{\"delay\": 0}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(response, MethodResponse {
            status: 200,
            body: r#"{"Response":"rebooting"}"#.to_string(),
        });
        assert_eq!(client.state().direct_count(), 1);
    }

    #[test]
    fn test_unregistered_method_is_not_implemented() {
        let (client, _) = client();
        let response = client.on_method_invoke("selfDestruct", b"{}");
        assert_eq!(response.status, STATUS_NOT_IMPLEMENTED);
        assert!(response.body.contains("selfDestruct"));
    }

    #[test]
    fn test_unregistered_method_with_garbage_body_is_not_implemented() {
        let (client, _) = client();
        let response = client.on_method_invoke("selfDestruct", b"{oops");
        assert_eq!(response, MethodResponse::new(STATUS_NOT_IMPLEMENTED, "method 'selfDestruct' not implemented"));
        assert_eq!(client.state().direct_count(), 1);
    }

    #[test]
    fn test_malformed_method_payload_is_bad_request() {
        let (client, _) = client();
        let calls = Arc::new(AtomicUsize::new(0));
        client.register_method("ping", counting_handler(calls.clone(), HandlerStatus::new(200, "pong")));

        assert_eq!(client.on_method_invoke("ping", b"{oops").status, STATUS_BAD_REQUEST);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // an empty body is a call without arguments
        assert_eq!(client.on_method_invoke("ping", b"").status, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_c2d_message_dispatches_payload() {
        let (client, _) = client();
        let seen = Arc::new(Mutex::new(Value::Null));
        let sink = seen.clone();
        client.register_method("blink", move |payload| {
            *sink.lock().unwrap() = payload.clone();
            HandlerStatus::completed()
        });

        let body = br#"{"methodName": "BLINK", "payload": {"times": 3}}"#;
        assert_eq!(client.on_message(body, &[]), Disposition::Accepted);
        assert_eq!(*seen.lock().unwrap(), json!({"times": 3}));
        assert_eq!(client.state().c2d_count(), 1);
    }

    #[test]
    fn test_malformed_c2d_message_is_accepted_and_dropped() {
        let (client, transport) = client();
        assert_eq!(client.on_message(b"not json", &[]), Disposition::Accepted);
        assert_eq!(client.on_message(br#"{"payload": {}}"#, &[]), Disposition::Accepted);
        assert_eq!(client.on_message(&[0xff, 0xfe], &[]), Disposition::Accepted);
        assert_eq!(client.state().c2d_count(), 3);
        assert!(transport.reported().is_empty());
    }

    #[test]
    fn test_partial_update_echoes_handler_status() {
        let (client, transport) = client();
        let calls = Arc::new(AtomicUsize::new(0));
        client.register_desired_property("temp", counting_handler(calls.clone(), HandlerStatus::completed()));

        client.on_twin_update(TwinUpdateState::Partial, r#"{"temp": {"value": 5}, "$version": 3}"#);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.reported(), vec![
            r#"{"temp":{"value":5,"statusCode":200,"status":"completed","desiredVersion":3}}"#.to_string(),
        ]);
        assert_eq!(client.state().desired_count(), 1);
        assert_eq!(client.state().reported_count(), 1);
        assert_eq!(client.state().last_twin()["desired"]["$version"], json!(3));
        assert_eq!(client.state().last_twin()["reported"]["temp"]["desiredVersion"], json!(3));
    }

    #[test]
    fn test_partial_update_boolean_echo() {
        let (client, transport) = client();
        client.register_desired_property("fan", |property| {
            HandlerStatus::new(200, if property["value"] == json!(true) { "on" } else { "off" })
        });

        client.on_twin_update(TwinUpdateState::Partial, r#"{"fan": {"value": false}, "$version": 2}"#);
        assert_eq!(transport.reported(), vec![
            r#"{"fan":{"value":false,"statusCode":200,"status":"off","desiredVersion":2}}"#.to_string(),
        ]);
    }

    #[test]
    fn test_partial_update_without_handler_still_recorded() {
        let (client, transport) = client();
        client.on_twin_update(TwinUpdateState::Partial, r#"{"color": {"value": "red"}, "$version": 4}"#);

        assert!(transport.reported().is_empty());
        assert_eq!(client.state().last_twin()["desired"]["color"], json!({"value": "red"}));
    }

    #[test]
    fn test_complete_update_settled_sends_nothing() {
        let (client, transport) = client();
        let calls = Arc::new(AtomicUsize::new(0));
        client.register_desired_property("temp", counting_handler(calls.clone(), HandlerStatus::completed()));
        client.register_desired_property("fan", counting_handler(calls.clone(), HandlerStatus::completed()));

        let twin = json!({
            "desired": {"temp": {"value": 5}, "fan": {"value": true}, "$version": 6},
            "reported": {
                "temp": {"value": 1, "desiredVersion": 6},
                "fan": {"value": false, "desiredVersion": 6},
                "$version": 12
            }
        });
        client.on_twin_update(TwinUpdateState::Complete, &twin.to_string());

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(transport.reported().is_empty());
        assert_eq!(client.state().last_twin(), twin);
    }

    #[test]
    fn test_complete_update_applies_and_acknowledges() {
        let (client, transport) = client();
        let calls = Arc::new(AtomicUsize::new(0));
        client.register_desired_property("temp", counting_handler(calls.clone(), HandlerStatus::new(202, "applying")));

        let twin = json!({
            "desired": {"temp": {"value": 5}, "fan": {"value": true}, "$version": 7},
            "reported": {
                "temp": {"value": 1, "desiredVersion": 6},
                "fan": {"value": true, "desiredVersion": 6}
            }
        });
        client.on_twin_update(TwinUpdateState::Complete, &twin.to_string());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.reported(), vec![
            r#"{"temp":{"value":5,"statusCode":202,"status":"applying","desiredVersion":7}}"#.to_string(),
            r#"{"fan":{"value":true,"statusCode":200,"status":"completed","desiredVersion":7}}"#.to_string(),
        ]);
    }

    #[test]
    fn test_malformed_twin_is_dropped() {
        let (client, transport) = client();
        client.on_twin_update(TwinUpdateState::Complete, "{\"reported\": {}}");
        client.on_twin_update(TwinUpdateState::Partial, "garbage");
        assert_eq!(client.state().desired_count(), 2);
        assert!(transport.reported().is_empty());
    }

    #[test]
    fn test_send_message_counts_once_and_stamps() {
        let (client, transport) = client();
        client.send_message("{\"cpuTemperature\": 48.2}").unwrap();
        assert_eq!(client.state().sent_count(), 1);

        client.send_message("{\"cpuTemperature\": 48.5}").unwrap();
        assert_eq!(client.state().sent_count(), 2);

        let events = transport.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        // context is the count before the send
        assert_eq!(events[0].1, 0);
        assert_eq!(events[1].1, 1);
        assert!(events[0].0.property("timestamp").is_some());
        assert_eq!(client.state().last_payload().as_deref(), Some("{\"cpuTemperature\": 48.5}"));
    }

    #[test]
    fn test_rejected_send_is_not_counted() {
        let transport = Arc::new(RecordingTransport { fail: true, ..Default::default() });
        let client = HubClient::new(transport, Arc::new(DeviceState::new()), Logger::default());
        assert!(matches!(client.send_message("{}"), Err(AgentError::Transport(_))));
        assert_eq!(client.state().sent_count(), 0);
    }

    #[test]
    fn test_confirmations_count() {
        let (client, _) = client();
        client.on_send_confirmation(0, ConfirmationResult::Ok);
        client.on_send_confirmation(1, ConfirmationResult::MessageTimeout);
        client.on_reported_confirmation(0, 204);
        client.on_connection_status(ConnectionStatus::Authenticated, ConnectionReason::ConnectionOk);

        let snapshot = client.state().snapshot();
        assert_eq!(snapshot.send_confirmed_count, 2);
        assert_eq!(snapshot.reported_confirmed_count, 1);
        assert_eq!(snapshot.connection_count, 1);
    }
}
