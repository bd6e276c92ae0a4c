//! IoT Hub adapter over `rumqttc`.
//!
//! Maps the hub's MQTT topic layout onto [`HubTransport`] submissions and
//! [`HubEvents`] callbacks. Connection handling, keep-alive and TLS stay with
//! `rumqttc`; this module only adds the message timeout and the fixed-interval
//! retry policy.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Publish, QoS, TlsConfiguration, Transport,
};
use tokio::time::{Instant, interval};

use crate::config::{AgentConfig, Security};
use crate::error::{AgentError, Result};
use crate::hub::{
    ConfirmationResult, ConnectionReason, ConnectionStatus, HubEvents, HubTransport, OutboundMessage,
};
use crate::logger::Logger;
use crate::twin::TwinUpdateState;

pub const API_VERSION: &str = "2021-04-12";
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const KEEP_ALIVE: Duration = Duration::from_secs(30);
/// Reported to `on_reported_confirmation` when the hub never answered a patch.
pub const STATUS_REQUEST_TIMEOUT: i32 = 408;
const REQUEST_CAPACITY: usize = 64;

/// Fixed-interval reconnect policy
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Give up after failing this long; zero retries forever.
    pub timeout_limit: Duration,
}

impl RetryPolicy {
    pub fn expired(&self, failing_for: Duration) -> bool {
        !self.timeout_limit.is_zero() && failing_for >= self.timeout_limit
    }
}

/// Hub topics the adapter reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubTopic {
    CloudToDevice { properties: Vec<(String, String)> },
    MethodCall { name: String, rid: String },
    TwinResponse { status: i32, rid: String },
    DesiredPatch,
}

impl HubTopic {
    pub fn parse(topic: &str, device_id: &str) -> Option<HubTopic> {
        let c2d_prefix = format!("devices/{}/messages/devicebound/", device_id);
        if let Some(bag) = topic.strip_prefix(&c2d_prefix) {
            return Some(HubTopic::CloudToDevice { properties: parse_query(bag) });
        }

        if let Some(rest) = topic.strip_prefix("$iothub/methods/POST/") {
            let (name, query) = rest.split_once("/?")?;
            let rid = query_value(query, "$rid")?;
            return Some(HubTopic::MethodCall { name: name.to_string(), rid });
        }

        if let Some(rest) = topic.strip_prefix("$iothub/twin/res/") {
            let (status, query) = rest.split_once("/?")?;
            let status = status.parse().ok()?;
            let rid = query_value(query, "$rid")?;
            return Some(HubTopic::TwinResponse { status, rid });
        }

        if topic.starts_with("$iothub/twin/PATCH/properties/desired/") {
            return Some(HubTopic::DesiredPatch);
        }

        None
    }
}

fn query_value(query: &str, key: &str) -> Option<String> {
    parse_query(query).into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

/// Decode a `k=v&k2=v2` property bag.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

/// Encode message properties for the telemetry topic suffix.
pub fn encode_properties(properties: &[(String, String)]) -> String {
    properties
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn percent_encode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'$' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let hex = if bytes[i] == b'%' && i + 2 < bytes.len() {
            std::str::from_utf8(&bytes[i + 1..i + 3]).ok().and_then(|h| u8::from_str_radix(h, 16).ok())
        } else {
            None
        };
        match hex {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            None => {
                out.push(if bytes[i] == b'+' { b' ' } else { bytes[i] });
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn telemetry_topic(device_id: &str, properties: &[(String, String)]) -> String {
    format!("devices/{}/messages/events/{}", device_id, encode_properties(properties))
}

pub fn method_response_topic(status: i32, rid: &str) -> String {
    format!("$iothub/methods/res/{}/?$rid={}", status, rid)
}

pub fn twin_get_topic(rid: &str) -> String {
    format!("$iothub/twin/GET/?$rid={}", rid)
}

pub fn reported_patch_topic(rid: &str) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={}", rid)
}

/// Requests waiting on a `$iothub/twin/res` answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TwinRequest {
    Get,
    Reported(u64),
}

/// Telemetry waiting for its PUBACK
#[derive(Debug, Default)]
struct PendingSends {
    /// submitted but not yet handed a packet id by the event loop
    queued: VecDeque<(u64, Instant)>,
    in_flight: HashMap<u16, (u64, Instant)>,
}

impl PendingSends {
    /// Bind the next queued message to `pkid`. A pkid already in flight is
    /// a replay after reconnect and keeps its original message.
    fn assign(&mut self, pkid: u16) {
        if self.in_flight.contains_key(&pkid) {
            return;
        }
        if let Some(entry) = self.queued.pop_front() {
            self.in_flight.insert(pkid, entry);
        }
    }

    fn confirm(&mut self, pkid: u16) -> Option<u64> {
        self.in_flight.remove(&pkid).map(|(context, _)| context)
    }

    /// Everything still unconfirmed, oldest first.
    fn drain(&mut self) -> Vec<u64> {
        let mut contexts: Vec<(u64, Instant)> = self.queued.drain(..).collect();
        contexts.extend(self.in_flight.drain().map(|(_, entry)| entry));
        contexts.sort_by_key(|&(context, _)| context);
        contexts.into_iter().map(|(context, _)| context).collect()
    }

    fn expire(&mut self, timeout: Duration) -> Vec<u64> {
        let now = Instant::now();
        let mut expired = Vec::new();
        while let Some(&(context, at)) = self.queued.front() {
            if now.duration_since(at) < timeout {
                break;
            }
            expired.push(context);
            self.queued.pop_front();
        }
        self.in_flight.retain(|_, &mut (context, at)| {
            let keep = now.duration_since(at) < timeout;
            if !keep {
                expired.push(context);
            }
            keep
        });
        expired
    }
}

#[derive(Debug, Default)]
struct Shared {
    pending: Mutex<PendingSends>,
    twin_requests: Mutex<HashMap<String, (TwinRequest, Instant)>>,
    next_rid: AtomicU64,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingSends> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn twin_requests(&self) -> MutexGuard<'_, HashMap<String, (TwinRequest, Instant)>> {
        self.twin_requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track(&self, request: TwinRequest) -> String {
        let rid = self.next_rid.fetch_add(1, Ordering::SeqCst).to_string();
        self.twin_requests().insert(rid.clone(), (request, Instant::now()));
        rid
    }

    fn answered(&self, rid: &str) -> Option<TwinRequest> {
        self.twin_requests().remove(rid).map(|(request, _)| request)
    }

    /// Drop twin requests the hub has not answered within `timeout`.
    fn expire_twin_requests(&self, timeout: Duration) -> Vec<TwinRequest> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.twin_requests().retain(|_, &mut (request, at)| {
            let keep = now.duration_since(at) < timeout;
            if !keep {
                expired.push(request);
            }
            keep
        });
        expired
    }
}

/// Outbound half: non-blocking submissions onto the MQTT request queue.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    device_id: String,
    shared: Arc<Shared>,
}

impl MqttTransport {
    /// Build the MQTT client for `config`. Nothing touches the network until
    /// the returned event loop is run.
    pub fn connect(config: &AgentConfig, logger: Logger) -> Result<(MqttTransport, MqttEventLoop)> {
        logger.log_debug(&format!(
            "- creating the client with {} {} {} MQTT",
            config.hub_host_name, config.device_id, config.security.name()
        ));

        let options = mqtt_options(config)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let shared = Arc::new(Shared::default());

        let retry = RetryPolicy {
            interval: RETRY_INTERVAL,
            timeout_limit: config.retry_timeout_limit,
        };
        logger.log_info(&format!("SetRetryPolicy to: retryPolicy = interval {:?}", retry.interval));
        logger.log_info(&format!("SetRetryPolicy to: retryTimeoutLimitInSeconds = {}", retry.timeout_limit.as_secs()));

        let transport = MqttTransport {
            client: client.clone(),
            device_id: config.device_id.clone(),
            shared: shared.clone(),
        };
        let event_loop = MqttEventLoop {
            eventloop,
            transport: transport.clone(),
            message_timeout: config.message_timeout,
            retry,
            logger,
        };
        Ok((transport, event_loop))
    }

    fn subscribe_all(&self) -> Result<()> {
        let topics = [
            format!("devices/{}/messages/devicebound/#", self.device_id),
            "$iothub/methods/POST/#".to_string(),
            "$iothub/twin/res/#".to_string(),
            "$iothub/twin/PATCH/properties/desired/#".to_string(),
        ];
        for topic in topics {
            self.client.try_subscribe(topic, QoS::AtLeastOnce)?;
        }
        Ok(())
    }

    fn request_twin(&self) -> Result<()> {
        let rid = self.shared.track(TwinRequest::Get);
        if let Err(e) = self.client.try_publish(twin_get_topic(&rid), QoS::AtMostOnce, false, Vec::new()) {
            self.shared.twin_requests().remove(&rid);
            return Err(e.into());
        }
        Ok(())
    }

    fn respond_method(&self, rid: &str, status: i32, body: String) -> Result<()> {
        let topic = method_response_topic(status, rid);
        self.client.try_publish(topic, QoS::AtMostOnce, false, body.into_bytes())?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await?;
        Ok(())
    }
}

impl HubTransport for MqttTransport {
    fn send_event(&self, message: OutboundMessage, context: u64) -> Result<()> {
        let topic = telemetry_topic(&self.device_id, &message.properties);
        // queue first: the event loop may assign the packet id before we return
        self.shared.pending().queued.push_back((context, Instant::now()));
        if let Err(e) = self.client.try_publish(topic, QoS::AtLeastOnce, false, message.body) {
            self.shared.pending().queued.pop_back();
            return Err(e.into());
        }
        Ok(())
    }

    fn send_reported_state(&self, patch: &str, context: u64) -> Result<()> {
        let rid = self.shared.track(TwinRequest::Reported(context));
        let topic = reported_patch_topic(&rid);
        if let Err(e) = self.client.try_publish(topic, QoS::AtMostOnce, false, patch.as_bytes().to_vec()) {
            self.shared.twin_requests().remove(&rid);
            return Err(e.into());
        }
        Ok(())
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| AgentError::HubClientInit(format!("cannot read {}: {}", path.display(), e)))
}

fn mqtt_options(config: &AgentConfig) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(&config.device_id, &config.hub_host_name, config.port);
    options.set_keep_alive(KEEP_ALIVE);

    let username = format!("{}/{}/?api-version={}", config.hub_host_name, config.device_id, API_VERSION);
    let ca = read_pem(&config.ca_cert_path)?;

    let client_auth = match &config.security {
        Security::Sas { token } => {
            options.set_credentials(username, token.clone());
            None
        }
        Security::X509 { cert_path, key_path } => {
            options.set_credentials(username, "");
            Some((read_pem(cert_path)?, read_pem(key_path)?))
        }
    };

    options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }));
    Ok(options)
}

fn connection_reason(err: &ConnectionError) -> ConnectionReason {
    match err {
        ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized,
        ) => ConnectionReason::BadCredential,
        ConnectionError::Io(_) => ConnectionReason::NoNetwork,
        _ => ConnectionReason::CommunicationError,
    }
}

/// Inbound half: drives `rumqttc` and turns hub traffic into callbacks.
pub struct MqttEventLoop {
    eventloop: EventLoop,
    transport: MqttTransport,
    message_timeout: Duration,
    retry: RetryPolicy,
    logger: Logger,
}

impl MqttEventLoop {
    /// Poll until the retry policy expires or the client disconnects.
    pub async fn run(mut self, events: Arc<dyn HubEvents>) -> Result<()> {
        let sweeper = self.spawn_timeout_sweep(events.clone());
        let result = self.poll_loop(events.as_ref()).await;
        sweeper.abort();
        result
    }

    async fn poll_loop(&mut self, events: &dyn HubEvents) -> Result<()> {
        let mut failing_since: Option<Instant> = None;

        loop {
            let polled = self.eventloop.poll().await;
            if ends_session(&polled) {
                self.logger.log_info("Disconnected from the hub");
                return Ok(());
            }

            match polled {
                Ok(event) => {
                    if let Event::Incoming(Packet::ConnAck(ack)) = &event {
                        if ack.code == ConnectReturnCode::Success {
                            failing_since = None;
                        }
                    }
                    self.handle_event(event, events);
                }
                Err(e) => {
                    let since = *failing_since.get_or_insert_with(Instant::now);
                    if self.retry.expired(since.elapsed()) {
                        let unconfirmed = self.transport.shared.pending().drain();
                        for context in unconfirmed {
                            events.on_send_confirmation(context, ConfirmationResult::Error);
                        }
                        events.on_connection_status(ConnectionStatus::Unauthenticated, ConnectionReason::RetryExpired);
                        return Err(AgentError::RetryExpired(self.retry.timeout_limit.as_secs()));
                    }
                    self.logger.log_warning(&format!("Connection error: {}; retrying in {:?}", e, self.retry.interval));
                    events.on_connection_status(ConnectionStatus::Unauthenticated, connection_reason(&e));
                    tokio::time::sleep(self.retry.interval).await;
                }
            }
        }
    }

    /// Report telemetry and twin requests that outlived the message timeout.
    fn spawn_timeout_sweep(&self, events: Arc<dyn HubEvents>) -> tokio::task::JoinHandle<()> {
        let shared = self.transport.shared.clone();
        let timeout = self.message_timeout;
        let logger = self.logger.clone();

        tokio::spawn(async move {
            let mut sweep_interval = interval(Duration::from_secs(1));
            loop {
                sweep_interval.tick().await;
                sweep_expired(&shared, events.as_ref(), &logger, timeout);
            }
        })
    }

    fn handle_event(&self, event: Event, events: &dyn HubEvents) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    events.on_connection_status(ConnectionStatus::Unauthenticated, ConnectionReason::BadCredential);
                    return;
                }
                events.on_connection_status(ConnectionStatus::Authenticated, ConnectionReason::ConnectionOk);
                if let Err(e) = self.transport.subscribe_all().and_then(|_| self.transport.request_twin()) {
                    self.logger.log_error(&format!("Cannot subscribe to hub topics: {}", e));
                }
            }
            Event::Incoming(Packet::Publish(publish)) => self.route(publish, events),
            Event::Incoming(Packet::PubAck(ack)) => {
                let confirmed = self.transport.shared.pending().confirm(ack.pkid);
                if let Some(context) = confirmed {
                    events.on_send_confirmation(context, ConfirmationResult::Ok);
                }
            }
            Event::Outgoing(Outgoing::Publish(pkid)) if pkid != 0 => {
                // only telemetry goes out at QoS 1, so packet ids map onto the queue in order
                self.transport.shared.pending().assign(pkid);
            }
            _ => {}
        }
    }

    fn route(&self, publish: Publish, events: &dyn HubEvents) {
        let Some(topic) = HubTopic::parse(&publish.topic, &self.transport.device_id) else {
            self.logger.log_debug(&format!("Ignoring publish on {}", publish.topic));
            return;
        };

        match topic {
            HubTopic::CloudToDevice { properties } => {
                events.on_message(&publish.payload, &properties);
            }
            HubTopic::MethodCall { name, rid } => {
                let response = events.on_method_invoke(&name, &publish.payload);
                if let Err(e) = self.transport.respond_method(&rid, response.status, response.body) {
                    self.logger.log_error(&format!("Cannot answer method {}: {}", name, e));
                }
            }
            HubTopic::DesiredPatch => {
                let payload = String::from_utf8_lossy(&publish.payload);
                events.on_twin_update(TwinUpdateState::Partial, &payload);
            }
            HubTopic::TwinResponse { status, rid } => {
                let request = self.transport.shared.answered(&rid);
                match request {
                    Some(TwinRequest::Get) if status == 200 => {
                        let payload = String::from_utf8_lossy(&publish.payload);
                        events.on_twin_update(TwinUpdateState::Complete, &payload);
                    }
                    Some(TwinRequest::Get) => {
                        self.logger.log_error(&format!("Twin request failed with status {}", status));
                    }
                    Some(TwinRequest::Reported(context)) => events.on_reported_confirmation(context, status),
                    None => self.logger.log_debug(&format!("Unexpected twin response rid {}", rid)),
                }
            }
        }
    }
}

/// A DISCONNECT went out, or every client handle is gone.
fn ends_session(polled: &std::result::Result<Event, ConnectionError>) -> bool {
    matches!(
        polled,
        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(ConnectionError::RequestsDone)
    )
}

fn sweep_expired(shared: &Shared, events: &dyn HubEvents, logger: &Logger, timeout: Duration) {
    let expired = shared.pending().expire(timeout);
    for context in expired {
        events.on_send_confirmation(context, ConfirmationResult::MessageTimeout);
    }

    for request in shared.expire_twin_requests(timeout) {
        match request {
            TwinRequest::Reported(context) => events.on_reported_confirmation(context, STATUS_REQUEST_TIMEOUT),
            // the next ConnAck asks for the twin again
            TwinRequest::Get => logger.log_warning("Twin request got no answer"),
        }
    }
}
