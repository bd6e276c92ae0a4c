use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{Map, Value};

/// Counters and last-seen values updated by the hub callbacks.
///
/// Callbacks may run concurrently with the telemetry loop, so counters are
/// atomics and the remaining fields sit behind a mutex.
#[derive(Debug, Default)]
pub struct DeviceState {
    sent: AtomicU64,
    c2d: AtomicU64,
    reported: AtomicU64,
    desired: AtomicU64,
    direct: AtomicU64,
    connection: AtomicU64,
    send_confirmed: AtomicU64,
    reported_confirmed: AtomicU64,
    last: Mutex<LastSeen>,
}

#[derive(Debug, Default, Clone)]
struct LastSeen {
    send: Option<DateTime<Local>>,
    payload: Option<String>,
    twin: Value,
}

/// Point-in-time copy of the device state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub sent_count: u64,
    pub c2d_count: u64,
    pub reported_count: u64,
    pub desired_count: u64,
    pub direct_count: u64,
    pub connection_count: u64,
    pub send_confirmed_count: u64,
    pub reported_confirmed_count: u64,
    pub last_send: Option<String>,
    pub last_payload: Option<String>,
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) -> u64 {
            self.$field.fetch_add(1, Ordering::SeqCst) + 1
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::SeqCst)
        }
    };
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(inc_sent_count, sent_count, sent);
    counter!(inc_c2d_count, c2d_count, c2d);
    counter!(inc_reported_count, reported_count, reported);
    counter!(inc_desired_count, desired_count, desired);
    counter!(inc_direct_count, direct_count, direct);
    counter!(inc_connection_count, connection_count, connection);
    counter!(inc_send_confirmed_count, send_confirmed_count, send_confirmed);
    counter!(inc_reported_confirmed_count, reported_confirmed_count, reported_confirmed);

    fn last(&self) -> MutexGuard<'_, LastSeen> {
        // a panicking handler must not take the counters down with it
        self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_last_send(&self, when: DateTime<Local>) {
        self.last().send = Some(when);
    }

    pub fn last_send(&self) -> Option<DateTime<Local>> {
        self.last().send
    }

    pub fn set_last_payload(&self, payload: &str) {
        self.last().payload = Some(payload.to_string());
    }

    pub fn last_payload(&self) -> Option<String> {
        self.last().payload.clone()
    }

    /// Replace the stored twin with a full document.
    pub fn set_last_twin(&self, twin: Value) {
        self.last().twin = twin;
    }

    /// Merge a patch into the `desired` or `reported` section of the stored twin.
    ///
    /// Members set to `null` are removed, as in a twin patch.
    pub fn patch_last_twin(&self, patch: &Value, desired: bool) {
        let section = if desired { "desired" } else { "reported" };
        let mut last = self.last();
        if !last.twin.is_object() {
            last.twin = Value::Object(Map::new());
        }
        if let Value::Object(twin) = &mut last.twin {
            let target = twin.entry(section).or_insert_with(|| Value::Object(Map::new()));
            merge_patch(target, patch);
        }
    }

    pub fn last_twin(&self) -> Value {
        self.last().twin.clone()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let last = self.last().clone();
        DeviceSnapshot {
            sent_count: self.sent_count(),
            c2d_count: self.c2d_count(),
            reported_count: self.reported_count(),
            desired_count: self.desired_count(),
            direct_count: self.direct_count(),
            connection_count: self.connection_count(),
            send_confirmed_count: self.send_confirmed_count(),
            reported_confirmed_count: self.reported_confirmed_count(),
            last_send: last.send.map(|t| t.to_rfc3339()),
            last_payload: last.payload,
        }
    }
}

fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.shift_remove(key);
            } else {
                merge_patch(target.entry(key.as_str()).or_insert(Value::Null), value);
            }
        }
    }
}
