use crate::config::MqttSettings;
use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use fusion::{EntryListener, TableError, TableValue, TelemetryTable};
use rumqttc::{Client, ConnectionError, Event, MqttOptions, Packet, QoS};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

type Cache = Arc<RwLock<HashMap<String, TableValue>>>;
type Listeners = Arc<Mutex<HashMap<String, Vec<EntryListener>>>>;

/// Batches waiting for the publisher thread. A fusion cycle is one batch.
const OUTBOUND_BATCHES: usize = 4;

struct Outgoing {
    key: String,
    topic: String,
    payload: Vec<u8>,
}

type Batch = Vec<Outgoing>;

/// Telemetry table mirrored onto an MQTT broker.
///
/// Each key lives on `<prefix>/<key>` as a JSON array, published without
/// the retain flag so a stopped process leaves no positions behind on the
/// broker. Everything under the prefix is subscribed to, so values written
/// by the robot controller land in the local cache and reach registered
/// listeners.
pub struct MqttTable {
    outbound: Sender<Batch>,
    prefix: String,
    cache: Cache,
    listeners: Listeners,
    connected: Arc<AtomicBool>,
}

impl MqttTable {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let mut mqtt_options =
            MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_clean_session(true);

        let (client, mut connection) = Client::new(mqtt_options, 64);
        let prefix = settings.topic_prefix.trim_end_matches('/').to_string();
        let cache: Cache = Arc::default();
        let listeners: Listeners = Arc::default();
        let connected = Arc::new(AtomicBool::new(false));

        let event_loop = {
            let client = client.clone();
            let prefix = prefix.clone();
            let cache = Arc::clone(&cache);
            let listeners = Arc::clone(&listeners);
            let connected = Arc::clone(&connected);

            move || {
                let mut reconnect_attempts = 0u32;

                loop {
                    for notification in connection.iter() {
                        match notification {
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                connected.store(true, Ordering::Release);
                                reconnect_attempts = 0;
                                tracing::info!("MQTT connected to broker");

                                let filter = format!("{prefix}/#");
                                if let Err(e) = client.try_subscribe(&filter, QoS::AtLeastOnce) {
                                    tracing::error!(error = %e, filter = %filter, "MQTT subscribe failed");
                                }
                            }
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                let Some(key) = key_from_topic(&prefix, &publish.topic) else {
                                    continue;
                                };
                                match decode_value(&publish.payload) {
                                    Ok(value) => apply_incoming(&cache, &listeners, key, value),
                                    Err(e) => tracing::debug!(
                                        key,
                                        error = %e,
                                        "Ignoring undecodable table entry"
                                    ),
                                }
                            }
                            Ok(Event::Incoming(Packet::PingResp)) => {
                                tracing::trace!("MQTT ping response received");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                connected.store(false, Ordering::Release);
                                match &e {
                                    ConnectionError::Io(_) | ConnectionError::NetworkTimeout => {
                                        reconnect_attempts = reconnect_attempts.saturating_add(1);
                                        let backoff = calculate_backoff(reconnect_attempts);
                                        tracing::warn!(
                                            error = %e,
                                            attempt = reconnect_attempts,
                                            backoff_ms = backoff.as_millis(),
                                            "MQTT connection lost, reconnecting"
                                        );
                                        std::thread::sleep(backoff);
                                    }
                                    _ => {
                                        tracing::error!(error = %e, "MQTT error");
                                    }
                                }
                            }
                        }
                    }

                    connected.store(false, Ordering::Release);
                    reconnect_attempts = reconnect_attempts.saturating_add(1);
                    let backoff = calculate_backoff(reconnect_attempts);
                    tracing::warn!(
                        attempt = reconnect_attempts,
                        backoff_ms = backoff.as_millis(),
                        "MQTT connection closed, attempting reconnect"
                    );
                    std::thread::sleep(backoff);
                }
            }
        };

        std::thread::Builder::new()
            .name("mqtt-table".into())
            .spawn(event_loop)?;

        let (outbound, pending) = crossbeam_channel::bounded(OUTBOUND_BATCHES);
        std::thread::Builder::new()
            .name("mqtt-publisher".into())
            .spawn(move || drain_batches(&client, pending))?;

        tracing::info!(
            broker = %format!("{}:{}", settings.host, settings.port),
            prefix = %prefix,
            client_id = %settings.client_id,
            "MQTT telemetry table initialized"
        );

        Ok(Self {
            outbound,
            prefix,
            cache,
            listeners,
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn topic(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }
}

impl TelemetryTable for MqttTable {
    fn put(&self, key: &str, value: TableValue) -> Result<(), TableError> {
        self.publish_batch(vec![(key.to_string(), value)])
    }

    fn get(&self, key: &str) -> Option<TableValue> {
        self.cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    fn add_entry_listener(&self, key: &str, listener: EntryListener) -> Result<(), TableError> {
        self.listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(key.to_string())
            .or_default()
            .push(Arc::clone(&listener));

        if let Some(current) = self.get(key) {
            listener(key, &current);
        }
        Ok(())
    }

    /// Encodes every entry, then hands the whole batch to the publisher
    /// thread in one queue slot. Either every entry is sent or none is.
    fn publish_batch(&self, entries: Vec<(String, TableValue)>) -> Result<(), TableError> {
        if !self.is_connected() {
            return Err(TableError::Disconnected(format!(
                "broker not connected ({} entries dropped)",
                entries.len()
            )));
        }

        let batch = entries
            .iter()
            .map(|(key, value)| {
                Ok(Outgoing {
                    key: key.clone(),
                    topic: self.topic(key),
                    payload: encode_value(key, value)?,
                })
            })
            .collect::<Result<Batch, TableError>>()?;

        enqueue_batch(&self.outbound, batch)?;

        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        for (key, value) in entries {
            cache.insert(key, value);
        }
        Ok(())
    }
}

fn enqueue_batch(outbound: &Sender<Batch>, batch: Batch) -> Result<(), TableError> {
    outbound.try_send(batch).map_err(|e| match e {
        TrySendError::Full(batch) => TableError::QueueFull {
            entries: batch.len(),
        },
        TrySendError::Disconnected(batch) => TableError::Disconnected(format!(
            "publisher stopped ({} entries dropped)",
            batch.len()
        )),
    })
}

/// Publisher thread body. Blocks on the client's request channel so an
/// accepted batch always goes out in full and in order.
fn drain_batches(client: &Client, pending: Receiver<Batch>) {
    for batch in pending {
        for entry in batch {
            if let Err(e) = client.publish(entry.topic, QoS::AtLeastOnce, false, entry.payload) {
                tracing::error!(key = %entry.key, error = %e, "MQTT publish failed");
            }
        }
    }
    tracing::debug!("MQTT publisher stopped");
}

fn apply_incoming(cache: &Cache, listeners: &Listeners, key: &str, value: TableValue) {
    cache
        .write()
        .unwrap_or_else(|p| p.into_inner())
        .insert(key.to_string(), value.clone());

    let watchers = listeners
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .get(key)
        .cloned()
        .unwrap_or_default();

    for listener in watchers {
        listener(key, &value);
    }
}

/// Table key for `topic`, or `None` when the topic is outside the prefix.
pub fn key_from_topic<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    topic
        .strip_prefix(prefix)?
        .strip_prefix('/')
        .filter(|key| !key.is_empty())
}

pub fn encode_value(key: &str, value: &TableValue) -> Result<Vec<u8>, TableError> {
    let encoded = match value {
        TableValue::NumberArray(values) => {
            if values.iter().any(|v| !v.is_finite()) {
                return Err(TableError::Encode {
                    key: key.to_string(),
                    reason: "non-finite number".into(),
                });
            }
            serde_json::to_vec(values)
        }
        TableValue::StringArray(values) => serde_json::to_vec(values),
    };

    encoded.map_err(|e| TableError::Encode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Accepts a JSON number array, a string array or a bare number (treated as
/// a one-element array, which is how controllers usually send scalars).
pub fn decode_value(payload: &[u8]) -> Result<TableValue, serde_json::Error> {
    use serde_json::Value;

    let value: Value = serde_json::from_slice(payload)?;
    let decoded = match value {
        Value::Number(n) => n.as_f64().map(|n| TableValue::NumberArray(vec![n])),
        Value::Array(items) if items.iter().all(Value::is_number) => Some(TableValue::NumberArray(
            items.iter().filter_map(Value::as_f64).collect(),
        )),
        Value::Array(items) if items.iter().all(Value::is_string) => Some(TableValue::StringArray(
            items
                .into_iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s),
                    _ => None,
                })
                .collect(),
        )),
        _ => None,
    };

    match decoded {
        Some(value) => Ok(value),
        None => serde_json::from_slice::<Vec<f64>>(payload).map(TableValue::NumberArray),
    }
}

/// Calculate exponential backoff with jitter, capped at 30 seconds
fn calculate_backoff(attempt: u32) -> Duration {
    const BASE_MS: u64 = 100;
    const MAX_MS: u64 = 30_000;

    let exp_backoff = BASE_MS.saturating_mul(2u64.saturating_pow(attempt.min(10)));
    let capped = exp_backoff.min(MAX_MS);

    let jitter = (capped / 10).max(1);
    let jittered = capped.saturating_add(fastrand::u64(0..jitter));

    Duration::from_millis(jittered)
}
