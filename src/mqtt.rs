use crate::bus::{BusService, PathState, PublicationError, Value};
use async_trait::async_trait;
use paho_mqtt::{AsyncClient, Message, QOS_1 as QOS_AT_LEAST_ONCE};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

const SERVICE_TYPE: &str = "pvinverter";

fn mqtt_avail_topic(client_id: &str) -> String {
    format!("{client_id}/bridge/state")
}

pub fn notification_topic(client_id: &str, device_instance: u32, path: &str) -> String {
    format!("{client_id}/N/{SERVICE_TYPE}/{device_instance}{path}")
}

fn write_topic_prefix(client_id: &str, device_instance: u32) -> String {
    format!("{client_id}/W/{SERVICE_TYPE}/{device_instance}")
}

pub fn write_subscription(client_id: &str, device_instance: u32) -> String {
    format!("{}/#", write_topic_prefix(client_id, device_instance))
}

pub async fn announce_online(client_id: &str, client: &AsyncClient) -> anyhow::Result<()> {
    client
        .publish(Message::new_retained(
            mqtt_avail_topic(client_id),
            b"online".to_owned(),
            QOS_AT_LEAST_ONCE,
        ))
        .await?;
    Ok(())
}

pub fn offline_message(client_id: &str) -> Message {
    Message::new_retained(mqtt_avail_topic(client_id), "offline".to_owned(), QOS_AT_LEAST_ONCE)
}

pub async fn announce_offline(client_id: &str, client: &AsyncClient) -> anyhow::Result<()> {
    client.publish(offline_message(client_id)).await?;
    Ok(())
}

/// Where retained path notifications go.
#[async_trait(?Send)]
pub trait RetainedPublisher {
    async fn publish_retained(&self, topic: String, payload: Vec<u8>) -> Result<(), paho_mqtt::Error>;
}

#[async_trait(?Send)]
impl RetainedPublisher for AsyncClient {
    async fn publish_retained(&self, topic: String, payload: Vec<u8>) -> Result<(), paho_mqtt::Error> {
        self.publish(Message::new_retained(topic, payload, QOS_AT_LEAST_ONCE)).await
    }
}

/// Publishes each path on its own retained topic. A failed path is logged and the rest still go out.
/// Returns the paths that did not make it to the broker.
pub async fn publish_paths<P: RetainedPublisher>(
    client: &P,
    client_id: &str,
    device_instance: u32,
    paths: &[PathState],
) -> Vec<String> {
    let mut failed = Vec::new();

    for state in paths {
        let topic = notification_topic(client_id, device_instance, &state.path);
        let payload = match serde_json::to_vec(state) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Unable to serialize {}: {e}", state.path);
                continue;
            },
        };

        debug!("MQTT publish topic: '{topic}' payload: '{}'", String::from_utf8_lossy(&payload));

        if let Err(source) = client.publish_retained(topic, payload).await {
            error!("{}", PublicationError::Mqtt { path: state.path.clone(), source });
            failed.push(state.path.clone());
        }
    }

    failed
}

/// Publishes every changed path of `bus`. Paths that fail stay pending and go out with the next call.
pub async fn publish_changed<P: RetainedPublisher>(
    client: &P,
    client_id: &str,
    device_instance: u32,
    bus: &mut BusService,
) -> usize {
    let failed = publish_paths(client, client_id, device_instance, &bus.take_changed()).await;

    if !failed.is_empty() {
        warn!("{} paths left pending for the next publication", failed.len());
    }
    for path in &failed {
        bus.mark_changed(path);
    }

    failed.len()
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct WriteRequest {
    pub value: Value,
}

/// Splits an incoming write into the bus path and its new value.
pub fn parse_write(
    client_id: &str,
    device_instance: u32,
    topic: &str,
    payload: &[u8],
) -> Result<(String, Value), String> {
    let prefix = write_topic_prefix(client_id, device_instance);

    let path = topic
        .strip_prefix(&prefix)
        .filter(|path| path.starts_with('/'))
        .ok_or_else(|| format!("unexpected topic {topic}"))?;

    let request: WriteRequest =
        serde_json::from_slice(payload).map_err(|e| format!("bad payload on {topic}: {e}"))?;

    Ok((path.to_owned(), request.value))
}
