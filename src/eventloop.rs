use crate::{
    deye::{PassResult, SnapshotBuilder},
    solarman::Connector,
};
use std::future::Future;
use tokio::{
    sync::mpsc,
    time::{self, Duration},
};
use tracing::{debug, info, warn};

pub enum Message {
    Pass(PassResult),
    SignOfLife,
    MqttEvent(paho_mqtt::Message),
}

fn ticker(period: Duration) -> time::Interval {
    let mut timer = time::interval_at(time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    timer
}

pub fn mqtt_message_event_loop(
    mqtt_stream: paho_mqtt::AsyncReceiver<Option<paho_mqtt::Message>>,
    tx: mpsc::Sender<Message>,
) -> impl Future<Output = ()> {
    async move {
        loop {
            let Ok(event) = mqtt_stream.recv().await else {
                break;
            };

            match event {
                Some(event) => {
                    if tx.send(Message::MqttEvent(event)).await.is_err() {
                        break;
                    }
                },
                None => warn!("Lost connection to MQTT broker"),
            }
        }

        info!("Shutting down MQTT client");
    }
}

/// Runs one polling pass, then waits a full interval before the next one, however long the pass took.
pub fn poll_event_loop<C>(
    polling_interval: Duration,
    builder: SnapshotBuilder<C>,
    tx: mpsc::Sender<Message>,
) -> impl Future<Output = ()>
where
    C: Connector + 'static,
{
    async move {
        loop {
            time::sleep(polling_interval).await;

            let started = time::Instant::now();
            let pass = builder.build().await;
            debug!("Polling pass finished in {:?}", started.elapsed());

            if tx.send(Message::Pass(pass)).await.is_err() {
                break;
            }
        }

        info!("Shutting down poll timer");
    }
}

pub fn sign_of_life_event_loop(interval: Duration, tx: mpsc::Sender<Message>) -> impl Future<Output = ()> {
    let mut timer = ticker(interval);

    async move {
        loop {
            timer.tick().await;

            if tx.send(Message::SignOfLife).await.is_err() {
                break;
            }
        }

        info!("Shutting down sign of life timer");
    }
}
