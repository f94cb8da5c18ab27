mod bus;
mod config;
mod deye;
mod eventloop;
mod mqtt;
mod router;
mod solarman;

use anyhow::{Context, Result};
use bus::{BusService, DeviceIdentity};
use paho_mqtt::{AsyncClient, ConnectOptionsBuilder, CreateOptionsBuilder, PersistenceType, QOS_1};
use router::PublicationRouter;
use tokio::{
    select,
    sync::mpsc,
    time::{Duration, Instant},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| {
        if cfg!(debug_assertions) {
            "./deye2mqtt.yaml".to_owned()
        } else {
            "/etc/deye2mqtt.yaml".to_owned()
        }
    });

    let config = config::Config::load(&config_path).context("Failed to load configuration")?;
    let client_id = config.client_id.0.as_str();
    let inverter = &config.inverter;

    info!("Start");

    let mut bus = BusService::pvinverter(&DeviceIdentity {
        device_instance: inverter.device_instance,
        position: inverter.position,
        custom_name: inverter.custom_name.clone(),
        serial: inverter.serial.to_string(),
        firmware_version: inverter.firmware_version.clone(),
    });
    let mut router = PublicationRouter::new(inverter.phase);

    let mut mqtt_client = AsyncClient::new(
        CreateOptionsBuilder::new()
            .server_uri(format!(
                "tcp://{host}:{port}",
                host = config.broker,
                port = config.broker_port
            ))
            .client_id(client_id)
            .persistence(PersistenceType::None)
            .finalize(),
    )
    .context("Failed to create MQTT client")?;

    let mqtt_stream = mqtt_client.get_stream(128);

    mqtt_client
        .connect(
            ConnectOptionsBuilder::new()
                .automatic_reconnect(Duration::from_secs(2u64.pow(3)), Duration::from_secs(2u64.pow(12)))
                .max_inflight(128)
                .will_message(mqtt::offline_message(client_id))
                .finalize(),
        )
        .await
        .context("Failed to connect to MQTT broker")?;

    mqtt::announce_online(client_id, &mqtt_client)
        .await
        .context("Failed to announce online status")?;

    let pending = mqtt::publish_changed(&mqtt_client, client_id, inverter.device_instance, &mut bus).await;
    if pending > 0 {
        warn!("{pending} bus paths could not be registered yet");
    }

    mqtt_client
        .subscribe(mqtt::write_subscription(client_id, inverter.device_instance), QOS_1)
        .await
        .context("Failed to subscribe to write requests")?;

    info!("Registered {} on MQTT broker {}", bus.service_name(), config.broker);

    let (tx, mut rx) = mpsc::channel(8);

    let builder = deye::SnapshotBuilder::new(
        solarman::SolarmanConnector::new(inverter.request_timeout()),
        inverter.transport_params(),
        inverter.firmware_version.clone(),
    );
    tokio::spawn(eventloop::poll_event_loop(inverter.update_interval(), builder, tx.clone()));

    if let Some(interval) = inverter.sign_of_life_interval() {
        tokio::spawn(eventloop::sign_of_life_event_loop(interval, tx.clone()));
    }

    tokio::spawn(eventloop::mqtt_message_event_loop(mqtt_stream, tx));

    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = mqtt::announce_offline(client_id, &mqtt_client).await;
                break Ok(());
            },
            event = rx.recv() => match event {
                Some(eventloop::Message::Pass(pass)) => {
                    router.apply(&mut bus, &pass, Instant::now());
                    mqtt::publish_changed(&mqtt_client, client_id, inverter.device_instance, &mut bus).await;
                },
                Some(eventloop::Message::SignOfLife) => router.sign_of_life(&bus, Instant::now()).log(),
                Some(eventloop::Message::MqttEvent(msg)) => {
                    let write = mqtt::parse_write(client_id, inverter.device_instance, msg.topic(), msg.payload());
                    let (path, value) = match write {
                        Ok(write) => write,
                        Err(e) => {
                            warn!("MQTT write ignored: {e}");
                            continue;
                        },
                    };

                    if let Err(e) = bus.handle_external_write(&path, value) {
                        warn!("MQTT write rejected: {e}");
                        continue;
                    }

                    mqtt::publish_changed(&mqtt_client, client_id, inverter.device_instance, &mut bus).await;
                },
                None => {
                    error!("All event sources closed");
                    break Ok(());
                },
            }
        }
    }
}
