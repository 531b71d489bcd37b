// Lightweight-broker backend over MQTT, QoS 1. The client's event loop
// must be polled continuously for the session to make progress; a
// dedicated task does that and applies the configured disconnect policy.
use anyhow::Result;
use async_trait::async_trait;
use fleetline_pipeline::{Producer, ProducerError, Record, ReliableAckHandle, report_error};
use fleetline_wire::wire_topic_name;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::config::{DisconnectPolicy, MqttSection};

use super::{AdapterOptions, MQTT, PublishQueue};

pub struct MqttProducer {
    queue: PublishQueue,
    client: AsyncClient,
    poll_cancel: watch::Sender<bool>,
}

impl MqttProducer {
    pub fn connect(
        section: &MqttSection,
        options: &AdapterOptions,
        ack: ReliableAckHandle,
    ) -> Result<Self> {
        let mut mqtt_options =
            MqttOptions::new(section.client_id.clone(), section.host.clone(), section.port);
        if let (Some(username), Some(password)) = (&section.username, &section.password) {
            mqtt_options.set_credentials(username.clone(), password.clone());
        }
        let (client, event_loop) = AsyncClient::new(mqtt_options, options.queue_depth.max(16));

        let (poll_cancel, poll_cancel_rx) = watch::channel(false);
        tokio::spawn(run_event_loop(
            event_loop,
            section.on_disconnect,
            poll_cancel_rx,
        ));

        let (tx, rx) = PublishQueue::channel(options.queue_depth);
        let depth = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(run_worker(
            client.clone(),
            rx,
            ack,
            options.namespace.clone(),
            Arc::clone(&depth),
        ));
        Ok(Self {
            queue: PublishQueue::new(MQTT, tx, depth, options.publish_timeout, worker),
            client,
            poll_cancel,
        })
    }
}

#[async_trait]
impl Producer for MqttProducer {
    fn name(&self) -> &str {
        MQTT
    }

    async fn publish(&self, record: &Record) -> Result<(), ProducerError> {
        self.queue.submit(record).await
    }

    async fn close(&self, deadline: Duration) -> Result<(), ProducerError> {
        let result = self.queue.close(deadline).await;
        let _ = self.client.disconnect().await;
        let _ = self.poll_cancel.send(true);
        result
    }
}

pub(crate) fn topic_for(namespace: &str, record: &Record) -> String {
    format!(
        "{namespace}/{}/{}",
        record.identity.device_id(),
        wire_topic_name(&record.type_tag)
    )
}

// The session drops whenever the broker goes away; rumqttc reconnects on
// the next poll. Whether that is routine or reportable is configured.
async fn run_event_loop(
    mut event_loop: rumqttc::EventLoop,
    policy: DisconnectPolicy,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            event = event_loop.poll() => {
                if let Err(err) = event {
                    match policy {
                        DisconnectPolicy::Reconnect => {
                            tracing::warn!(error = %err, "mqtt session dropped, reconnecting");
                        }
                        DisconnectPolicy::Error => {
                            report_error(MQTT, "session", &err);
                        }
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

async fn run_worker(
    client: AsyncClient,
    mut rx: mpsc::Receiver<Record>,
    ack: ReliableAckHandle,
    namespace: String,
    depth: Arc<AtomicUsize>,
) {
    while let Some(record) = rx.recv().await {
        depth.fetch_sub(1, Ordering::AcqRel);
        let topic = topic_for(&namespace, &record);
        match client
            .publish(topic, QoS::AtLeastOnce, false, record.payload.to_vec())
            .await
        {
            Ok(()) => ack.signal(&record),
            Err(err) => report_error(MQTT, "publish", &err),
        }
    }
}
