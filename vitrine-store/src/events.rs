use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{debug, error};
use vitrine_core::EventRelay;
use vitrine_shared::ReservationEvent;

/// Mirrors reservation events to Kafka so watchers attached to other
/// instances hear about them. Keyed by product id to keep one product's
/// events on one partition.
#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
    topic: String,
}

impl EventProducer {
    pub fn new(brokers: &str, topic: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl EventRelay for EventProducer {
    fn relay(&self, event: &ReservationEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(product_id = %event.product_id, "Failed to encode reservation event: {}", e);
                return;
            }
        };

        let record = FutureRecord::to(&self.topic)
            .key(&event.product_id)
            .payload(&payload);

        // Enqueue now so produce order follows publish order; only the
        // delivery report is awaited off the write path.
        let delivery = match self.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((e, _record)) => {
                error!(topic = %self.topic, product_id = %event.product_id, "Failed to enqueue reservation event: {}", e);
                return;
            }
        };

        let topic = self.topic.clone();
        let product_id = event.product_id.clone();
        tokio::spawn(async move {
            match delivery.await {
                Ok(Ok(delivery)) => {
                    debug!(
                        "Sent reservation event to {}/{}: partition {} offset {}",
                        topic, product_id, delivery.partition, delivery.offset
                    );
                }
                Ok(Err((e, _msg))) => {
                    error!("Failed to send reservation event to {}: {}", topic, e);
                }
                Err(_canceled) => {
                    error!("Reservation event delivery to {} was canceled", topic);
                }
            }
        });
    }
}
