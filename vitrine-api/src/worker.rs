use std::sync::Arc;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;
use vitrine_core::ChangeNotifier;
use vitrine_shared::ReservationEvent;

/// Builds the relay consumer. Every instance needs every event, so each one
/// joins under its own group id and starts from the live tail.
pub fn relay_consumer(brokers: &str, group_id: &str, topic: &str) -> Result<StreamConsumer, KafkaError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", format!("{}-{}", group_id, Uuid::new_v4()))
        .set("enable.auto.commit", "true")
        .set("auto.offset.reset", "latest")
        .create()?;

    consumer.subscribe(&[topic])?;
    Ok(consumer)
}

/// Feeds reservation events produced by any instance into the local
/// notifier until `shutdown` flips. Echoes of our own events are dropped by
/// the notifier's revision check.
pub async fn start_relay_worker(
    consumer: StreamConsumer,
    notifier: Arc<ChangeNotifier>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Reservation relay worker started");

    loop {
        tokio::select! {
            received = consumer.recv() => match received {
                Err(e) => error!("Kafka error: {}", e),
                Ok(m) => match m.payload_view::<str>() {
                    Some(Ok(payload)) => {
                        if let Err(e) = apply_relayed(&notifier, payload) {
                            error!("Discarding undecodable reservation event: {}", e);
                        }
                    }
                    Some(Err(e)) => error!("Error reading payload: {}", e),
                    None => debug!("Skipping empty relay message"),
                },
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Reservation relay worker stopped");
}

/// Returns how many local watchers received the event.
pub fn apply_relayed(notifier: &ChangeNotifier, payload: &str) -> Result<usize, serde_json::Error> {
    let event: ReservationEvent = serde_json::from_str(payload)?;
    debug!(product_id = %event.product_id, revision = event.revision, "Relayed reservation event");
    Ok(notifier.publish(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use vitrine_shared::{ProductReservation, UserIdentity};

    #[tokio::test]
    async fn test_relayed_events_reach_watchers_once() {
        let notifier = ChangeNotifier::new(16);
        let mut subscription = notifier.subscribe("p-1");

        let user = UserIdentity::new("u-1", "Alice", "alice@example.com");
        let record = ProductReservation::claim("p-1", &user, Utc::now(), Duration::minutes(10), None);
        let payload = serde_json::to_string(&ReservationEvent::from_record(&record, Utc::now())).unwrap();

        assert_eq!(apply_relayed(&notifier, &payload).unwrap(), 1);
        // Same revision again, as when our own event comes back from the topic
        assert_eq!(apply_relayed(&notifier, &payload).unwrap(), 0);

        let event = subscription.recv().await.unwrap();
        assert_eq!(event.revision, 1);
        assert_eq!(event.holder_name, "Alice");
    }

    #[test]
    fn test_rejects_garbage() {
        let notifier = ChangeNotifier::new(16);
        assert!(apply_relayed(&notifier, "not json").is_err());
    }
}
