use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;
use vitrine_core::{CasOutcome, ReservationStore, StoreError};
use vitrine_shared::ProductReservation;

const ACTIVE_SET: &str = "reservations:active";

// KEYS[1] = reservation hash, KEYS[2] = active set
// ARGV: expected id ('' = must be absent), expected rev, new id, new rev, body, status, product id
const PUT_SCRIPT: &str = r#"
    local current_id = redis.call("HGET", KEYS[1], "id")
    if ARGV[1] == "" then
        if current_id then
            return {0, redis.call("HGET", KEYS[1], "body") or ""}
        end
    elseif current_id ~= ARGV[1] or redis.call("HGET", KEYS[1], "rev") ~= ARGV[2] then
        return {0, redis.call("HGET", KEYS[1], "body") or ""}
    end
    redis.call("HSET", KEYS[1], "id", ARGV[3], "rev", ARGV[4], "body", ARGV[5])
    if ARGV[6] == "active" then
        redis.call("SADD", KEYS[2], ARGV[7])
    else
        redis.call("SREM", KEYS[2], ARGV[7])
    end
    return {1, ""}
"#;

// KEYS as above; ARGV: expected id, expected rev, product id
const DELETE_SCRIPT: &str = r#"
    local current_id = redis.call("HGET", KEYS[1], "id")
    if current_id ~= ARGV[1] or redis.call("HGET", KEYS[1], "rev") ~= ARGV[2] then
        return {0, redis.call("HGET", KEYS[1], "body") or ""}
    end
    redis.call("DEL", KEYS[1])
    redis.call("SREM", KEYS[2], ARGV[3])
    return {1, ""}
"#;

/// Redis-backed store. Each product is a hash holding the record's id,
/// revision and JSON body; the compare and the write run in one Lua script.
#[derive(Clone)]
pub struct RedisReservationStore {
    client: redis::Client,
}

impl RedisReservationStore {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)
    }

    fn interpret(product_id: &str, (applied, body): (i64, String)) -> Result<CasOutcome, StoreError> {
        if applied == 1 {
            return Ok(CasOutcome::Applied);
        }
        let current = if body.is_empty() {
            None
        } else {
            Some(decode(product_id, &body)?)
        };
        debug!(product_id, "Conditional write rejected by redis");
        Ok(CasOutcome::Conflict { current })
    }
}

fn key(product_id: &str) -> String {
    format!("reservation:{}", product_id)
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn decode(product_id: &str, body: &str) -> Result<ProductReservation, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError::Corrupt {
        product_id: product_id.to_string(),
        reason: e.to_string(),
    })
}

fn encode(record: &ProductReservation) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|e| StoreError::Corrupt {
        product_id: record.product_id.clone(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl ReservationStore for RedisReservationStore {
    async fn get(&self, product_id: &str) -> Result<Option<ProductReservation>, StoreError> {
        let mut conn = self.connection().await?;
        let body: Option<String> = conn.hget(key(product_id), "body").await.map_err(unavailable)?;
        body.map(|b| decode(product_id, &b)).transpose()
    }

    async fn conditional_put(
        &self,
        product_id: &str,
        record: &ProductReservation,
        expected: Option<&ProductReservation>,
    ) -> Result<CasOutcome, StoreError> {
        let mut conn = self.connection().await?;
        let (expected_id, expected_rev) = match expected {
            Some(e) => (e.id.to_string(), e.revision.to_string()),
            None => (String::new(), String::new()),
        };

        let reply: (i64, String) = redis::Script::new(PUT_SCRIPT)
            .key(key(product_id))
            .key(ACTIVE_SET)
            .arg(expected_id)
            .arg(expected_rev)
            .arg(record.id.to_string())
            .arg(record.revision.to_string())
            .arg(encode(record)?)
            .arg(record.status.as_str())
            .arg(product_id)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Self::interpret(product_id, reply)
    }

    async fn conditional_delete(
        &self,
        product_id: &str,
        expected: &ProductReservation,
    ) -> Result<CasOutcome, StoreError> {
        let mut conn = self.connection().await?;
        let reply: (i64, String) = redis::Script::new(DELETE_SCRIPT)
            .key(key(product_id))
            .key(ACTIVE_SET)
            .arg(expected.id.to_string())
            .arg(expected.revision.to_string())
            .arg(product_id)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Self::interpret(product_id, reply)
    }

    async fn list_active(&self) -> Result<Vec<ProductReservation>, StoreError> {
        let mut conn = self.connection().await?;
        let product_ids: Vec<String> = conn.smembers(ACTIVE_SET).await.map_err(unavailable)?;
        if product_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for product_id in &product_ids {
            pipe.hget(key(product_id), "body");
        }
        let bodies: Vec<Option<String>> = pipe.query_async(&mut conn).await.map_err(unavailable)?;

        let mut active = Vec::with_capacity(bodies.len());
        for (product_id, body) in product_ids.iter().zip(bodies) {
            // The set can trail a concurrent transition; the body is authoritative.
            if let Some(body) = body {
                let record = decode(product_id, &body)?;
                if record.is_active() {
                    active.push(record);
                }
            }
        }
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use vitrine_shared::UserIdentity;

    #[test]
    fn test_interpret_replies() {
        let user = UserIdentity::new("u-1", "Alice", "alice@example.com");
        let record = ProductReservation::claim("p-1", &user, Utc::now(), Duration::minutes(10), None);
        let body = encode(&record).unwrap();

        assert_eq!(
            RedisReservationStore::interpret("p-1", (1, String::new())).unwrap(),
            CasOutcome::Applied
        );
        assert_eq!(
            RedisReservationStore::interpret("p-1", (0, body)).unwrap(),
            CasOutcome::Conflict { current: Some(record) }
        );
        assert_eq!(
            RedisReservationStore::interpret("p-1", (0, String::new())).unwrap(),
            CasOutcome::Conflict { current: None }
        );
        assert!(matches!(
            RedisReservationStore::interpret("p-1", (0, "{".to_string())),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_body_keeps_holder_email() {
        let user = UserIdentity::new("u-1", "Alice", "alice@example.com");
        let record = ProductReservation::claim("p-1", &user, Utc::now(), Duration::minutes(10), None);
        let body = encode(&record).unwrap();
        assert!(body.contains("alice@example.com"));
        assert_eq!(decode("p-1", &body).unwrap(), record);
    }
}
