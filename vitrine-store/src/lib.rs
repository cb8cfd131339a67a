pub mod app_config;
pub mod events;
pub mod redis_repo;
pub mod reservation_repo;

pub use events::EventProducer;
pub use redis_repo::RedisReservationStore;
pub use reservation_repo::PgReservationStore;
