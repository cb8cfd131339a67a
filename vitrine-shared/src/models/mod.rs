pub mod events;
pub mod reservation;
