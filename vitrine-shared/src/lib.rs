pub mod models;
pub mod pii;

pub use models::events::ReservationEvent;
pub use models::reservation::{ProductReservation, ReservationStatus, UserIdentity};
pub use pii::Masked;
