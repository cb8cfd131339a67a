use std::sync::Arc;
use vitrine_core::identity::IdentityResolver;
use vitrine_core::ReservationManager;

use crate::metrics::ReservationMetrics;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ReservationManager>,
    pub identity: Arc<dyn IdentityResolver>,
    pub metrics: Arc<ReservationMetrics>,
}
