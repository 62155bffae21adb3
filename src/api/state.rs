use crate::detect::engine::DetectionEngine;
use crate::storage::Pool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub engine: Arc<DetectionEngine>,
}
