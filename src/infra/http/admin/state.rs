use std::sync::Arc;

use crate::cache::{CacheMaintenance, ResponseCache};

#[derive(Clone)]
pub struct AdminState {
    pub cache: Arc<ResponseCache>,
    pub maintenance: Arc<CacheMaintenance>,
}

impl AdminState {
    pub fn new(maintenance: Arc<CacheMaintenance>) -> Self {
        Self {
            cache: maintenance.cache().clone(),
            maintenance,
        }
    }
}
