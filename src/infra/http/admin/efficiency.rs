use axum::{Json, extract::State};

use crate::cache::{EfficiencyReport, MonitoringStatus};

use super::AdminState;

pub(super) async fn report(State(state): State<AdminState>) -> Json<EfficiencyReport> {
    Json(state.cache.monitor().generate_report().await)
}

pub(super) async fn status(State(state): State<AdminState>) -> Json<MonitoringStatus> {
    Json(state.cache.monitor().status())
}
