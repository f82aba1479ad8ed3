use std::sync::Arc;
use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use crate::mapping::engine::Mapping;
use crate::ssdp::registry::ServiceRegistry;
use shared::protocol::API_PREFIX;
use shared::types::{DiscoveredService, MappingStatus};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ServiceRegistry>,
    pub mapping: Arc<Mapping>,
}

#[derive(Deserialize)]
pub struct ServiceQuery {
    #[serde(rename = "type")]
    pub service_type: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&format!("{API_PREFIX}/services"), get(get_services))
        .route(&format!("{API_PREFIX}/mapping"), get(get_mapping))
        .with_state(state)
}

async fn get_services(
    State(state): State<AppState>,
    Query(params): Query<ServiceQuery>,
) -> Json<Vec<DiscoveredService>> {
    let services = match params.service_type {
        Some(service_type) => state.registry.services_by_type(&service_type),
        None => state.registry.all_services(),
    };
    Json(services)
}

async fn get_mapping(State(state): State<AppState>) -> Json<MappingStatus> {
    Json(state.mapping.status())
}
