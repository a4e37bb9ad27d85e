//! # HTTP Server Module
//!
//! Server assembly: build the provider registry from configuration, start
//! the metrics collector, health monitor, and alerting system on their own
//! tasks, wire the manager, and hang the route table plus middleware off an
//! axum `Router`.
//!
//! Component wiring follows one rule: everything is an explicit dependency
//! injected here. The event bus is the only channel between the manager
//! and its observers, so none of them hold references to each other.

use crate::alerts::AlertingSystem;
use crate::config::Config;
use crate::events::EventBus;
use crate::handlers;
use crate::health::HealthMonitor;
use crate::manager::ProviderManager;
use crate::metrics::MetricsCollector;
use crate::registry::ProviderRegistry;
use axum::routing::{get, patch, post};
use axum::Router;
use dreamweave_providers::providers::ProviderSettings;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<ProviderManager>,
    pub registry: Arc<ProviderRegistry>,
    pub metrics: Arc<MetricsCollector>,
    pub alerts: Arc<AlertingSystem>,
    pub health: Arc<HealthMonitor>,
}

/// Create the HTTP application with all components running.
pub async fn create_server(mut config: Config) -> anyhow::Result<Router> {
    // A bare development run gets a local Ollama provider.
    if config.providers.is_empty() {
        tracing::warn!("no providers configured, adding local ollama");
        config
            .providers
            .insert("ollama".to_string(), ProviderSettings::new("ollama", ""));
    }

    let config = Arc::new(config);
    let registry = Arc::new(ProviderRegistry::from_config(&config)?);
    let events = EventBus::new();
    let metrics = MetricsCollector::start(config.metrics.clone());

    let health = HealthMonitor::new(
        Arc::clone(&registry),
        events.clone(),
        config.health.clone(),
        config.circuit.cooldown,
    );
    health.spawn();

    let alerts = AlertingSystem::new(
        config.alerts.clone(),
        Arc::clone(&registry),
        Arc::clone(&metrics),
    );
    alerts.spawn(&events);

    let manager = Arc::new(ProviderManager::new(
        Arc::clone(&registry),
        Arc::clone(&metrics),
        events.clone(),
        &config,
    ));

    let state = AppState {
        config: Arc::clone(&config),
        manager,
        registry,
        metrics,
        alerts,
        health,
    };

    let app = Router::new()
        // Generation
        .route("/api/parse-dream", post(handlers::parse_dream))
        // Health
        .route("/health", get(handlers::health))
        .route("/health/detailed", get(handlers::health_detailed))
        .route("/health/provider/{name}", get(handlers::health_provider))
        .route("/health/check", post(handlers::health_check))
        // Monitoring
        .route("/monitoring/dashboard", get(handlers::monitoring_dashboard))
        .route("/monitoring/realtime", get(handlers::monitoring_realtime))
        .route(
            "/monitoring/performance",
            get(handlers::monitoring_performance),
        )
        .route("/monitoring/alerts", get(handlers::monitoring_alerts))
        // Admin
        .route("/admin/providers", get(handlers::admin_providers))
        .route(
            "/admin/providers/{name}",
            patch(handlers::admin_provider_patch),
        )
        .route("/admin/config", get(handlers::admin_config))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(config.server.timeout))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state);

    Ok(app)
}
