//! # Circuit Breaker Manager
//!
//! Hands out named circuit breakers for the router and event layer and
//! aggregates their metrics.

use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, SystemCircuitBreakerMetrics,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

const MAX_CIRCUIT_BREAKERS: usize = 256;

/// Manager for multiple circuit breakers across system components
#[derive(Debug)]
pub struct CircuitBreakerManager {
    circuit_breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,

    /// Configuration applied to components without an override
    default_config: CircuitBreakerConfig,

    component_configs: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        info!(
            failure_threshold = default_config.failure_threshold,
            "Initializing circuit breaker manager"
        );
        Self {
            circuit_breakers: RwLock::new(HashMap::new()),
            default_config,
            component_configs: HashMap::new(),
        }
    }

    /// Use a dedicated configuration for one component
    pub fn with_component_config(
        mut self,
        component_name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.component_configs.insert(component_name.into(), config);
        self
    }

    fn config_for_component(&self, component_name: &str) -> CircuitBreakerConfig {
        self.component_configs
            .get(component_name)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }

    /// Get or create circuit breaker for a component
    pub async fn get_circuit_breaker(&self, component_name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.circuit_breakers.read().await;
            if let Some(breaker) = breakers.get(component_name) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.circuit_breakers.write().await;

        // Double-check pattern (another task might have created it)
        if let Some(breaker) = breakers.get(component_name) {
            return Arc::clone(breaker);
        }

        if breakers.len() >= MAX_CIRCUIT_BREAKERS {
            warn!(
                component = component_name,
                current_count = breakers.len(),
                max_allowed = MAX_CIRCUIT_BREAKERS,
                "🚨 Circuit breaker count above expected maximum"
            );
        }

        let breaker = Arc::new(CircuitBreaker::new(
            component_name,
            self.config_for_component(component_name),
        ));
        breakers.insert(component_name.to_string(), Arc::clone(&breaker));

        info!(
            component = component_name,
            total_circuit_breakers = breakers.len(),
            "Created new circuit breaker"
        );

        breaker
    }

    pub async fn list_components(&self) -> Vec<String> {
        self.circuit_breakers.read().await.keys().cloned().collect()
    }

    /// Get system-wide circuit breaker metrics
    pub async fn get_system_metrics(&self) -> SystemCircuitBreakerMetrics {
        let mut system_metrics = SystemCircuitBreakerMetrics::default();

        let breakers = self.circuit_breakers.read().await;
        for (name, breaker) in breakers.iter() {
            let metrics = breaker.metrics().await;
            system_metrics.total_circuit_breakers += 1;
            system_metrics.total_calls += metrics.total_calls;
            system_metrics.total_failures += metrics.failure_count;
            match metrics.current_state {
                CircuitState::Open => system_metrics.open_circuit_breakers += 1,
                CircuitState::HalfOpen => system_metrics.half_open_circuit_breakers += 1,
                CircuitState::Closed => {}
            }
            system_metrics
                .circuit_breakers
                .insert(name.clone(), metrics);
        }

        system_metrics
    }

    /// Force close all circuit breakers (emergency recovery)
    pub async fn force_close_all(&self) {
        warn!("🚨 Forcing all circuit breakers closed");
        let breakers = self.circuit_breakers.read().await;
        for breaker in breakers.values() {
            breaker.force_closed().await;
        }
    }

    pub async fn remove_circuit_breaker(&self, component_name: &str) -> bool {
        self.circuit_breakers
            .write()
            .await
            .remove(component_name)
            .is_some()
    }

    pub async fn clear(&self) {
        self.circuit_breakers.write().await.clear();
    }
}
