// Routing table: task name or backend id -> registered backend id.
// Copy-on-write snapshot so request-time resolves never take a lock.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::registry::BackendRegistry;
use crate::config::DEFAULT_ROUTE;
use crate::error::{GatewayError, GatewayResult};

pub struct RoutingPolicy {
    table: ArcSwap<HashMap<String, String>>,
    registry: Arc<BackendRegistry>,
}

impl RoutingPolicy {
    pub fn new(table: HashMap<String, String>, registry: Arc<BackendRegistry>) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            registry,
        }
    }

    /// Startup check: the default route must exist and name a registered backend.
    pub fn validate(&self) -> GatewayResult<()> {
        let table = self.table.load();
        match table.get(DEFAULT_ROUTE) {
            Some(backend) if self.registry.contains(backend) => {
                for (key, target) in table.iter() {
                    if !self.registry.contains(target) {
                        warn!("Route '{}' points at unregistered backend '{}'; it will fall back to default", key, target);
                    }
                }
                Ok(())
            }
            Some(backend) => Err(GatewayError::Config(format!(
                "default route points at unregistered backend '{}'",
                backend
            ))),
            None => Err(GatewayError::RoutingKeyUnresolvable(DEFAULT_ROUTE.to_string())),
        }
    }

    /// Explicit mapping, then the key as a literal backend id, then `default`.
    pub fn resolve(&self, routing_key: &str) -> GatewayResult<String> {
        let table = self.table.load();

        let candidate = table
            .get(routing_key)
            .map(String::as_str)
            .unwrap_or(routing_key);
        if self.registry.contains(candidate) {
            debug!("Routing key '{}' resolved to '{}'", routing_key, candidate);
            return Ok(candidate.to_string());
        }

        match table.get(DEFAULT_ROUTE) {
            Some(default) if self.registry.contains(default) => {
                debug!("Routing key '{}' fell back to default '{}'", routing_key, default);
                Ok(default.clone())
            }
            _ => Err(GatewayError::RoutingKeyUnresolvable(routing_key.to_string())),
        }
    }

    /// Adds or replaces a route; returns the previous target.
    pub fn add_route(&self, key: &str, backend_id: &str) -> Option<String> {
        if !self.registry.contains(backend_id) {
            warn!("Adding route '{}' to unregistered backend '{}'", key, backend_id);
        }
        let mut previous = None;
        self.table.rcu(|current| {
            let mut next = HashMap::clone(current);
            previous = next.insert(key.to_string(), backend_id.to_string());
            next
        });
        info!("Route '{}' -> '{}'", key, backend_id);
        previous
    }

    /// Removes a route. The default route cannot be removed.
    pub fn remove_route(&self, key: &str) -> GatewayResult<bool> {
        if key == DEFAULT_ROUTE {
            return Err(GatewayError::Config("the default route cannot be removed".into()));
        }
        let mut removed = false;
        self.table.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(key).is_some();
            next
        });
        if removed {
            info!("Removed route '{}'", key);
        }
        Ok(removed)
    }

    pub fn routes(&self) -> HashMap<String, String> {
        HashMap::clone(&self.table.load())
    }
}
