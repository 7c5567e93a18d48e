//! Service registry: which tool services exist and which are enabled
//!
//! Mutated from enable/disable calls while routes read it concurrently.
//! All synchronization is internal; callers never hold a lock.

use dashmap::DashMap;
use portico_core::HostedService;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::GatewayError;

/// Public view of one registered service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRegistration {
    pub name: String,
    pub enabled: bool,
    pub description: String,
}

struct Entry {
    registration: ServiceRegistration,
    service: HostedService,
}

/// First path segments the gateway serves itself
const RESERVED_NAMES: &[&str] = &["admin", "health"];

/// Registry of hosted services keyed by unique name
#[derive(Default)]
pub struct ServiceRegistry {
    entries: DashMap<String, Entry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under a unique name
    pub fn register(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        service: HostedService,
        enabled: bool,
    ) -> Result<(), GatewayError> {
        let name = name.into();
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(GatewayError::BadRequest(format!(
                "'{}' is a reserved gateway path and cannot name a service",
                name
            )));
        }
        match self.entries.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(GatewayError::DuplicateService(name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!("Registering service: {} (enabled: {})", name, enabled);
                slot.insert(Entry {
                    registration: ServiceRegistration {
                        name,
                        enabled,
                        description: description.into(),
                    },
                    service,
                });
                Ok(())
            }
        }
    }

    /// Flip a service's enabled flag; takes effect on the next request
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), GatewayError> {
        let mut entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| GatewayError::UnknownService(name.to_string()))?;
        if entry.registration.enabled != enabled {
            entry.registration.enabled = enabled;
            info!(
                "Service '{}' {}",
                name,
                if enabled { "enabled" } else { "disabled" }
            );
        }
        Ok(())
    }

    pub fn enable(&self, name: &str) -> Result<(), GatewayError> {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> Result<(), GatewayError> {
        self.set_enabled(name, false)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .is_some_and(|e| e.registration.enabled)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Look up a service for routing; disabled services are refused
    pub fn resolve(&self, name: &str) -> Result<HostedService, GatewayError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| GatewayError::UnknownService(name.to_string()))?;
        if !entry.registration.enabled {
            return Err(GatewayError::ServiceDisabled(name.to_string()));
        }
        Ok(entry.service.clone())
    }

    /// All registrations, sorted by name
    pub fn list(&self) -> Vec<ServiceRegistration> {
        let mut list: Vec<ServiceRegistration> = self
            .entries
            .iter()
            .map(|e| e.registration.clone())
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Enabled registrations only, sorted by name
    pub fn enabled(&self) -> Vec<ServiceRegistration> {
        self.list().into_iter().filter(|r| r.enabled).collect()
    }

    /// Every hosted service regardless of state (for lifecycle hooks)
    pub fn services(&self) -> Vec<(String, HostedService)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.service.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
