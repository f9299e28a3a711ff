//! # Consumer Configuration Module
//!
//! Static settings for one consumer endpoint: which broker endpoints to
//! connect to, which address/queue to subscribe to, and how the supervising
//! loop behaves (retry delay, active flag).
//!
//! Configurations are bound from a named section per endpoint identifier,
//! `amqp.<id_endpoint>`, using the `config` crate. The section key always
//! wins over any `id_endpoint` value stored inside the section.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, time::Duration};
use zeroize::Zeroizing;

/// Name of the configuration section holding one sub-section per endpoint
pub const CONFIGURATION_SECTION: &str = "amqp";

/// Default values applied to fields missing from a configuration section
pub mod defaults {
    use super::RoutingType;

    pub const RETRY_TIME_MS: u64 = 5000;
    pub const IS_ACTIVE: bool = true;
    pub const ROUTING_TYPE: RoutingType = RoutingType::Anycast;
    pub const CREDIT: u32 = 200;
    pub const DURABLE: bool = false;
    pub const NO_LOCAL_FILTER: bool = false;
    pub const SHARED: bool = false;
}

// ============================================================================
// Core Configuration Types
// ============================================================================

/// How the broker distributes messages sent to an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingType {
    /// Each message goes to exactly one consumer of the queue
    #[default]
    Anycast,
    /// Each queue bound to the address receives its own copy
    Multicast,
}

/// Connection target as written in configuration
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointDescriptor {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl EndpointDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
            password: None,
        }
    }

    /// Add credentials
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }
}

impl fmt::Debug for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Complete consumer configuration for one endpoint identifier
///
/// Immutable once handed to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfiguration {
    /// Stable identity used for logging and section lookup; unique per session
    pub id_endpoint: String,

    /// Delay in milliseconds before the supervising loop retries after a failure
    pub retry_time: u64,

    /// Inactive consumers never start their supervising loop
    pub is_active: bool,

    pub address: Option<String>,
    pub queue: Option<String>,
    pub routing_type: RoutingType,

    /// Maximum number of unsettled messages the broker may hand out at once
    pub credit: u32,

    pub durable: bool,
    pub filter_expression: Option<String>,
    pub no_local_filter: bool,
    pub shared: bool,

    /// Broker endpoints; failover between them is the connection provider's job
    pub endpoints: Vec<EndpointDescriptor>,
}

impl Default for ConsumerConfiguration {
    fn default() -> Self {
        Self {
            id_endpoint: String::new(),
            retry_time: defaults::RETRY_TIME_MS,
            is_active: defaults::IS_ACTIVE,
            address: None,
            queue: None,
            routing_type: defaults::ROUTING_TYPE,
            credit: defaults::CREDIT,
            durable: defaults::DURABLE,
            filter_expression: None,
            no_local_filter: defaults::NO_LOCAL_FILTER,
            shared: defaults::SHARED,
            endpoints: Vec::new(),
        }
    }
}

impl ConsumerConfiguration {
    /// Create configuration with defaults for the given endpoint identifier
    pub fn new(id_endpoint: impl Into<String>) -> Self {
        Self {
            id_endpoint: id_endpoint.into(),
            ..Default::default()
        }
    }

    /// Bind the `amqp.<id_endpoint>` section of an already built configuration
    ///
    /// # Errors
    /// - `ConfigurationError::NotFound` - No section exists for `id_endpoint`
    /// - `ConfigurationError::Parsing` - The section cannot be deserialized
    pub fn from_config(config: &config::Config, id_endpoint: &str) -> Result<Self, ConfigurationError> {
        let not_found = || ConfigurationError::NotFound {
            id_endpoint: id_endpoint.to_string(),
        };

        let sections = match config.get_table(CONFIGURATION_SECTION) {
            Ok(sections) => sections,
            Err(config::ConfigError::NotFound(_)) => return Err(not_found()),
            Err(e) => {
                return Err(ConfigurationError::Parsing {
                    message: format!("Section '{}' is not a table: {}", CONFIGURATION_SECTION, e),
                })
            }
        };

        // Some sources fold keys to lower case, so fall back to a case-insensitive match
        let section = sections
            .get(id_endpoint)
            .or_else(|| {
                sections
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(id_endpoint))
                    .map(|(_, value)| value)
            })
            .cloned()
            .ok_or_else(not_found)?;

        let mut configuration: ConsumerConfiguration =
            section
                .try_deserialize()
                .map_err(|e| ConfigurationError::Parsing {
                    message: format!("Invalid section for endpoint {}: {}", id_endpoint, e),
                })?;

        configuration.id_endpoint = id_endpoint.to_string();
        Ok(configuration)
    }

    /// Load a configuration file (format chosen by extension) and bind one section
    pub fn load_from_file(path: &Path, id_endpoint: &str) -> Result<Self, ConfigurationError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: format!("Failed to read {}: {}", path.display(), e),
            })?;

        Self::from_config(&config, id_endpoint)
    }

    /// Validate configuration structure and constraints
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut errors = Vec::new();

        if self.id_endpoint.trim().is_empty() {
            errors.push("id_endpoint must not be empty".to_string());
        }

        if self.address.as_deref().map_or(true, |a| a.trim().is_empty()) {
            errors.push(format!("Endpoint '{}': address is required", self.id_endpoint));
        }

        if self.credit == 0 {
            errors.push(format!("Endpoint '{}': credit must be positive", self.id_endpoint));
        }

        if self.endpoints.is_empty() {
            errors.push(format!(
                "Endpoint '{}': at least one broker endpoint is required",
                self.id_endpoint
            ));
        }

        for descriptor in &self.endpoints {
            if let Err(e) = Endpoint::from_descriptor(descriptor) {
                errors.push(format!("Endpoint '{}': {}", self.id_endpoint, e));
            }
        }

        if !errors.is_empty() {
            return Err(ConfigurationError::Invalid {
                message: errors.join("; "),
            });
        }

        Ok(())
    }

    /// Retry delay as a `Duration`
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_time)
    }

    /// Resolve the configured descriptors into provider-level endpoints
    pub fn resolve_endpoints(&self) -> Result<Vec<Endpoint>, ConfigurationError> {
        if self.endpoints.is_empty() {
            return Err(ConfigurationError::Invalid {
                message: format!("Endpoint '{}' has no broker endpoints", self.id_endpoint),
            });
        }

        self.endpoints.iter().map(Endpoint::from_descriptor).collect()
    }

    /// Subscription parameters requested from the broker connection
    pub fn subscription_settings(&self) -> Result<SubscriptionSettings, ConfigurationError> {
        let address = self
            .address
            .clone()
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| ConfigurationError::Invalid {
                message: format!("Endpoint '{}' has no address", self.id_endpoint),
            })?;

        Ok(SubscriptionSettings {
            address,
            queue: self.queue.clone(),
            routing_type: self.routing_type,
            credit: self.credit,
            durable: self.durable,
            filter_expression: self.filter_expression.clone(),
            no_local_filter: self.no_local_filter,
            shared: self.shared,
        })
    }
}

// ============================================================================
// Provider-level Types
// ============================================================================

/// Validated broker endpoint handed to a connection provider
#[derive(Clone)]
pub struct Endpoint {
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<Zeroizing<String>>,
}

impl Endpoint {
    /// Create endpoint with validation
    pub fn create(
        host: &str,
        port: u16,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, ConfigurationError> {
        if host.trim().is_empty() {
            return Err(ConfigurationError::Invalid {
                message: "endpoint host must not be empty".to_string(),
            });
        }

        if port == 0 {
            return Err(ConfigurationError::Invalid {
                message: format!("endpoint {} has port 0", host),
            });
        }

        Ok(Self {
            host: host.to_string(),
            port,
            user: user.map(str::to_string),
            password: password.map(|p| Zeroizing::new(p.to_string())),
        })
    }

    pub fn from_descriptor(descriptor: &EndpointDescriptor) -> Result<Self, ConfigurationError> {
        Self::create(
            &descriptor.host,
            descriptor.port,
            descriptor.user.as_deref(),
            descriptor.password.as_deref(),
        )
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Get password (only for immediate use by the transport)
    pub fn expose_password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.as_str())
    }

    /// Connection URL without credentials, safe to log
    pub fn url(&self) -> String {
        format!("amqp://{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url())
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Parameters of a subscription request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSettings {
    pub address: String,
    pub queue: Option<String>,
    pub routing_type: RoutingType,
    pub credit: u32,
    pub durable: bool,
    pub filter_expression: Option<String>,
    pub no_local_filter: bool,
    pub shared: bool,
}

impl SubscriptionSettings {
    /// Name of the broker queue the subscription reads from
    ///
    /// Falls back to the address when no explicit queue is configured.
    pub fn queue_name(&self) -> &str {
        self.queue.as_deref().unwrap_or(&self.address)
    }
}

#[cfg(test)]
#[path = "configuration_tests.rs"]
mod tests;
