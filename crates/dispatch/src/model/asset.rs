//! Asset: one target device under inventory collection

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Credentials for the asset's management controller
///
/// The password is never printed through `Debug`.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BmcCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BmcCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BmcCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A device whose inventory is being collected
///
/// Constructed by an asset source or from an event's parameters, then mutated
/// in place by the collector. Each in-flight unit of work owns its own
/// instance; assets are never shared for concurrent mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Asset {
    /// Asset identifier in the inventory store
    pub id: Uuid,

    /// Facility (site) code the asset lives in
    pub facility: String,

    /// Management controller address (out-of-band collection)
    #[serde(default)]
    pub bmc_address: Option<String>,

    /// Management controller credentials, only present when requested
    #[serde(default, skip_serializing)]
    pub credentials: Option<BmcCredentials>,

    #[serde(default)]
    pub vendor: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub serial: Option<String>,

    /// Partial failures accumulated during collection
    #[serde(default)]
    pub errors: Vec<String>,

    /// Collected hardware inventory
    #[serde(default)]
    pub inventory: Option<serde_json::Value>,

    /// Collected BIOS configuration
    #[serde(default)]
    pub bios_configuration: Option<serde_json::Value>,
}

impl Asset {
    /// Create an asset with only its identity populated
    pub fn new(id: Uuid, facility: impl Into<String>) -> Self {
        Self {
            id,
            facility: facility.into(),
            ..Default::default()
        }
    }

    /// Set the management controller address
    pub fn with_bmc_address(mut self, address: impl Into<String>) -> Self {
        self.bmc_address = Some(address.into());
        self
    }

    /// Set the management controller credentials
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(BmcCredentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Set vendor and model
    pub fn with_hardware(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self.model = Some(model.into());
        self
    }

    /// An asset without an identifier carries no work
    pub fn is_empty(&self) -> bool {
        self.id.is_nil()
    }

    /// Record a partial collection failure
    pub fn push_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Vendor label for metrics ("unknown" until discovered)
    pub fn vendor_label(&self) -> &str {
        self.vendor.as_deref().unwrap_or("unknown")
    }

    /// Model label for metrics ("unknown" until discovered)
    pub fn model_label(&self) -> &str {
        self.model.as_deref().unwrap_or("unknown")
    }
}
