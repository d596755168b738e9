use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobwright_core::{EventId, TenantKey};

/// A side-effect notification produced while a job runs.
///
/// The payload is opaque to the harness. `event_type` is a stable dotted name
/// (e.g. `"pool.modified"`) and `target` identifies the entity it concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    event_id: EventId,
    tenant: Option<TenantKey>,
    event_type: String,
    target: String,
    payload: JsonValue,
    occurred_at: DateTime<Utc>,
}

impl OutboundEvent {
    pub fn new(event_type: impl Into<String>, target: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            event_id: EventId::new(),
            tenant: None,
            event_type: event_type.into(),
            target: target.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// Attribute the event to a tenant.
    pub fn for_tenant(mut self, tenant: TenantKey) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn tenant(&self) -> Option<&TenantKey> {
        self.tenant.as_ref()
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
