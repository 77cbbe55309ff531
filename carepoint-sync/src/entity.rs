//! Closed set of entity types the cache can hold.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Entity types known to the clinical client.
///
/// Each kind maps to its own cache table. The mapping is exhaustive, so an
/// unknown entity type cannot reach the store at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Patient,
    Encounter,
    Appointment,
    Order,
    Invoice,
}

impl EntityKind {
    /// Every kind, in schema-initialization order.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Patient,
        EntityKind::Encounter,
        EntityKind::Appointment,
        EntityKind::Order,
        EntityKind::Invoice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Patient => "patient",
            EntityKind::Encounter => "encounter",
            EntityKind::Appointment => "appointment",
            EntityKind::Order => "order",
            EntityKind::Invoice => "invoice",
        }
    }

    pub fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "patient" => Ok(EntityKind::Patient),
            "encounter" => Ok(EntityKind::Encounter),
            "appointment" => Ok(EntityKind::Appointment),
            "order" => Ok(EntityKind::Order),
            "invoice" => Ok(EntityKind::Invoice),
            _ => Err(SyncError::InvalidOperation(format!(
                "Unknown entity kind: {}",
                s
            ))),
        }
    }

    /// Backing cache table for this kind.
    pub fn cache_table(&self) -> &'static str {
        match self {
            EntityKind::Patient => "cache_patients",
            EntityKind::Encounter => "cache_encounters",
            EntityKind::Appointment => "cache_appointments",
            EntityKind::Order => "cache_orders",
            EntityKind::Invoice => "cache_invoices",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
