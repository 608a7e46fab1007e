//! Chaincode events announcing repository writes.
//!
//! Names follow `{table}_{operation}` with an `_{owner}` suffix for models
//! that declare an owner field; the payload carries the affected id(s).

use crate::context::Context;
use crate::error::FabricError;
use serde_json::{Value, json};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Update,
    Delete,
    CreateAll,
    UpdateAll,
    DeleteAll,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::CreateAll => "createAll",
            EventKind::UpdateAll => "updateAll",
            EventKind::DeleteAll => "deleteAll",
        }
    }

    pub fn is_bulk(self) -> bool {
        matches!(
            self,
            EventKind::CreateAll | EventKind::UpdateAll | EventKind::DeleteAll
        )
    }
}

pub fn event_name(table: &str, kind: EventKind, owner: Option<&str>) -> String {
    match owner.filter(|o| !o.is_empty()) {
        Some(owner) => format!("{table}_{}_{owner}", kind.as_str()),
        None => format!("{table}_{}", kind.as_str()),
    }
}

/// `{"id": "a"}` for single writes, `{"id": ["a", "b"]}` for bulk ones.
pub fn event_payload(kind: EventKind, ids: &[String]) -> Value {
    if kind.is_bulk() {
        json!({ "id": ids })
    } else {
        json!({ "id": ids.first().cloned().unwrap_or_default() })
    }
}

pub fn emit(
    ctx: &Context,
    table: &str,
    kind: EventKind,
    owner: Option<&str>,
    ids: &[String],
) -> Result<(), FabricError> {
    let name = event_name(table, kind, owner);
    let payload = serde_json::to_vec(&event_payload(kind, ids))?;
    debug!(event = %name, ids = ids.len(), "emitting event");
    ctx.stub().set_event(&name, payload)
}
