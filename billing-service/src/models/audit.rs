//! Audit trail input.

use serde_json::Value;

/// One audit entry, written in the same transaction as the mutation it
/// describes. The actor is always explicit; webhook-triggered mutations use
/// a synthesized `provider:<name>` actor.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub actor: String,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
}

impl AuditRecord {
    pub fn new(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            resource_type: None,
            resource_id: None,
            before_state: None,
            after_state: None,
        }
    }

    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl ToString) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.to_string());
        self
    }

    pub fn before(mut self, state: Value) -> Self {
        self.before_state = Some(state);
        self
    }

    pub fn after(mut self, state: Value) -> Self {
        self.after_state = Some(state);
        self
    }
}
