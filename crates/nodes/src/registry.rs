//! Node type registry: maps a node's type tag to its executor.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::builtin;
use crate::traits::{NodeExecutor, NodeKind};
use crate::RegistryError;

/// Suffix that marks a type tag as a trigger even without a registered marker.
pub const TRIGGER_SUFFIX: &str = "_trigger";

/// Maps `node_type` strings to shared [`NodeExecutor`] implementations.
///
/// New node types are added with [`NodeRegistry::register`]; the scheduler
/// never needs to change.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in node types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for tag in ["manual_trigger", "webhook_trigger", "schedule_trigger", "gmail_trigger"] {
            registry.register_trigger(tag);
        }
        registry.register("condition", builtin::ConditionNode);
        registry.register("set", builtin::SetNode);
        registry.register("webhook", builtin::WebhookNode::new());
        registry.register("gmail_send_email", builtin::GmailSendNode::new());
        let calendar = Arc::new(builtin::CalendarCreateEventNode::new());
        registry.register_shared("google_calendar_create_event", calendar.clone());
        registry.register_shared("calendar_action", calendar);
        registry.register("slack_send_message", builtin::SlackSendNode::new());
        registry
    }

    /// Register (or replace) the executor for `node_type`.
    pub fn register(&mut self, node_type: impl Into<String>, executor: impl NodeExecutor + 'static) -> &mut Self {
        self.register_shared(node_type, Arc::new(executor))
    }

    pub fn register_shared(&mut self, node_type: impl Into<String>, executor: Arc<dyn NodeExecutor>) -> &mut Self {
        let node_type = node_type.into();
        debug!(node_type = %node_type, "registering node executor");
        self.executors.insert(node_type, executor);
        self
    }

    /// Register an entry-marker type.
    pub fn register_trigger(&mut self, node_type: impl Into<String>) -> &mut Self {
        self.register(node_type, builtin::TriggerNode)
    }

    pub fn get(&self, node_type: &str) -> Result<Arc<dyn NodeExecutor>, RegistryError> {
        self.executors
            .get(node_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownNodeType(node_type.to_owned()))
    }

    /// Role of a type tag, or `None` when the tag is unknown.
    pub fn kind(&self, node_type: &str) -> Option<NodeKind> {
        match self.executors.get(node_type) {
            Some(executor) => Some(executor.kind()),
            None if node_type.ends_with(TRIGGER_SUFFIX) => Some(NodeKind::Trigger),
            None => None,
        }
    }

    pub fn is_known(&self, node_type: &str) -> bool {
        self.kind(node_type).is_some()
    }

    pub fn is_trigger(&self, node_type: &str) -> bool {
        self.kind(node_type) == Some(NodeKind::Trigger)
    }

    /// Registered type tags, sorted.
    pub fn node_types(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("node_types", &self.node_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNode;
    use serde_json::json;

    #[test]
    fn builtins_are_classified() {
        let registry = NodeRegistry::with_builtins();
        assert_eq!(registry.kind("gmail_trigger"), Some(NodeKind::Trigger));
        assert_eq!(registry.kind("condition"), Some(NodeKind::Condition));
        assert_eq!(registry.kind("webhook"), Some(NodeKind::Action));
        assert_eq!(registry.kind("google_calendar_create_event"), Some(NodeKind::Action));
        assert_eq!(registry.kind("slack_send_message"), Some(NodeKind::Action));
        assert_eq!(
            registry.get("calendar_action").unwrap().required_fields(),
            ["calendar_id", "title", "start_time"]
        );
        assert_eq!(registry.kind("fax_machine"), None);
    }

    #[test]
    fn trigger_suffix_is_recognised_without_registration() {
        let registry = NodeRegistry::new();
        assert!(registry.is_trigger("outlook_trigger"));
        assert!(registry.get("outlook_trigger").is_err());
    }

    #[test]
    fn custom_types_register_without_touching_anything_else() {
        let mut registry = NodeRegistry::new();
        registry.register("crm_update", MockNode::returning("crm", json!({})));
        assert!(registry.is_known("crm_update"));
        assert!(matches!(
            registry.get("nope"),
            Err(RegistryError::UnknownNodeType(tag)) if tag == "nope"
        ));
    }
}
