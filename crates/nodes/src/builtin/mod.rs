//! Built-in node types.
//!
//! Registered by [`NodeRegistry::with_builtins`](crate::NodeRegistry::with_builtins).

mod calendar;
mod condition;
mod gmail;
mod set;
mod slack;
mod trigger;
mod webhook;

pub use calendar::CalendarCreateEventNode;
pub use condition::ConditionNode;
pub use gmail::GmailSendNode;
pub use set::SetNode;
pub use slack::SlackSendNode;
pub use trigger::TriggerNode;
pub use webhook::WebhookNode;
