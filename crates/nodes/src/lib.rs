//! `nodes` crate: the `NodeExecutor` trait, the node type registry and the
//! built-in node implementations.
//!
//! Every node type, built-in or integration, implements
//! [`NodeExecutor`] and is looked up by its type tag in a [`NodeRegistry`].
//! The engine crate dispatches execution through that trait object.

pub mod builtin;
pub mod credential;
pub mod error;
pub mod mock;
pub mod predicate;
pub mod registry;
pub mod traits;

pub use credential::{Credential, CredentialReference, CredentialResolver, MemoryCredentialResolver, ResolvedCredential};
pub use error::{CredentialError, ExecutorError, RegistryError};
pub use predicate::{EdgeCondition, Operator, Predicate};
pub use registry::NodeRegistry;
pub use traits::{ConfigIssue, NodeExecutor, NodeKind, Severity, StepContext, UpstreamResults};
