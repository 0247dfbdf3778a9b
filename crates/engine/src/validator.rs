//! Static flow validation.
//!
//! [`validate`] inspects a flow without side effects and returns every issue
//! it finds. Persisting the issues (and reconciling them with earlier passes
//! via [`reconcile`]) is the caller's job.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use nodes::{Credential, CredentialReference, NodeKind, NodeRegistry, Severity};

use crate::error::GraphError;
use crate::graph::Graph;
use crate::models::{Flow, ValidationIssue};

/// Issue type tags, as stored in `validation_issues.issue_type`.
pub mod issue_type {
    pub const NO_NODES: &str = "no_nodes";
    pub const NO_TRIGGER: &str = "no_trigger";
    pub const INVALID_GRAPH: &str = "invalid_graph";
    pub const UNKNOWN_NODE_TYPE: &str = "unknown_node_type";
    pub const INVALID_CONFIG: &str = "invalid_config";
    pub const ORPHAN_NODE: &str = "orphan_node";
    pub const CYCLE: &str = "cycle";
    pub const UNDEFINED_CONDITION_FIELD: &str = "undefined_condition_field";
    pub const UNRESOLVED_CREDENTIAL: &str = "unresolved_credential";
}

/// Run every check against `flow`.
///
/// `credentials` are the credentials available to the flow's owner; `now`
/// decides which of them have expired.
pub fn validate(
    flow: &Flow,
    registry: &NodeRegistry,
    credentials: &[Credential],
    now: DateTime<Utc>,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if flow.nodes.is_empty() {
        issues.push(
            ValidationIssue::new(flow.id, Severity::Error, issue_type::NO_NODES, "Flow has no nodes")
                .fix("Add a trigger node to start the flow"),
        );
        return issues;
    }

    // Without a well-formed graph none of the path-based checks mean anything.
    let graph = match Graph::from_flow(flow) {
        Ok(graph) => graph,
        Err(err) => {
            issues.push(graph_issue(flow.id, &err));
            return issues;
        }
    };

    let triggers: Vec<&str> = flow
        .nodes
        .iter()
        .filter(|n| registry.is_trigger(&n.node_type))
        .map(|n| n.id.as_str())
        .collect();
    if triggers.is_empty() {
        issues.push(
            ValidationIssue::new(flow.id, Severity::Error, issue_type::NO_TRIGGER, "Flow has no trigger node")
                .fix("Add a trigger node such as manual_trigger"),
        );
    }

    check_nodes(flow, registry, credentials, now, &mut issues);
    check_edge_conditions(flow, &graph, registry, &mut issues);

    if !triggers.is_empty() {
        check_reachability(flow, &graph, &triggers, &mut issues);
    }

    debug!(flow_id = %flow.id, issues = issues.len(), "flow validated");
    issues
}

fn graph_issue(flow_id: Uuid, err: &GraphError) -> ValidationIssue {
    let issue = ValidationIssue::new(flow_id, Severity::Error, issue_type::INVALID_GRAPH, err.to_string());
    match err {
        GraphError::DuplicateNodeId(id) => issue.on_node(id.clone()).fix("Give every node a unique id"),
        GraphError::SelfLoop { node_id, .. } => issue.on_node(node_id.clone()).fix("Remove the edge"),
        GraphError::DuplicateEdge { from, .. } => issue.on_node(from.clone()).fix("Remove the duplicate edge"),
        GraphError::DanglingReference { node_id, .. } => {
            issue.fix(format!("Remove the edge or add node '{node_id}'"))
        }
        GraphError::UnknownTrigger(_) | GraphError::CycleDetected(_) => issue,
    }
}

fn check_nodes(
    flow: &Flow,
    registry: &NodeRegistry,
    credentials: &[Credential],
    now: DateTime<Utc>,
    issues: &mut Vec<ValidationIssue>,
) {
    for node in &flow.nodes {
        let Some(kind) = registry.kind(&node.node_type) else {
            issues.push(
                ValidationIssue::new(
                    flow.id,
                    Severity::Error,
                    issue_type::UNKNOWN_NODE_TYPE,
                    format!("Unknown node type '{}'", node.node_type),
                )
                .on_node(node.id.clone())
                .on_field("node_type")
                .fix("Use a registered node type or remove the node"),
            );
            continue;
        };
        if kind == NodeKind::Trigger {
            continue;
        }
        let Ok(executor) = registry.get(&node.node_type) else { continue };

        for config_issue in executor.check_config(&node.config) {
            let mut issue = ValidationIssue::new(
                flow.id,
                config_issue.severity,
                issue_type::INVALID_CONFIG,
                config_issue.message,
            )
            .on_node(node.id.clone())
            .on_field(config_issue.field);
            issue.suggested_fix = config_issue.suggested_fix;
            issues.push(issue);
        }

        let reference = CredentialReference::from_config(&node.config)
            .or_else(|| executor.credential_provider().map(CredentialReference::provider));
        if let Some(reference) = reference {
            if let Some(issue) = check_credential(flow.id, &node.id, &reference, credentials, now) {
                issues.push(issue);
            }
        }
    }
}

fn check_credential(
    flow_id: Uuid,
    node_id: &str,
    reference: &CredentialReference,
    credentials: &[Credential],
    now: DateTime<Utc>,
) -> Option<ValidationIssue> {
    let candidates: Vec<&Credential> = credentials.iter().filter(|c| c.matches(reference)).collect();
    let message = if candidates.is_empty() {
        format!("No {} credential is connected", reference.provider)
    } else if candidates.iter().all(|c| c.is_expired(now)) {
        format!("The {} credential has expired", reference.provider)
    } else {
        return None;
    };
    Some(
        ValidationIssue::new(flow_id, Severity::Warning, issue_type::UNRESOLVED_CREDENTIAL, message)
            .on_node(node_id)
            .on_field("credential")
            .fix(format!("Connect a {} account", reference.provider)),
    )
}

fn check_edge_conditions(flow: &Flow, graph: &Graph, registry: &NodeRegistry, issues: &mut Vec<ValidationIssue>) {
    for edge in graph.edges() {
        let Some(condition) = &edge.condition else { continue };
        let Some(source) = graph.node(&edge.from) else { continue };
        if registry.is_trigger(&source.node_type) {
            continue;
        }
        let Ok(executor) = registry.get(&source.node_type) else { continue };
        let Some(fields) = executor.output_fields() else { continue };

        let root = condition.root_field();
        if !fields.contains(&root) {
            issues.push(
                ValidationIssue::new(
                    flow.id,
                    Severity::Error,
                    issue_type::UNDEFINED_CONDITION_FIELD,
                    format!(
                        "Edge '{}' tests field '{root}' which node '{}' does not produce",
                        edge.id, edge.from
                    ),
                )
                .on_node(edge.from.clone())
                .on_field(root)
                .fix(format!("Use one of: {}", fields.join(", "))),
            );
        }
    }
}

fn check_reachability(flow: &Flow, graph: &Graph, triggers: &[&str], issues: &mut Vec<ValidationIssue>) {
    match graph.topological_order(triggers) {
        Ok(_) => {}
        Err(GraphError::CycleDetected(members)) => issues.push(
            ValidationIssue::new(
                flow.id,
                Severity::Error,
                issue_type::CYCLE,
                format!("Cycle through nodes: {}", members.join(", ")),
            )
            .fix("Remove one of the edges that closes the loop"),
        ),
        Err(other) => issues.push(graph_issue(flow.id, &other)),
    }

    let reachable: HashSet<String> = match graph.reachable_from(triggers) {
        Ok(ids) => ids.into_iter().collect(),
        Err(_) => return,
    };
    for node in graph.nodes() {
        if !reachable.contains(&node.id) {
            issues.push(
                ValidationIssue::new(
                    flow.id,
                    Severity::Warning,
                    issue_type::ORPHAN_NODE,
                    "Node is not reachable from any trigger",
                )
                .on_node(node.id.clone())
                .fix("Connect this node to the flow or remove it"),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Issues of one validation pass with their severity counts.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub flow_id: Uuid,
    pub issues: Vec<ValidationIssue>,
    pub errors: usize,
    pub warnings: usize,
    pub info: usize,
}

impl ValidationReport {
    pub fn new(flow_id: Uuid, issues: Vec<ValidationIssue>) -> Self {
        let open = || issues.iter().filter(|i| !i.is_resolved());
        let count = |severity: Severity| open().filter(|i| i.severity == severity).count();
        let (errors, warnings, info) = (count(Severity::Error), count(Severity::Warning), count(Severity::Info));
        Self {
            flow_id,
            issues,
            errors,
            warnings,
            info,
        }
    }

    pub fn total(&self) -> usize {
        self.errors + self.warnings + self.info
    }

    /// Only unresolved `error` issues block `draft -> active`.
    pub fn can_activate(&self) -> bool {
        self.errors == 0
    }
}

/// Merge a fresh validation pass into previously stored issues.
///
/// Unresolved issues that the fresh pass still finds are kept with their
/// original id and creation time; the rest are resolved at `now`. Fresh
/// issues with no unresolved counterpart are added. Already resolved issues
/// are kept as history.
pub fn reconcile(existing: Vec<ValidationIssue>, fresh: Vec<ValidationIssue>, now: DateTime<Utc>) -> Vec<ValidationIssue> {
    let fresh_keys: HashSet<_> = fresh.iter().map(owned_key).collect();
    let mut open_keys = HashSet::new();

    let mut merged: Vec<ValidationIssue> = existing
        .into_iter()
        .map(|mut issue| {
            if !issue.is_resolved() {
                let key = owned_key(&issue);
                if fresh_keys.contains(&key) {
                    open_keys.insert(key);
                } else {
                    issue.resolved_at = Some(now);
                }
            }
            issue
        })
        .collect();

    merged.extend(fresh.into_iter().filter(|i| !open_keys.contains(&owned_key(i))));
    merged
}

type IssueKey = (String, Option<String>, Option<String>, String);

fn owned_key(issue: &ValidationIssue) -> IssueKey {
    let (kind, node, field, message) = issue.key();
    (
        kind.to_owned(),
        node.map(str::to_owned),
        field.map(str::to_owned),
        message.to_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Edge, Node};
    use nodes::{EdgeCondition, Operator, Predicate};
    use serde_json::{json, Value};

    fn registry() -> NodeRegistry {
        NodeRegistry::with_builtins()
    }

    fn trigger() -> Node {
        Node::new("start", "manual_trigger", Value::Null)
    }

    fn of_type<'a>(issues: &'a [ValidationIssue], kind: &str) -> Vec<&'a ValidationIssue> {
        issues.iter().filter(|i| i.issue_type == kind).collect()
    }

    fn google_credential(expires_in_hours: i64) -> Credential {
        let now = Utc::now();
        Credential {
            id: Uuid::new_v4(),
            owner: Uuid::new_v4(),
            provider: "google".into(),
            account_identifier: "ops@example.com".into(),
            encrypted_token: "enc".into(),
            token_expires_at: Some(now + chrono::Duration::hours(expires_in_hours)),
            scopes: vec![],
            last_used_at: None,
            created_at: now,
        }
    }

    #[test]
    fn missing_required_field_is_an_error_until_fixed() {
        let mut flow = Flow::new(
            "hook",
            vec![trigger(), Node::new("call", "webhook", json!({}))],
            vec![Edge::new("start", "call")],
        );

        let issues = validate(&flow, &registry(), &[], Utc::now());
        let config = of_type(&issues, issue_type::INVALID_CONFIG);
        assert_eq!(config.len(), 1);
        assert_eq!(config[0].severity, Severity::Error);
        assert_eq!(config[0].node_id.as_deref(), Some("call"));
        assert_eq!(config[0].field_name.as_deref(), Some("url"));

        flow.nodes[1].config = json!({ "url": "https://example.com/hook" });
        let issues = validate(&flow, &registry(), &[], Utc::now());
        assert!(of_type(&issues, issue_type::INVALID_CONFIG).is_empty());
    }

    #[test]
    fn empty_flow_and_missing_trigger_are_errors() {
        let empty = Flow::new("empty", vec![], vec![]);
        let issues = validate(&empty, &registry(), &[], Utc::now());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, issue_type::NO_NODES);

        let no_trigger = Flow::new("lonely", vec![Node::new("s", "set", json!({ "values": {} }))], vec![]);
        let issues = validate(&no_trigger, &registry(), &[], Utc::now());
        assert_eq!(of_type(&issues, issue_type::NO_TRIGGER).len(), 1);
        // Without a trigger there is nothing to be orphaned from.
        assert!(of_type(&issues, issue_type::ORPHAN_NODE).is_empty());
    }

    #[test]
    fn disconnected_node_is_only_a_warning() {
        let flow = Flow::new(
            "orphans",
            vec![
                trigger(),
                Node::new("a", "set", json!({ "values": { "x": 1 } })),
                Node::new("island", "set", json!({ "values": { "y": 2 } })),
            ],
            vec![Edge::new("start", "a")],
        );

        let issues = validate(&flow, &registry(), &[], Utc::now());
        let orphans = of_type(&issues, issue_type::ORPHAN_NODE);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].node_id.as_deref(), Some("island"));
        assert!(ValidationReport::new(flow.id, issues).can_activate());
    }

    #[test]
    fn reachable_cycle_is_an_error() {
        let values = json!({ "values": {} });
        let flow = Flow::new(
            "loop",
            vec![trigger(), Node::new("a", "set", values.clone()), Node::new("b", "set", values)],
            vec![Edge::new("start", "a"), Edge::new("a", "b"), Edge::new("b", "a")],
        );

        let issues = validate(&flow, &registry(), &[], Utc::now());
        let cycles = of_type(&issues, issue_type::CYCLE);
        assert_eq!(cycles.len(), 1);
        assert!(cycles[0].message.contains("a, b"));
    }

    #[test]
    fn structural_errors_stop_further_checks() {
        let flow = Flow::new("dup", vec![trigger(), trigger()], vec![]);
        let issues = validate(&flow, &registry(), &[], Utc::now());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, issue_type::INVALID_GRAPH);
        assert_eq!(issues[0].node_id.as_deref(), Some("start"));
    }

    #[test]
    fn unknown_node_type_is_reported_on_the_node() {
        let flow = Flow::new(
            "mystery",
            vec![trigger(), Node::new("x", "teleport", Value::Null)],
            vec![Edge::new("start", "x")],
        );
        let issues = validate(&flow, &registry(), &[], Utc::now());
        let unknown = of_type(&issues, issue_type::UNKNOWN_NODE_TYPE);
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].node_id.as_deref(), Some("x"));
    }

    #[test]
    fn edge_condition_on_undeclared_output_field_is_an_error() {
        let check = Node::new("check", "condition", json!({ "field": "amount", "op": "gt", "value": 10 }));
        let flow = Flow::new(
            "branches",
            vec![
                trigger(),
                check,
                Node::new("yes", "set", json!({ "values": {} })),
                Node::new("maybe", "set", json!({ "values": {} })),
            ],
            vec![
                Edge::new("start", "check"),
                Edge::new("check", "yes").when(EdgeCondition::Branch(true)),
                Edge::new("check", "maybe")
                    .when(EdgeCondition::Predicate(Predicate::new("score", Operator::Gt, Some(json!(1))))),
            ],
        );

        let issues = validate(&flow, &registry(), &[], Utc::now());
        let undefined = of_type(&issues, issue_type::UNDEFINED_CONDITION_FIELD);
        assert_eq!(undefined.len(), 1);
        assert_eq!(undefined[0].field_name.as_deref(), Some("score"));
        assert_eq!(undefined[0].node_id.as_deref(), Some("check"));
    }

    #[test]
    fn credential_problems_are_warnings() {
        let flow = Flow::new(
            "mail",
            vec![
                trigger(),
                Node::new(
                    "send",
                    "gmail_send_email",
                    json!({ "to": "a@example.com", "subject": "hi", "body": "hello" }),
                ),
            ],
            vec![Edge::new("start", "send")],
        );
        let now = Utc::now();

        let issues = validate(&flow, &registry(), &[], now);
        let missing = of_type(&issues, issue_type::UNRESOLVED_CREDENTIAL);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].severity, Severity::Warning);

        let issues = validate(&flow, &registry(), &[google_credential(-1)], now);
        let expired = of_type(&issues, issue_type::UNRESOLVED_CREDENTIAL);
        assert!(expired[0].message.contains("expired"));

        let issues = validate(&flow, &registry(), &[google_credential(1)], now);
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
    }

    #[test]
    fn calendar_and_slack_actions_check_their_fields() {
        let flow = Flow::new(
            "notify",
            vec![
                trigger(),
                Node::new("event", "google_calendar_create_event", json!({ "title": "Review" })),
                Node::new("post", "slack_send_message", json!({ "channel": "", "message": "" })),
            ],
            vec![Edge::new("start", "event"), Edge::new("event", "post")],
        );

        let issues = validate(&flow, &registry(), &[google_credential(1)], Utc::now());
        let config: Vec<_> = of_type(&issues, issue_type::INVALID_CONFIG)
            .into_iter()
            .map(|i| (i.node_id.as_deref(), i.field_name.as_deref(), i.severity))
            .collect();
        assert_eq!(
            config,
            vec![
                (Some("event"), Some("calendar_id"), Severity::Error),
                (Some("event"), Some("start_time"), Severity::Error),
                (Some("post"), Some("channel"), Severity::Error),
                (Some("post"), Some("message"), Severity::Warning),
            ]
        );
        let credentials = of_type(&issues, issue_type::UNRESOLVED_CREDENTIAL);
        assert_eq!(credentials.len(), 1);
        assert_eq!(credentials[0].node_id.as_deref(), Some("post"));
        assert!(!ValidationReport::new(flow.id, issues).can_activate());
    }

    #[test]
    fn report_counts_open_issues_by_severity() {
        let flow_id = Uuid::new_v4();
        let mut resolved = ValidationIssue::new(flow_id, Severity::Error, "x", "old");
        resolved.dismiss(Utc::now());
        let report = ValidationReport::new(
            flow_id,
            vec![
                ValidationIssue::new(flow_id, Severity::Error, "x", "a"),
                ValidationIssue::new(flow_id, Severity::Warning, "y", "b"),
                ValidationIssue::new(flow_id, Severity::Info, "z", "c"),
                resolved,
            ],
        );
        assert_eq!((report.errors, report.warnings, report.info), (1, 1, 1));
        assert_eq!(report.total(), 3);
        assert!(!report.can_activate());
    }

    #[test]
    fn reconcile_keeps_resolves_and_adds() {
        let flow_id = Uuid::new_v4();
        let now = Utc::now();
        let still = ValidationIssue::new(flow_id, Severity::Error, "invalid_config", "url missing").on_node("n1");
        let gone = ValidationIssue::new(flow_id, Severity::Warning, "orphan_node", "unreachable").on_node("n2");
        let still_id = still.id;

        let fresh = vec![
            ValidationIssue::new(flow_id, Severity::Error, "invalid_config", "url missing").on_node("n1"),
            ValidationIssue::new(flow_id, Severity::Error, "cycle", "loop"),
        ];

        let merged = reconcile(vec![still, gone], fresh, now);
        assert_eq!(merged.len(), 3);

        let kept = merged.iter().find(|i| i.issue_type == "invalid_config").unwrap();
        assert_eq!(kept.id, still_id);
        assert!(!kept.is_resolved());

        let resolved = merged.iter().find(|i| i.issue_type == "orphan_node").unwrap();
        assert_eq!(resolved.resolved_at, Some(now));

        assert!(merged.iter().any(|i| i.issue_type == "cycle" && !i.is_resolved()));
    }
}
