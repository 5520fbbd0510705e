//! Evaluates cluster-wide policies governing what a site may do.
//!
//! Policies only grant: an action is allowed when policy enforcement is
//! disabled, or when at least one policy that applies to the site's
//! namespace allows it.

mod matcher;

pub use self::matcher::{AllowEntry, NamespaceMatcher};
use crate::k8s::{ClusterPolicy, Labels, ResourceExt};
use async_trait::async_trait;
use serde::Serialize;
use std::{collections::BTreeMap, fmt, sync::Arc};
use thiserror::Error;

/// Supplies the cluster's policies and the labels of the site's namespace.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Returns `None` when policy enforcement is disabled in the cluster.
    async fn cluster_policies(&self) -> anyhow::Result<Option<Vec<ClusterPolicy>>>;

    async fn namespace_labels(&self, namespace: &str) -> anyhow::Result<Labels>;
}

/// A fixed set of policies.
#[derive(Clone, Debug, Default)]
pub struct StaticPolicySource {
    policies: Option<Vec<ClusterPolicy>>,
    labels: BTreeMap<String, Labels>,
}

/// An action subject to policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    IncomingLink,
    OutgoingLink { hostname: String },
    Expose { kind: String, name: String },
    ImportService { name: String },
}

/// The outcome of evaluating an action against the applicable policies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyValidationResult {
    allowed: bool,
    allowed_by: Vec<String>,
    enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{action} is not allowed by cluster policy{}", detail(.result))]
pub struct PolicyDenied {
    pub action: Action,
    pub result: PolicyValidationResult,
}

/// The policies applicable to a namespace at one point in time.
#[derive(Clone, Debug, Default)]
pub struct PolicySnapshot {
    enabled: bool,
    policies: Vec<CompiledPolicy>,
    error: Option<String>,
}

#[derive(Clone, Debug)]
struct CompiledPolicy {
    name: String,
    namespaces: Vec<NamespaceMatcher>,
    allow_incoming_links: bool,
    outgoing_hostnames: Vec<AllowEntry>,
    exposed_resources: Vec<AllowEntry>,
    services: Vec<AllowEntry>,
}

#[derive(Clone)]
pub struct ClusterPolicyValidator {
    namespace: String,
    source: Arc<dyn PolicySource>,
}

// === impl StaticPolicySource ===

impl StaticPolicySource {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled(policies: Vec<ClusterPolicy>) -> Self {
        Self {
            policies: Some(policies),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_namespace_labels(mut self, namespace: &str, labels: Labels) -> Self {
        self.labels.insert(namespace.to_string(), labels);
        self
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn cluster_policies(&self) -> anyhow::Result<Option<Vec<ClusterPolicy>>> {
        Ok(self.policies.clone())
    }

    async fn namespace_labels(&self, namespace: &str) -> anyhow::Result<Labels> {
        Ok(self.labels.get(namespace).cloned().unwrap_or_default())
    }
}

// === impl Action ===

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncomingLink => f.write_str("incoming link"),
            Self::OutgoingLink { hostname } => write!(f, "outgoing link to {hostname}"),
            Self::Expose { kind, name } if kind.is_empty() => write!(f, "exposing {name}"),
            Self::Expose { kind, name } => write!(f, "exposing {kind}/{name}"),
            Self::ImportService { name } => write!(f, "importing service {name}"),
        }
    }
}

// === impl PolicyValidationResult ===

impl PolicyValidationResult {
    fn new(enabled: bool, allowed_by: Vec<String>, error: Option<String>) -> Self {
        let allowed = !enabled || (error.is_none() && !allowed_by.is_empty());
        Self {
            allowed,
            allowed_by,
            enabled,
            error,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn allowed(&self) -> bool {
        self.allowed
    }

    /// Names of the policies that allowed the action.
    pub fn allow_policy_names(&self) -> &[String] {
        &self.allowed_by
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn into_result(self, action: Action) -> Result<Self, PolicyDenied> {
        if self.allowed {
            return Ok(self);
        }
        Err(PolicyDenied {
            action,
            result: self,
        })
    }
}

fn detail(result: &PolicyValidationResult) -> String {
    match result.error() {
        Some(error) => format!(": {error}"),
        None => String::new(),
    }
}

// === impl PolicySnapshot ===

impl PolicySnapshot {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn validate(&self, action: &Action) -> PolicyValidationResult {
        if !self.enabled || self.error.is_some() {
            return PolicyValidationResult::new(self.enabled, vec![], self.error.clone());
        }

        let allowed_by = self
            .policies
            .iter()
            .filter(|p| p.allows(action))
            .map(|p| p.name.clone())
            .collect();
        PolicyValidationResult::new(true, allowed_by, None)
    }
}

// === impl CompiledPolicy ===

impl CompiledPolicy {
    fn compile(policy: &ClusterPolicy) -> Self {
        let entries = |list: &[String]| -> Vec<AllowEntry> {
            list.iter().map(|e| AllowEntry::parse(e)).collect()
        };
        Self {
            name: policy.name_any(),
            namespaces: policy
                .spec
                .namespaces
                .iter()
                .map(|e| NamespaceMatcher::parse(e))
                .collect(),
            allow_incoming_links: policy.spec.allow_incoming_links,
            outgoing_hostnames: entries(&policy.spec.allowed_outgoing_links_hostnames),
            exposed_resources: entries(&policy.spec.allowed_exposed_resources),
            services: entries(&policy.spec.allowed_services),
        }
    }

    fn applies_to(&self, namespace: &str, labels: &Labels) -> bool {
        self.namespaces.iter().any(|m| m.matches(namespace, labels))
    }

    fn allows(&self, action: &Action) -> bool {
        match action {
            Action::IncomingLink => self.allow_incoming_links,
            Action::OutgoingLink { hostname } => {
                self.outgoing_hostnames.iter().any(|e| e.matches(hostname))
            }
            Action::Expose { kind, name } => self
                .exposed_resources
                .iter()
                .any(|e| e.matches_resource(kind, name)),
            Action::ImportService { name } => self.services.iter().any(|e| e.matches(name)),
        }
    }
}

// === impl ClusterPolicyValidator ===

impl ClusterPolicyValidator {
    pub fn new(namespace: impl Into<String>, source: Arc<dyn PolicySource>) -> Self {
        Self {
            namespace: namespace.into(),
            source,
        }
    }

    /// Loads the policies that currently apply to the site's namespace.
    ///
    /// Failing to list policies while enforcement is enabled yields a
    /// snapshot that denies every action.
    pub async fn snapshot(&self) -> PolicySnapshot {
        let policies = match self.source.cluster_policies().await {
            Ok(Some(policies)) => policies,
            Ok(None) => return PolicySnapshot::disabled(),
            Err(error) => {
                tracing::warn!(%error, "Failed to list cluster policies");
                return PolicySnapshot {
                    enabled: true,
                    policies: vec![],
                    error: Some(format!("{error:#}")),
                };
            }
        };

        let labels = match self.source.namespace_labels(&self.namespace).await {
            Ok(labels) => labels,
            Err(error) => {
                tracing::debug!(namespace = %self.namespace, %error, "Failed to read namespace labels");
                Labels::default()
            }
        };

        let policies = policies
            .iter()
            .filter(|p| !p.name_any().is_empty())
            .map(CompiledPolicy::compile)
            .filter(|p| p.applies_to(&self.namespace, &labels))
            .collect::<Vec<_>>();
        tracing::trace!(
            namespace = %self.namespace,
            policies = ?policies.iter().map(|p| &p.name).collect::<Vec<_>>(),
            "Applicable cluster policies"
        );
        PolicySnapshot {
            enabled: true,
            policies,
            error: None,
        }
    }

    pub async fn validate(&self, action: &Action) -> PolicyValidationResult {
        let result = self.snapshot().await.validate(action);
        tracing::debug!(
            %action,
            allowed = result.allowed(),
            allowed_by = ?result.allow_policy_names(),
            "Validated action"
        );
        result
    }

    pub async fn validate_incoming_link(&self) -> PolicyValidationResult {
        self.validate(&Action::IncomingLink).await
    }

    pub async fn validate_outgoing_link(&self, hostname: &str) -> PolicyValidationResult {
        self.validate(&Action::OutgoingLink {
            hostname: hostname.to_string(),
        })
        .await
    }

    pub async fn validate_expose(&self, kind: &str, name: &str) -> PolicyValidationResult {
        self.validate(&Action::Expose {
            kind: kind.to_string(),
            name: name.to_string(),
        })
        .await
    }

    pub async fn validate_import_service(&self, name: &str) -> PolicyValidationResult {
        self.validate(&Action::ImportService {
            name: name.to_string(),
        })
        .await
    }

    /// Validates an action, failing unless it is allowed.
    pub async fn require(&self, action: Action) -> Result<PolicyValidationResult, PolicyDenied> {
        self.validate(&action).await.into_result(action)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::k8s::{ClusterPolicySpec, ObjectMeta};
    use std::iter::FromIterator;

    pub(crate) fn policy(name: &str, spec: ClusterPolicySpec) -> ClusterPolicy {
        ClusterPolicy {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
        }
    }

    fn validator(namespace: &str, source: StaticPolicySource) -> ClusterPolicyValidator {
        ClusterPolicyValidator::new(namespace, Arc::new(source))
    }

    struct FailingSource;

    #[async_trait]
    impl PolicySource for FailingSource {
        async fn cluster_policies(&self) -> anyhow::Result<Option<Vec<ClusterPolicy>>> {
            anyhow::bail!("connection refused")
        }

        async fn namespace_labels(&self, _: &str) -> anyhow::Result<Labels> {
            Ok(Labels::default())
        }
    }

    #[tokio::test]
    async fn disabled_policy_allows_everything() {
        let v = validator("aaa", StaticPolicySource::disabled());
        for result in [
            v.validate_incoming_link().await,
            v.validate_outgoing_link("east.example.com").await,
            v.validate_expose("deployment", "backend").await,
            v.validate_import_service("backend").await,
        ] {
            assert!(!result.enabled());
            assert!(result.allowed());
            assert!(result.allow_policy_names().is_empty());
        }
    }

    #[tokio::test]
    async fn enabled_without_policies_denies() {
        let v = validator("aaa", StaticPolicySource::enabled(vec![]));
        let result = v.validate_incoming_link().await;
        assert!(result.enabled());
        assert!(!result.allowed());
        assert!(result.error().is_none());
    }

    #[tokio::test]
    async fn wildcard_namespace_allows_incoming_links() {
        let v = validator(
            "aaa",
            StaticPolicySource::enabled(vec![policy(
                "policy-1",
                ClusterPolicySpec {
                    namespaces: vec!["*".to_string()],
                    allow_incoming_links: true,
                    ..Default::default()
                },
            )]),
        );
        let result = v.validate_incoming_link().await;
        assert!(result.enabled());
        assert!(result.allowed());
        assert_eq!(result.allow_policy_names(), ["policy-1"]);
    }

    #[tokio::test]
    async fn policies_only_grant_within_their_namespaces() {
        let source = StaticPolicySource::enabled(vec![
            policy(
                "east-links",
                ClusterPolicySpec {
                    namespaces: vec!["east-.*".to_string()],
                    allow_incoming_links: true,
                    allowed_outgoing_links_hostnames: vec![".*\\.example\\.com".to_string()],
                    ..Default::default()
                },
            ),
            policy(
                "prod-services",
                ClusterPolicySpec {
                    namespaces: vec!["env=prod".to_string()],
                    allowed_services: vec!["backend".to_string()],
                    allowed_exposed_resources: vec!["deployment/backend".to_string()],
                    ..Default::default()
                },
            ),
            policy(
                "no-incoming",
                ClusterPolicySpec {
                    namespaces: vec!["*".to_string()],
                    allow_incoming_links: false,
                    ..Default::default()
                },
            ),
        ])
        .with_namespace_labels("east-1", Labels::from_iter(vec![("env", "prod")]));

        let east = validator("east-1", source.clone());
        let incoming = east.validate_incoming_link().await;
        assert!(incoming.allowed(), "a grant is not overridden by a non-grant");
        assert_eq!(incoming.allow_policy_names(), ["east-links"]);

        assert!(east.validate_outgoing_link("west.example.com").await.allowed());
        assert!(!east.validate_outgoing_link("west.example.org").await.allowed());
        assert!(east.validate_import_service("backend").await.allowed());
        assert!(!east.validate_import_service("frontend").await.allowed());
        assert!(east.validate_expose("deployment", "backend").await.allowed());
        assert!(east.validate_expose("", "backend").await.allowed());
        assert!(!east.validate_expose("statefulset", "backend").await.allowed());

        let west = validator("west-1", source);
        assert!(!west.validate_incoming_link().await.allowed());
        assert!(!west.validate_import_service("backend").await.allowed());
    }

    #[tokio::test]
    async fn listing_failure_denies_with_error() {
        let v = ClusterPolicyValidator::new("aaa", Arc::new(FailingSource));
        let result = v.validate_incoming_link().await;
        assert!(result.enabled());
        assert!(!result.allowed());
        assert!(result.error().unwrap().contains("connection refused"));

        let denied = v.require(Action::IncomingLink).await.unwrap_err();
        assert_eq!(
            denied.to_string(),
            "incoming link is not allowed by cluster policy: connection refused"
        );
    }

    #[test]
    fn serializes_results() {
        let result = PolicyValidationResult::new(true, vec!["policy-1".to_string()], None);
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({
                "allowed": true,
                "allowedBy": ["policy-1"],
                "enabled": true,
            })
        );
    }
}
