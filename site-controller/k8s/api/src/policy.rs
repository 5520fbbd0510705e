use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster-wide allow-lists governing which namespaces may accept or create
/// links, expose resources and import services.
///
/// Each entry of `namespaces` is either `*`, a namespace name or pattern, or a
/// label selector over namespace labels. Every allow-list entry is either `*`,
/// an exact value or a regular expression.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "skupper.io",
    version = "v1alpha1",
    kind = "SkupperClusterPolicy",
    root = "ClusterPolicy"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPolicySpec {
    #[serde(default)]
    pub namespaces: Vec<String>,

    #[serde(default)]
    pub allow_incoming_links: bool,

    #[serde(default)]
    pub allowed_outgoing_links_hostnames: Vec<String>,

    #[serde(default)]
    pub allowed_exposed_resources: Vec<String>,

    #[serde(default)]
    pub allowed_services: Vec<String>,
}
