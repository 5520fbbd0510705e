//! Well-known resource names, labels, annotations and data keys shared by
//! every site.

pub const BASE_QUALIFIER: &str = "skupper.io";

/// Label carrying the kind of an artifact secret.
pub const TYPE_LABEL: &str = "skupper.io/type";
pub const TYPE_TOKEN: &str = "connection-token";
pub const TYPE_CLAIM_REQUEST: &str = "token-claim";
pub const TYPE_CLAIM_RECORD: &str = "token-claim-record";

pub const GENERATED_BY_ANNOTATION: &str = "skupper.io/generated-by";
pub const SITE_VERSION_ANNOTATION: &str = "skupper.io/site-version";
pub const LOCAL_ACCESS_ONLY_ANNOTATION: &str = "skupper.io/local-access-only";
pub const COST_ANNOTATION: &str = "skupper.io/cost";
pub const CLAIM_URL_ANNOTATION: &str = "skupper.io/url";
pub const CLAIM_EXPIRATION_ANNOTATION: &str = "skupper.io/claim-expiration";
pub const CLAIMS_REMAINING_ANNOTATION: &str = "skupper.io/claims-remaining";
pub const CLAIMS_MADE_ANNOTATION: &str = "skupper.io/claims-made";

pub const INTER_ROUTER_ROLE: &str = "inter-router";
pub const EDGE_ROLE: &str = "edge";
pub const CLAIMS_ROLE: &str = "claims";

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";
pub const CA_CERT_KEY: &str = "ca.crt";
pub const CLAIM_PASSWORD_KEY: &str = "password";

pub const LOCAL_CA_SECRET: &str = "skupper-local-ca";
pub const SITE_CA_SECRET: &str = "skupper-site-ca";
pub const SITE_SERVER_SECRET: &str = "skupper-site-server";

pub const ROUTER_DEPLOYMENT: &str = "skupper-router";
pub const ROUTER_SERVICE: &str = "skupper-router";
pub const CONTROLLER_SERVICE: &str = "skupper";
pub const ROUTER_CONFIG_MAP: &str = "skupper-internal";
pub const ROUTER_CONFIG_KEY: &str = "skrouterd.json";
pub const INGRESS_NAME: &str = "skupper";

pub const INTER_ROUTER_ROUTE: &str = "skupper-inter-router";
pub const EDGE_ROUTE: &str = "skupper-edge";
pub const CLAIMS_ROUTE: &str = "claims";

pub const INTER_ROUTER_INGRESS_PREFIX: &str = "skupper-inter-router";
pub const EDGE_INGRESS_PREFIX: &str = "skupper-edge";
pub const CLAIMS_INGRESS_PREFIX: &str = "skupper-claims";

pub const INTER_ROUTER_PORT: u16 = 55671;
pub const EDGE_PORT: u16 = 45671;
pub const CLAIMS_PORT: u16 = 8081;
pub const INGRESS_PORT: u16 = 443;

/// Request header naming the site that redeems a claim.
pub const SITE_NAME_HEADER: &str = "skupper-site-name";

/// Returns a `skupper.io/type=<kind>` label selector.
pub fn type_selector(kind: &str) -> String {
    format!("{TYPE_LABEL}={kind}")
}
