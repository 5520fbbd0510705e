//! Determines the externally reachable addresses of a site's router and
//! claims endpoints under its configured ingress strategy.

use crate::{
    k8s::names::{
        CLAIMS_INGRESS_PREFIX, CLAIMS_PORT, CLAIMS_ROLE, CLAIMS_ROUTE, CONTROLLER_SERVICE,
        EDGE_INGRESS_PREFIX, EDGE_PORT, EDGE_ROLE, EDGE_ROUTE, INGRESS_NAME, INGRESS_PORT,
        INTER_ROUTER_INGRESS_PREFIX, INTER_ROUTER_PORT, INTER_ROUTER_ROLE, INTER_ROUTER_ROUTE,
        ROUTER_SERVICE,
    },
    site::Site,
};
use async_trait::async_trait;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time;

/// How a site exposes its endpoints outside its cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Ingress {
    /// OpenShift passthrough routes.
    Route,
    LoadBalancer,
    /// Node ports on the given host.
    NodePort { host: String },
    /// Contour HTTPProxy virtual hosts under the given domain.
    ContourHttpProxy { host: String },
    /// A Kubernetes Ingress with TLS passthrough.
    Kubernetes,
    /// Only reachable from inside the cluster.
    #[default]
    None,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

/// The externally reachable router endpoints of a site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterEndpoints {
    pub inter_router: HostPort,
    pub edge: HostPort,
    local_only: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimsEndpoint {
    pub endpoint: HostPort,
    local_only: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceStatus {
    pub ports: Vec<NamedPort>,
    /// The first external address allocated to a load balancer service.
    pub load_balancer_host: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedPort {
    pub name: String,
    pub port: u16,
    pub node_port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressRule {
    pub host: String,
    pub service_port: u16,
}

/// Reads the cluster objects that expose a site.
#[async_trait]
pub trait IngressInspector: Send + Sync {
    /// Returns the host admitted for the named route, if the route exists.
    async fn route_host(&self, name: &str) -> anyhow::Result<Option<String>>;

    async fn service(&self, name: &str) -> anyhow::Result<Option<ServiceStatus>>;

    async fn ingress_rules(&self, name: &str) -> anyhow::Result<Vec<IngressRule>>;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out after {timeout:?} waiting for service {service:?} to be allocated an external address")]
    Timeout { service: String, timeout: Duration },

    #[error("route {0:?} not found")]
    RouteNotFound(String),

    #[error("service {0:?} not found")]
    ServiceNotFound(String),

    #[error("service {service:?} has no node port for {port:?}")]
    NodePortNotFound { service: String, port: String },

    #[error("ingress {ingress:?} has no rule for port {port}")]
    IngressRuleNotFound { ingress: String, port: u16 },

    #[error(transparent)]
    Inspect(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct EndpointResolver {
    namespace: String,
    ingress: Ingress,
    inspector: Arc<dyn IngressInspector>,
    poll_interval: Duration,
    timeout: Duration,
}

// === impl Ingress ===

impl Ingress {
    /// Builds a strategy from its name and, where one is required, the host
    /// under which it exposes endpoints.
    pub fn from_parts(kind: &str, host: Option<String>) -> Result<Self, crate::Error> {
        let need_host = |host: Option<String>| {
            host.filter(|h| !h.is_empty()).ok_or_else(|| {
                crate::Error::InvalidArgument(format!("ingress {kind:?} requires a host"))
            })
        };
        match kind {
            "route" => Ok(Self::Route),
            "loadbalancer" => Ok(Self::LoadBalancer),
            "nodeport" => Ok(Self::NodePort {
                host: need_host(host)?,
            }),
            "contour-http-proxy" => Ok(Self::ContourHttpProxy {
                host: need_host(host)?,
            }),
            "ingress" | "nginx-ingress-v1" => Ok(Self::Kubernetes),
            "none" | "" => Ok(Self::None),
            kind => Err(crate::Error::InvalidArgument(format!(
                "unknown ingress {kind:?}"
            ))),
        }
    }
}

// === impl HostPort ===

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// === impl RouterEndpoints ===

impl RouterEndpoints {
    pub fn new(inter_router: HostPort, edge: HostPort, local_only: bool) -> Self {
        Self {
            inter_router,
            edge,
            local_only,
        }
    }

    /// Indicates that the endpoints are reachable only from within the
    /// site's cluster.
    pub fn is_local_access_only(&self) -> bool {
        self.local_only
    }

    /// The distinct hosts a router credential must be valid for.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts = vec![self.inter_router.host.clone()];
        if self.edge.host != self.inter_router.host {
            hosts.push(self.edge.host.clone());
        }
        hosts
    }

    /// Endpoints keyed by role, as recorded in connection tokens.
    pub fn by_role(&self) -> [(&'static str, &HostPort); 2] {
        [
            (INTER_ROUTER_ROLE, &self.inter_router),
            (EDGE_ROLE, &self.edge),
        ]
    }
}

/// The hosts the site server credential must be valid for.
pub fn site_server_hosts(namespace: &str, endpoints: &RouterEndpoints) -> Vec<String> {
    let mut hosts = vec![
        ROUTER_SERVICE.to_string(),
        format!("{ROUTER_SERVICE}.{namespace}"),
    ];
    for host in endpoints.hosts() {
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    hosts
}

// === impl ClaimsEndpoint ===

impl ClaimsEndpoint {
    pub fn is_local_access_only(&self) -> bool {
        self.local_only
    }

    /// The URL at which the named claim is redeemed.
    pub fn url_for(&self, claim: &str) -> String {
        format!("https://{}/{claim}", self.endpoint)
    }
}

// === impl EndpointResolver ===

impl EndpointResolver {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(site: &Site, inspector: Arc<dyn IngressInspector>) -> Self {
        Self {
            namespace: site.namespace.clone(),
            ingress: site.ingress.clone(),
            inspector,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Bounds how long to wait for a load balancer to be allocated an
    /// address.
    pub fn with_timeout(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    pub async fn resolve_router(&self) -> Result<RouterEndpoints, Error> {
        let endpoints = match &self.ingress {
            Ingress::Route => RouterEndpoints::new(
                HostPort::new(self.route(INTER_ROUTER_ROUTE).await?, INGRESS_PORT),
                HostPort::new(self.route(EDGE_ROUTE).await?, INGRESS_PORT),
                false,
            ),
            Ingress::LoadBalancer => {
                let host = self.load_balancer_host(ROUTER_SERVICE).await?;
                RouterEndpoints::new(
                    HostPort::new(host.clone(), INTER_ROUTER_PORT),
                    HostPort::new(host, EDGE_PORT),
                    false,
                )
            }
            Ingress::NodePort { host } => {
                let service = self.service(ROUTER_SERVICE).await?;
                RouterEndpoints::new(
                    HostPort::new(
                        host.clone(),
                        node_port(ROUTER_SERVICE, &service, INTER_ROUTER_ROLE)?,
                    ),
                    HostPort::new(host.clone(), node_port(ROUTER_SERVICE, &service, EDGE_ROLE)?),
                    false,
                )
            }
            Ingress::ContourHttpProxy { host } => RouterEndpoints::new(
                HostPort::new(self.virtual_host(INTER_ROUTER_INGRESS_PREFIX, host), INGRESS_PORT),
                HostPort::new(self.virtual_host(EDGE_INGRESS_PREFIX, host), INGRESS_PORT),
                false,
            ),
            Ingress::Kubernetes => {
                let rules = self.inspector.ingress_rules(INGRESS_NAME).await?;
                RouterEndpoints::new(
                    HostPort::new(rule_host(&rules, INTER_ROUTER_PORT)?, INGRESS_PORT),
                    HostPort::new(rule_host(&rules, EDGE_PORT)?, INGRESS_PORT),
                    false,
                )
            }
            Ingress::None => {
                let host = format!("{ROUTER_SERVICE}.{}", self.namespace);
                RouterEndpoints::new(
                    HostPort::new(host.clone(), INTER_ROUTER_PORT),
                    HostPort::new(host, EDGE_PORT),
                    true,
                )
            }
        };
        tracing::debug!(
            inter_router = %endpoints.inter_router,
            edge = %endpoints.edge,
            local_only = endpoints.local_only,
            "Resolved router endpoints"
        );
        Ok(endpoints)
    }

    pub async fn resolve_claims(&self) -> Result<ClaimsEndpoint, Error> {
        let (endpoint, local_only) = match &self.ingress {
            Ingress::Route => (HostPort::new(self.route(CLAIMS_ROUTE).await?, INGRESS_PORT), false),
            Ingress::LoadBalancer => (
                HostPort::new(self.load_balancer_host(CONTROLLER_SERVICE).await?, CLAIMS_PORT),
                false,
            ),
            Ingress::NodePort { host } => {
                let service = self.service(CONTROLLER_SERVICE).await?;
                let port = node_port(CONTROLLER_SERVICE, &service, CLAIMS_ROLE)?;
                (HostPort::new(host.clone(), port), false)
            }
            Ingress::ContourHttpProxy { host } => (
                HostPort::new(self.virtual_host(CLAIMS_INGRESS_PREFIX, host), INGRESS_PORT),
                false,
            ),
            Ingress::Kubernetes => {
                let rules = self.inspector.ingress_rules(INGRESS_NAME).await?;
                (HostPort::new(rule_host(&rules, CLAIMS_PORT)?, INGRESS_PORT), false)
            }
            Ingress::None => (
                HostPort::new(format!("{CONTROLLER_SERVICE}.{}", self.namespace), CLAIMS_PORT),
                true,
            ),
        };
        tracing::debug!(%endpoint, local_only, "Resolved claims endpoint");
        Ok(ClaimsEndpoint {
            endpoint,
            local_only,
        })
    }

    async fn route(&self, name: &str) -> Result<String, Error> {
        self.inspector
            .route_host(name)
            .await?
            .ok_or_else(|| Error::RouteNotFound(name.to_string()))
    }

    async fn service(&self, name: &str) -> Result<ServiceStatus, Error> {
        self.inspector
            .service(name)
            .await?
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    /// Polls the named service until it has been allocated an external
    /// address.
    async fn load_balancer_host(&self, name: &str) -> Result<String, Error> {
        let deadline = time::Instant::now() + self.timeout;
        loop {
            if let Some(host) = self.service(name).await?.load_balancer_host {
                return Ok(host);
            }
            if time::Instant::now() + self.poll_interval > deadline {
                return Err(Error::Timeout {
                    service: name.to_string(),
                    timeout: self.timeout,
                });
            }
            tracing::debug!(service = %name, "Waiting for load balancer address");
            time::sleep(self.poll_interval).await;
        }
    }

    fn virtual_host(&self, prefix: &str, domain: &str) -> String {
        format!("{prefix}.{}.{domain}", self.namespace)
    }
}

fn node_port(service: &str, status: &ServiceStatus, port: &str) -> Result<u16, Error> {
    status
        .ports
        .iter()
        .find(|p| p.name == port)
        .and_then(|p| p.node_port)
        .ok_or_else(|| Error::NodePortNotFound {
            service: service.to_string(),
            port: port.to_string(),
        })
}

fn rule_host(rules: &[IngressRule], port: u16) -> Result<String, Error> {
    rules
        .iter()
        .find(|r| r.service_port == port)
        .map(|r| r.host.clone())
        .ok_or_else(|| Error::IngressRuleNotFound {
            ingress: INGRESS_NAME.to_string(),
            port,
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use maplit::btreemap;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Serves canned cluster objects; a service's load balancer address
    /// appears after a number of lookups.
    #[derive(Default)]
    pub(crate) struct StaticIngress {
        pub routes: BTreeMap<String, String>,
        pub services: BTreeMap<String, ServiceStatus>,
        pub rules: Vec<IngressRule>,
        pub lookups_until_allocated: Mutex<usize>,
    }

    #[async_trait]
    impl IngressInspector for StaticIngress {
        async fn route_host(&self, name: &str) -> anyhow::Result<Option<String>> {
            Ok(self.routes.get(name).cloned())
        }

        async fn service(&self, name: &str) -> anyhow::Result<Option<ServiceStatus>> {
            let mut pending = self.lookups_until_allocated.lock();
            let mut status = self.services.get(name).cloned();
            if *pending > 0 {
                *pending -= 1;
                if let Some(status) = status.as_mut() {
                    status.load_balancer_host = None;
                }
            }
            Ok(status)
        }

        async fn ingress_rules(&self, _: &str) -> anyhow::Result<Vec<IngressRule>> {
            Ok(self.rules.clone())
        }
    }

    fn resolver(ingress: Ingress, inspector: StaticIngress) -> EndpointResolver {
        let site = Site {
            namespace: "east".to_string(),
            ingress,
            ..Default::default()
        };
        EndpointResolver::new(&site, Arc::new(inspector))
            .with_timeout(Duration::from_secs(1), Duration::from_secs(5))
    }

    fn port(name: &str, port: u16, node_port: Option<u16>) -> NamedPort {
        NamedPort {
            name: name.to_string(),
            port,
            node_port,
        }
    }

    #[tokio::test]
    async fn resolves_without_ingress_as_local_only() {
        let resolver = resolver(Ingress::None, StaticIngress::default());
        let router = resolver.resolve_router().await.unwrap();
        assert!(router.is_local_access_only());
        assert_eq!(router.inter_router, HostPort::new("skupper-router.east", 55671));
        assert_eq!(router.edge, HostPort::new("skupper-router.east", 45671));
        assert_eq!(router.hosts(), vec!["skupper-router.east"]);

        let claims = resolver.resolve_claims().await.unwrap();
        assert!(claims.is_local_access_only());
        assert_eq!(claims.url_for("claim1"), "https://skupper.east:8081/claim1");
    }

    #[tokio::test]
    async fn resolves_routes() {
        let inspector = StaticIngress {
            routes: btreemap! {
                INTER_ROUTER_ROUTE.to_string() => "ir.apps.example.com".to_string(),
                EDGE_ROUTE.to_string() => "edge.apps.example.com".to_string(),
                CLAIMS_ROUTE.to_string() => "claims.apps.example.com".to_string(),
            },
            ..Default::default()
        };
        let resolver = resolver(Ingress::Route, inspector);
        let router = resolver.resolve_router().await.unwrap();
        assert!(!router.is_local_access_only());
        assert_eq!(router.inter_router, HostPort::new("ir.apps.example.com", 443));
        assert_eq!(
            router.hosts(),
            vec!["ir.apps.example.com", "edge.apps.example.com"]
        );
        assert_eq!(
            resolver.resolve_claims().await.unwrap().endpoint,
            HostPort::new("claims.apps.example.com", 443)
        );
    }

    #[tokio::test]
    async fn missing_route_is_an_error() {
        let resolver = resolver(Ingress::Route, StaticIngress::default());
        assert!(matches!(
            resolver.resolve_router().await,
            Err(Error::RouteNotFound(_))
        ));
    }

    #[tokio::test]
    async fn resolves_node_ports() {
        let inspector = StaticIngress {
            services: btreemap! {
                ROUTER_SERVICE.to_string() => ServiceStatus {
                    ports: vec![
                        port("inter-router", 55671, Some(31001)),
                        port("edge", 45671, Some(31002)),
                    ],
                    load_balancer_host: None,
                },
                CONTROLLER_SERVICE.to_string() => ServiceStatus {
                    ports: vec![port("claims", 8081, Some(31003))],
                    load_balancer_host: None,
                },
            },
            ..Default::default()
        };
        let resolver = resolver(
            Ingress::NodePort {
                host: "10.0.0.7".to_string(),
            },
            inspector,
        );
        let router = resolver.resolve_router().await.unwrap();
        assert_eq!(router.inter_router, HostPort::new("10.0.0.7", 31001));
        assert_eq!(router.edge, HostPort::new("10.0.0.7", 31002));
        assert_eq!(
            resolver.resolve_claims().await.unwrap().endpoint,
            HostPort::new("10.0.0.7", 31003)
        );
    }

    #[tokio::test]
    async fn resolves_contour_and_ingress_hosts() {
        let contour = resolver(
            Ingress::ContourHttpProxy {
                host: "example.com".to_string(),
            },
            StaticIngress::default(),
        );
        assert_eq!(
            contour.resolve_router().await.unwrap().edge,
            HostPort::new("skupper-edge.east.example.com", 443)
        );
        assert_eq!(
            contour.resolve_claims().await.unwrap().endpoint,
            HostPort::new("skupper-claims.east.example.com", 443)
        );

        let ingress = resolver(
            Ingress::Kubernetes,
            StaticIngress {
                rules: vec![
                    IngressRule {
                        host: "ir.example.com".to_string(),
                        service_port: INTER_ROUTER_PORT,
                    },
                    IngressRule {
                        host: "edge.example.com".to_string(),
                        service_port: EDGE_PORT,
                    },
                ],
                ..Default::default()
            },
        );
        let router = ingress.resolve_router().await.unwrap();
        assert_eq!(router.inter_router, HostPort::new("ir.example.com", 443));
        assert!(matches!(
            ingress.resolve_claims().await,
            Err(Error::IngressRuleNotFound { port: 8081, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_load_balancer_address() {
        let inspector = StaticIngress {
            services: btreemap! {
                ROUTER_SERVICE.to_string() => ServiceStatus {
                    ports: vec![],
                    load_balancer_host: Some("203.0.113.9".to_string()),
                },
            },
            lookups_until_allocated: Mutex::new(3),
            ..Default::default()
        };
        let router = resolver(Ingress::LoadBalancer, inspector)
            .resolve_router()
            .await
            .unwrap();
        assert_eq!(router.inter_router, HostPort::new("203.0.113.9", 55671));
        assert_eq!(router.edge, HostPort::new("203.0.113.9", 45671));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_waiting_for_load_balancer() {
        let inspector = StaticIngress {
            services: btreemap! {
                ROUTER_SERVICE.to_string() => ServiceStatus::default(),
            },
            ..Default::default()
        };
        let err = resolver(Ingress::LoadBalancer, inspector)
            .resolve_router()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err}");
    }

    #[test]
    fn parses_ingress_strategies() {
        assert_eq!(Ingress::from_parts("route", None).ok(), Some(Ingress::Route));
        assert_eq!(
            Ingress::from_parts("nodeport", Some("10.0.0.1".into())).ok(),
            Some(Ingress::NodePort {
                host: "10.0.0.1".into()
            })
        );
        assert!(Ingress::from_parts("nodeport", None).is_err());
        assert!(Ingress::from_parts("gateway", None).is_err());
        assert_eq!(Ingress::from_parts("none", None).ok(), Some(Ingress::None));
    }

    #[test]
    fn server_hosts_include_service_names() {
        let endpoints = RouterEndpoints::new(
            HostPort::new("ir.example.com", 443),
            HostPort::new("ir.example.com", 443),
            false,
        );
        assert_eq!(
            site_server_hosts("east", &endpoints),
            vec!["skupper-router", "skupper-router.east", "ir.example.com"]
        );
    }
}
