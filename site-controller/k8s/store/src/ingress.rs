use crate::{
    core::resolve::{IngressInspector, IngressRule, NamedPort, ServiceStatus},
    k8s::{Api, ApiResource, Client, DynamicObject, GroupVersionKind, Ingress, Service},
};
use async_trait::async_trait;

/// Inspects the routes, services and ingresses that expose a site.
#[derive(Clone)]
pub struct KubeIngress {
    client: Client,
    namespace: String,
}

impl KubeIngress {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl IngressInspector for KubeIngress {
    async fn route_host(&self, name: &str) -> anyhow::Result<Option<String>> {
        let gvk = GroupVersionKind::gvk("route.openshift.io", "v1", "Route");
        let resource = ApiResource::from_gvk(&gvk);
        let api =
            Api::<DynamicObject>::namespaced_with(self.client.clone(), &self.namespace, &resource);
        Ok(api.get_opt(name).await?.as_ref().and_then(route_host))
    }

    async fn service(&self, name: &str) -> anyhow::Result<Option<ServiceStatus>> {
        let api = Api::<Service>::namespaced(self.client.clone(), &self.namespace);
        Ok(api.get_opt(name).await?.as_ref().map(service_status))
    }

    async fn ingress_rules(&self, name: &str) -> anyhow::Result<Vec<IngressRule>> {
        let api = Api::<Ingress>::namespaced(self.client.clone(), &self.namespace);
        Ok(api
            .get_opt(name)
            .await?
            .as_ref()
            .map(ingress_rules)
            .unwrap_or_default())
    }
}

fn route_host(route: &DynamicObject) -> Option<String> {
    route
        .data
        .pointer("/spec/host")
        .and_then(serde_json::Value::as_str)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
}

fn service_status(svc: &Service) -> ServiceStatus {
    let ports = svc
        .spec
        .iter()
        .flat_map(|spec| spec.ports.iter().flatten())
        .filter_map(|p| {
            Some(NamedPort {
                name: p.name.clone().unwrap_or_default(),
                port: u16::try_from(p.port).ok()?,
                node_port: p.node_port.and_then(|n| u16::try_from(n).ok()),
            })
        })
        .collect();
    let load_balancer_host = svc
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|i| i.hostname.clone().or_else(|| i.ip.clone()));
    ServiceStatus {
        ports,
        load_balancer_host,
    }
}

/// Flattens an ingress into one rule per host and backend service port.
fn ingress_rules(ingress: &Ingress) -> Vec<IngressRule> {
    let mut rules = Vec::new();
    for rule in ingress.spec.iter().flat_map(|s| s.rules.iter().flatten()) {
        let Some(host) = rule.host.as_ref() else {
            continue;
        };
        let paths = rule.http.iter().flat_map(|h| h.paths.iter());
        for path in paths {
            let port = path
                .backend
                .service
                .as_ref()
                .and_then(|s| s.port.as_ref())
                .and_then(|p| p.number)
                .and_then(|n| u16::try_from(n).ok());
            if let Some(service_port) = port {
                rules.push(IngressRule {
                    host: host.clone(),
                    service_port,
                });
            }
        }
    }
    rules
}
