//! The site's HTTP API: claim redemption and cluster policy queries.
//!
//! `POST /<claim>` redeems a claim. The body carries the claim password, the
//! `skupper-site-name` header names the redeeming site and the `site-version`
//! query parameter carries its version. A successful redemption returns the
//! connection token as a YAML secret.
//!
//! `GET /policy/incominglink`, `/policy/outgoinglink/<host>`,
//! `/policy/expose/<type>/<name>` and `/policy/service/<name>` return the
//! policy validation result as JSON.

use crate::{
    core::{
        claims::{ClaimError, ClaimRedeemer},
        policy::{Action, ClusterPolicyValidator},
        Error as CoreError,
    },
    k8s::names::SITE_NAME_HEADER,
    metrics::ApiMetrics,
};
use bytes::Bytes;
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Clone)]
pub struct Api {
    redeemer: ClaimRedeemer,
    policy: ClusterPolicyValidator,
    metrics: ApiMetrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to encode yaml response: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

type Body = http_body_util::Full<Bytes>;

// === impl Api ===

impl tower::Service<Request<hyper::body::Incoming>> for Api {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        let api = self.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = body.collect().await?.to_bytes();
            api.route(parts, body).await
        })
    }
}

impl Api {
    pub fn new(redeemer: ClaimRedeemer, policy: ClusterPolicyValidator, metrics: ApiMetrics) -> Self {
        Self {
            redeemer,
            policy,
            metrics,
        }
    }

    async fn route(self, parts: http::request::Parts, body: Bytes) -> Result<Response<Body>, Error> {
        let path = parts.uri.path().trim_start_matches('/');

        if let Some(query) = path.strip_prefix("policy/") {
            if parts.method != http::Method::GET {
                return Ok(text(http::StatusCode::METHOD_NOT_ALLOWED, "Only GET is supported"));
            }
            return match parse_action(query) {
                Some(action) => self.query_policy(action).await,
                None => Ok(text(http::StatusCode::NOT_FOUND, "Unknown policy action")),
            };
        }

        if parts.method != http::Method::POST {
            return Ok(text(http::StatusCode::METHOD_NOT_ALLOWED, "Only POST is supported"));
        }
        if path.is_empty() || path.contains('/') {
            return Ok(text(http::StatusCode::NOT_FOUND, "No such claim"));
        }

        let site_name = parts
            .headers
            .get(SITE_NAME_HEADER)
            .and_then(|v| v.to_str().ok());
        let site_version = parts.uri.query().and_then(|q| query_param(q, "site-version"));
        self.redeem(path, &body, site_name, site_version).await
    }

    async fn redeem(
        &self,
        claim: &str,
        password: &[u8],
        site_name: Option<&str>,
        site_version: Option<&str>,
    ) -> Result<Response<Body>, Error> {
        match self
            .redeemer
            .redeem(claim, password, site_name, site_version)
            .await
        {
            Ok(token) => {
                info!(%claim, site = ?site_name, "Claim redeemed");
                self.metrics.redeemed("ok");
                let yaml = serde_yaml::to_string(token.secret())?;
                Ok(Response::builder()
                    .status(http::StatusCode::OK)
                    .header(http::header::CONTENT_TYPE, "application/yaml")
                    .body(Body::from(yaml))
                    .expect("token response must be valid"))
            }
            Err(error) => {
                let (status, outcome, message) = redemption_failure(&error);
                if status.is_server_error() {
                    warn!(%claim, %error, "Failed to redeem claim");
                } else {
                    debug!(%claim, %error, "Claim rejected");
                }
                self.metrics.redeemed(outcome);
                Ok(text(status, &message))
            }
        }
    }

    async fn query_policy(&self, action: Action) -> Result<Response<Body>, Error> {
        let result = self.policy.validate(&action).await;
        debug!(%action, allowed = result.allowed(), "Policy query");
        self.metrics.policy_queried(action_label(&action), result.allowed());
        let bytes = serde_json::to_vec(&result)?;
        Ok(Response::builder()
            .status(http::StatusCode::OK)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .expect("policy response must be valid"))
    }
}

fn parse_action(path: &str) -> Option<Action> {
    let (kind, rest) = path.split_once('/').unwrap_or((path, ""));
    match kind {
        "incominglink" if rest.is_empty() => Some(Action::IncomingLink),
        "outgoinglink" if !rest.is_empty() => Some(Action::OutgoingLink {
            hostname: rest.to_string(),
        }),
        "expose" => {
            let (kind, name) = rest.split_once('/')?;
            if name.is_empty() {
                return None;
            }
            Some(Action::Expose {
                kind: kind.to_string(),
                name: name.to_string(),
            })
        }
        "service" if !rest.is_empty() => Some(Action::ImportService {
            name: rest.to_string(),
        }),
        _ => None,
    }
}

fn action_label(action: &Action) -> &'static str {
    match action {
        Action::IncomingLink => "incominglink",
        Action::OutgoingLink { .. } => "outgoinglink",
        Action::Expose { .. } => "expose",
        Action::ImportService { .. } => "service",
    }
}

fn query_param<'q>(query: &'q str, key: &str) -> Option<&'q str> {
    query
        .split('&')
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// Maps a redemption error onto a response status, a metric outcome and a
/// message for the redeeming site.
fn redemption_failure(error: &CoreError) -> (http::StatusCode, &'static str, String) {
    match error {
        CoreError::Claim(ClaimError::Corrupt { .. }) => (
            http::StatusCode::INTERNAL_SERVER_ERROR,
            "corrupt",
            "Corrupted claim".to_string(),
        ),
        CoreError::Claim(ClaimError::Refused(_)) => (
            http::StatusCode::FORBIDDEN,
            "refused",
            "Claim refused".to_string(),
        ),
        CoreError::Claim(_) => (
            http::StatusCode::NOT_FOUND,
            "not_found",
            "No such claim".to_string(),
        ),
        CoreError::IncompatibleVersion { .. } => (
            http::StatusCode::BAD_REQUEST,
            "incompatible",
            error.to_string(),
        ),
        CoreError::PolicyDenied(_) | CoreError::EdgeCannotAcceptLinks => (
            http::StatusCode::FORBIDDEN,
            "denied",
            error.to_string(),
        ),
        CoreError::RetriesExhausted { .. } => (
            http::StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "Internal error".to_string(),
        ),
        _ => (
            http::StatusCode::INTERNAL_SERVER_ERROR,
            "error",
            error.to_string(),
        ),
    }
}

fn text(status: http::StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Body::from(format!("{message}\n")))
        .expect("text response must be valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        certs::CertificateManager,
        issue::{ClaimOptions, TokenIssuer},
        policy::StaticPolicySource,
        resolve::{EndpointResolver, IngressInspector, IngressRule, ServiceStatus},
        router::RouterConfig,
        store::{memory, SharedSecrets},
        RouterMode, Site,
    };
    use crate::k8s::{names::TYPE_CLAIM_RECORD, Secret};
    use std::sync::Arc;

    struct NoIngress;

    #[async_trait::async_trait]
    impl IngressInspector for NoIngress {
        async fn route_host(&self, _: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }

        async fn service(&self, _: &str) -> anyhow::Result<Option<ServiceStatus>> {
            Ok(None)
        }

        async fn ingress_rules(&self, _: &str) -> anyhow::Result<Vec<IngressRule>> {
            Ok(vec![])
        }
    }

    struct Fixture {
        api: Api,
        issuer: TokenIssuer,
        secrets: SharedSecrets,
        metrics: ApiMetrics,
    }

    async fn fixture() -> Fixture {
        let site = Arc::new(Site {
            id: "site-a".to_string(),
            namespace: "west".to_string(),
            version: "1.4.0".to_string(),
            ..Default::default()
        });
        let secrets: SharedSecrets = Arc::new(memory::Secrets::default());
        CertificateManager::new(secrets.clone())
            .ensure_site_credentials(&["skupper-router.west".to_string()])
            .await
            .unwrap();
        let resolver = EndpointResolver::new(&site, Arc::new(NoIngress));
        let policy = ClusterPolicyValidator::new("west", Arc::new(StaticPolicySource::disabled()));
        let routers = Arc::new(memory::RouterConfigs::new(RouterConfig::new(
            "site-a",
            RouterMode::Interior,
            "1.4.0",
        )));
        let issuer = TokenIssuer::new(
            site.clone(),
            routers,
            secrets.clone(),
            resolver,
            policy.clone(),
        );
        let redeemer = ClaimRedeemer::new(site, secrets.clone(), issuer.clone());
        let metrics = ApiMetrics::default();
        Fixture {
            api: Api::new(redeemer, policy, metrics.clone()),
            issuer,
            secrets,
            metrics,
        }
    }

    fn parts(method: http::Method, uri: &str) -> http::request::Parts {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(SITE_NAME_HEADER, "site-b")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    async fn body(rsp: Response<Body>) -> String {
        let bytes = rsp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn redeems_claims_once() {
        let Fixture {
            api,
            issuer,
            secrets,
            metrics,
        } = fixture().await;
        let (claim, _) = issuer
            .create_claim_token(ClaimOptions {
                name: Some("one".to_string()),
                password: Some(b"secret".to_vec()),
                ..Default::default()
            })
            .await
            .unwrap();
        let uri = format!("{}?site-version=1.4.0", claim.url().path());

        let rsp = api
            .clone()
            .route(parts(http::Method::POST, &uri), Bytes::from_static(b"secret"))
            .await
            .unwrap();
        assert_eq!(rsp.status(), http::StatusCode::OK);
        let token: Secret = serde_yaml::from_str(&body(rsp).await).unwrap();
        assert!(token.data.as_ref().unwrap().contains_key("tls.crt"));
        assert!(secrets.list(TYPE_CLAIM_RECORD).await.unwrap().is_empty());

        let rsp = api
            .route(parts(http::Method::POST, &uri), Bytes::from_static(b"secret"))
            .await
            .unwrap();
        assert_eq!(rsp.status(), http::StatusCode::NOT_FOUND);
        assert_eq!(metrics.redemption_count("ok"), 1);
        assert_eq!(metrics.redemption_count("not_found"), 1);
    }

    #[tokio::test]
    async fn refuses_wrong_password_and_old_versions() {
        let Fixture { api, issuer, .. } = fixture().await;
        let (claim, _) = issuer
            .create_claim_token(ClaimOptions {
                password: Some(b"secret".to_vec()),
                ..Default::default()
            })
            .await
            .unwrap();
        let path = claim.url().path().to_string();

        let rsp = api
            .clone()
            .route(
                parts(http::Method::POST, &format!("{path}?site-version=1.4.0")),
                Bytes::from_static(b"guess"),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), http::StatusCode::FORBIDDEN);

        let rsp = api
            .clone()
            .route(
                parts(http::Method::POST, &format!("{path}?site-version=0.7.0")),
                Bytes::from_static(b"secret"),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), http::StatusCode::BAD_REQUEST);

        let rsp = api
            .route(parts(http::Method::GET, &path), Bytes::new())
            .await
            .unwrap();
        assert_eq!(rsp.status(), http::StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn answers_policy_queries() {
        let Fixture { api, .. } = fixture().await;
        let rsp = api
            .clone()
            .route(parts(http::Method::GET, "/policy/incominglink"), Bytes::new())
            .await
            .unwrap();
        assert_eq!(rsp.status(), http::StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body(rsp).await).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "allowed": true, "allowedBy": [], "enabled": false })
        );

        let rsp = api
            .route(parts(http::Method::GET, "/policy/unknown"), Bytes::new())
            .await
            .unwrap();
        assert_eq!(rsp.status(), http::StatusCode::NOT_FOUND);
    }

    #[test]
    fn parses_policy_actions() {
        assert_eq!(parse_action("incominglink"), Some(Action::IncomingLink));
        assert_eq!(
            parse_action("outgoinglink/east.example.com"),
            Some(Action::OutgoingLink {
                hostname: "east.example.com".to_string()
            })
        );
        assert_eq!(
            parse_action("expose/deployment/web"),
            Some(Action::Expose {
                kind: "deployment".to_string(),
                name: "web".to_string()
            })
        );
        assert_eq!(
            parse_action("service/db"),
            Some(Action::ImportService {
                name: "db".to_string()
            })
        );
        assert_eq!(parse_action("outgoinglink"), None);
        assert_eq!(parse_action("expose/web"), None);
        assert_eq!(parse_action("incominglink/extra"), None);
    }

    #[test]
    fn reads_query_params() {
        assert_eq!(query_param("a=1&site-version=1.2.3", "site-version"), Some("1.2.3"));
        assert_eq!(query_param("a=1", "site-version"), None);
    }
}
