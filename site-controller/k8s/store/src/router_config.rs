use crate::{
    core::{
        router::RouterConfig,
        store::{self, RouterConfigStore, Versioned},
    },
    k8s::{
        names::{ROUTER_CONFIG_KEY, ROUTER_CONFIG_MAP},
        Api, Client, ConfigMap, PostParams,
    },
    store_error,
};
use anyhow::Context;
use async_trait::async_trait;

const KIND: &str = "configmap";

/// The router configuration document held in the site's internal config map.
///
/// The config map's resource version serves as the document version.
#[derive(Clone)]
pub struct KubeRouterConfig {
    api: Api<ConfigMap>,
}

impl KubeRouterConfig {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    async fn config_map(&self) -> Result<ConfigMap, store::Error> {
        self.api
            .get_opt(ROUTER_CONFIG_MAP)
            .await
            .map_err(|e| store_error(KIND, ROUTER_CONFIG_MAP, e))?
            .ok_or_else(|| store::Error::NotFound {
                kind: KIND,
                name: ROUTER_CONFIG_MAP.to_string(),
            })
    }
}

#[async_trait]
impl RouterConfigStore for KubeRouterConfig {
    async fn get(&self) -> Result<Versioned<RouterConfig>, store::Error> {
        let cm = self.config_map().await?;
        Ok(read(&cm)?)
    }

    async fn compare_and_swap(
        &self,
        config: RouterConfig,
        version: &str,
    ) -> Result<String, store::Error> {
        let mut cm = self.config_map().await?;
        if cm.metadata.resource_version.as_deref() != Some(version) {
            return Err(conflict());
        }
        write(&mut cm, &config)?;
        let cm = self
            .api
            .replace(ROUTER_CONFIG_MAP, &PostParams::default(), &cm)
            .await
            .map_err(|e| store_error(KIND, ROUTER_CONFIG_MAP, e))?;
        let version = cm.metadata.resource_version.unwrap_or_default();
        tracing::debug!(%version, "Updated router configuration");
        Ok(version)
    }
}

fn conflict() -> store::Error {
    store::Error::Conflict {
        kind: KIND,
        name: ROUTER_CONFIG_MAP.to_string(),
    }
}

fn read(cm: &ConfigMap) -> anyhow::Result<Versioned<RouterConfig>> {
    let json = cm
        .data
        .as_ref()
        .and_then(|d| d.get(ROUTER_CONFIG_KEY))
        .with_context(|| format!("{ROUTER_CONFIG_MAP} has no {ROUTER_CONFIG_KEY} key"))?;
    let value = RouterConfig::from_json(json)
        .with_context(|| format!("invalid router configuration in {ROUTER_CONFIG_MAP}"))?;
    Ok(Versioned {
        value,
        version: cm.metadata.resource_version.clone().unwrap_or_default(),
    })
}

/// Replaces the router document, leaving the config map's other keys as-is.
fn write(cm: &mut ConfigMap, config: &RouterConfig) -> anyhow::Result<()> {
    let json = config.to_json()?;
    cm.data
        .get_or_insert_with(Default::default)
        .insert(ROUTER_CONFIG_KEY.to_string(), json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{core::RouterMode, k8s::ObjectMeta};
    use maplit::btreemap;

    fn config_map(data: Option<std::collections::BTreeMap<String, String>>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(ROUTER_CONFIG_MAP.to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            data,
            ..Default::default()
        }
    }

    #[test]
    fn reads_versioned_config() {
        let config = RouterConfig::new("site-a", RouterMode::Edge, "1.4.0");
        let cm = config_map(Some(btreemap! {
            ROUTER_CONFIG_KEY.to_string() => config.to_json().unwrap(),
        }));
        let Versioned { value, version } = read(&cm).unwrap();
        assert_eq!(value, config);
        assert_eq!(version, "42");
    }

    #[test]
    fn missing_or_invalid_document_is_an_error() {
        assert!(read(&config_map(None)).is_err());
        let cm = config_map(Some(btreemap! {
            ROUTER_CONFIG_KEY.to_string() => "{".to_string(),
        }));
        assert!(read(&cm).is_err());
    }

    #[test]
    fn write_keeps_other_keys() {
        let mut cm = config_map(Some(btreemap! {
            "other".to_string() => "x".to_string(),
        }));
        let config = RouterConfig::new("site-a", RouterMode::Interior, "1.4.0");
        write(&mut cm, &config).unwrap();
        let data = cm.data.as_ref().unwrap();
        assert_eq!(data["other"], "x");
        assert_eq!(read(&cm).unwrap().value, config);
    }
}
