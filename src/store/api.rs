use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, ResourceExt};
use serde_json::json;

use super::{Object, Repository, Selector, matches_selector, selector_string};
use crate::controller::{Error, Result};
use crate::resources::common::FIELD_MANAGER;

/// Repository over the API server. Reads are served from the reflector store
/// when one is attached, writes always go to the API server.
pub struct KubeRepository<K: Object> {
    client: Client,
    cache: Option<Store<K>>,
}

impl<K: Object> KubeRepository<K> {
    pub fn new(client: Client, cache: Option<Store<K>>) -> Self {
        Self { client, cache }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

fn api_error(e: kube::Error) -> Error {
    Error::from(e).classify()
}

#[async_trait]
impl<K: Object> Repository<K> for KubeRepository<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        if let Some(store) = &self.cache {
            let key = ObjectRef::new(name).within(namespace);
            return Ok(store.get(&key).map(|obj| (*obj).clone()));
        }
        self.api(namespace).get_opt(name).await.map_err(api_error)
    }

    async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>> {
        if let Some(store) = &self.cache {
            return Ok(store
                .state()
                .into_iter()
                .filter(|obj| obj.namespace().as_deref() == Some(namespace))
                .filter(|obj| matches_selector(obj.meta().labels.as_ref(), selector))
                .map(|obj| (*obj).clone())
                .collect());
        }
        let params = ListParams::default().labels(&selector_string(selector));
        let list = self.api(namespace).list(&params).await.map_err(api_error)?;
        Ok(list.items)
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K> {
        self.api(namespace)
            .create(&Self::post_params(), object)
            .await
            .map_err(api_error)
    }

    async fn replace(&self, namespace: &str, object: &K) -> Result<K> {
        let name = object
            .meta()
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        self.api(namespace)
            .replace(&name, &Self::post_params(), object)
            .await
            .map_err(api_error)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let params = DeleteParams::background();
        match self.api(namespace).delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = api_error(e);
                if err.is_not_found() { Ok(()) } else { Err(err) }
            }
        }
    }

    async fn replace_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<K> {
        let patch = json!({ "status": status });
        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(api_error)
    }
}
