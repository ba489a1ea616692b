//! Brings the objects owned by a `K3s` in line with its desired set.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::api::K3s;
use crate::desired::ChildObject;
use crate::error::{Error, Result};

/// Label carrying the UID of the owning `K3s`.
pub const OWNER_LABEL: &str = "k3s.ibtc.io/owner-uid";

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "k3s-operator";

/// Creates, updates and prunes the objects owned by a `K3s`.
#[async_trait::async_trait]
pub trait Apply: Send + Sync {
    /// Makes the owned objects match `objects` exactly. Callers never pass
    /// an empty set.
    async fn apply(&self, owner: &K3s, objects: &[ChildObject]) -> Result<()>;
}

/// [`Apply`] using server-side apply and owner references, so deleting the
/// `K3s` garbage collects everything it owns.
#[derive(Clone)]
pub struct KubeApply {
    client: kube::Client,
}

impl KubeApply {
    pub fn new(client: kube::Client) -> Self {
        KubeApply { client }
    }

    async fn apply_one<K>(&self, namespace: &str, mut object: K, owner: &Owner) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
    {
        {
            let meta = object.meta_mut();
            meta.owner_references = Some(vec![owner.reference.clone()]);
            meta.labels
                .get_or_insert_with(BTreeMap::new)
                .insert(OWNER_LABEL.to_string(), owner.uid.clone());
        }
        let name = object.name();
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&object),
        )
        .await?;
        debug!(kind = %K::kind(&()), %name, namespace, "Applied object");
        Ok(())
    }

    async fn prune<K>(&self, namespace: &str, owner: &Owner, keep: &BTreeSet<String>) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("{}={}", OWNER_LABEL, owner.uid));
        for object in api.list(&params).await? {
            let name = object.name();
            if keep.contains(&name) {
                continue;
            }
            match api
                .delete(&name, &DeleteParams::default())
                .await
                .map_err(Error::from)
            {
                Ok(_) => info!(kind = %K::kind(&()), %name, namespace, "Pruned object"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Apply for KubeApply {
    async fn apply(&self, owner: &K3s, objects: &[ChildObject]) -> Result<()> {
        let namespace = owner
            .namespace()
            .ok_or(Error::MissingMetadata("namespace"))?;
        let owner = Owner::of(owner)?;

        for object in objects {
            match object.clone() {
                ChildObject::Secret(o) => self.apply_one(&namespace, o, &owner).await?,
                ChildObject::Service(o) => self.apply_one(&namespace, o, &owner).await?,
                ChildObject::Deployment(o) => self.apply_one(&namespace, o, &owner).await?,
            }
        }

        self.prune::<Secret>(&namespace, &owner, &names_of_kind(objects, "Secret"))
            .await?;
        self.prune::<Service>(&namespace, &owner, &names_of_kind(objects, "Service"))
            .await?;
        self.prune::<Deployment>(&namespace, &owner, &names_of_kind(objects, "Deployment"))
            .await?;
        Ok(())
    }
}

struct Owner {
    uid: String,
    reference: OwnerReference,
}

impl Owner {
    fn of(k3s: &K3s) -> Result<Self> {
        let uid = k3s.uid().ok_or(Error::MissingMetadata("uid"))?;
        Ok(Owner {
            reference: OwnerReference {
                api_version: K3s::api_version(&()).to_string(),
                kind: K3s::kind(&()).to_string(),
                name: k3s.name(),
                uid: uid.clone(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            },
            uid,
        })
    }
}

fn names_of_kind(objects: &[ChildObject], kind: &str) -> BTreeSet<String> {
    objects
        .iter()
        .filter(|o| o.kind() == kind)
        .map(ChildObject::name)
        .collect()
}
