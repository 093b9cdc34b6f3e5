use crate::k8s::{
    self, api::apps::v1::Deployment, Lease, ObjectMeta, OwnerReference, Patch, PatchParams,
    Resource,
};
use anyhow::{Context, Result};
use kubert::lease::{Claim, ClaimParams, LeaseManager};
use std::sync::Arc;
use tokio::{sync::watch, time::Duration};

const LEASE_NAME: &str = "fencing-controller-write";

/// Claims are held for this long without renewal.
const LEASE_DURATION: Duration = Duration::from_secs(30);

/// Claims are renewed this long before they would expire.
const RENEW_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Joins the election for the controller's write lease.
///
/// Only the holder of the lease executes fencing operations and writes Cluster
/// status; the returned receiver reports every change of holder.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<Claim>>> {
    let deployment = k8s::Api::<Deployment>::namespaced(runtime.client(), ns)
        .get(deployment_name)
        .await
        .with_context(|| format!("failed to fetch deployment {ns}/{deployment_name}"))?;
    let owner = deployment
        .controller_owner_ref(&())
        .context("controller deployment must have a name and uid")?;

    let api = k8s::Api::<Lease>::namespaced(runtime.client(), ns);
    create_if_missing(&api, mk_lease(ns, deployment_name, owner)).await?;

    let params = ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}

async fn create_if_missing(api: &k8s::Api<Lease>, lease: Lease) -> Result<()> {
    let params = PatchParams {
        field_manager: Some(crate::status::STATUS_CONTROLLER_NAME.to_string()),
        ..Default::default()
    };
    match api.patch(LEASE_NAME, &params, &Patch::Apply(lease)).await {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(error)) if error.code == 409 => {
            tracing::debug!("Lease already exists");
        }
        Err(error) => return Err(error).context("failed to create write lease"),
    }
    Ok(())
}

/// An empty Lease owned by the controller Deployment, so that it is deleted
/// along with the controller. The zero resource version makes the apply fail
/// with a conflict if the Lease already exists.
fn mk_lease(ns: &str, deployment_name: &str, owner: OwnerReference) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            resource_version: Some("0".to_string()),
            owner_references: Some(vec![owner]),
            labels: Some(
                std::iter::once((
                    "app.kubernetes.io/name".to_string(),
                    deployment_name.to_string(),
                ))
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn lease_is_owned_by_the_controller() {
        let owner = OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: "fencing-controller".to_string(),
            uid: "8d0a6f1e".to_string(),
            controller: Some(true),
            ..Default::default()
        };
        let lease = mk_lease("pg-system", "fencing-controller", owner.clone());

        assert_eq!(lease.metadata.name.as_deref(), Some(LEASE_NAME));
        assert_eq!(lease.metadata.namespace.as_deref(), Some("pg-system"));
        assert_eq!(lease.metadata.resource_version.as_deref(), Some("0"));
        assert_eq!(lease.metadata.owner_references, Some(vec![owner]));
        assert_eq!(
            lease.metadata.labels,
            Some(btreemap! {
                "app.kubernetes.io/name".to_string() => "fencing-controller".to_string(),
            })
        );
        assert!(lease.spec.is_none(), "the lease manager writes the spec");
    }
}
