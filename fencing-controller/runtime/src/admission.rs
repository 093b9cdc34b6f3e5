use crate::{
    controller::Guards,
    core::{FencingSet, FencingState, InstanceId, RoleViolation, TopologyGuard},
    k8s::{Cluster, ResourceExt, ResourceId},
};
use anyhow::{anyhow, bail, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::{core::DynamicObject, Resource};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Validates `Cluster` changes against the fencing declaration's syntax and
/// the topology guard.
#[derive(Clone)]
pub struct Admission {
    guards: Guards,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
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
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req)
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(guards: Guards) -> Self {
        Self { guards }
    }

    fn admit(&self, req: AdmissionRequest) -> AdmissionResponse {
        if !is_kind::<Cluster>(&req) {
            return AdmissionResponse::invalid(format_args!(
                "unsupported resource type: {}.{}.{}",
                req.kind.group, req.kind.version, req.kind.kind
            ));
        }

        let rsp = AdmissionResponse::from(&req);
        let (old, new) = match parse_clusters(req) {
            Ok(clusters) => clusters,
            Err(error) => {
                info!(%error, "Failed to parse Cluster");
                return rsp.deny(error);
            }
        };

        let id = ResourceId::new(new.namespace().unwrap_or_default(), new.name_any());
        let guard = self.guards.read().get(&id).cloned();
        if let Err(error) = validate(guard.as_ref(), old.as_ref(), &new) {
            info!(%error, cluster = %id, "Denied");
            return rsp.deny(error);
        }

        rsp
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn parse_clusters(req: AdmissionRequest) -> Result<(Option<Cluster>, Cluster)> {
    let new = req
        .object
        .ok_or_else(|| anyhow!("admission request missing 'object'"))?
        .try_parse::<Cluster>()?;
    let old = req
        .old_object
        .map(|obj| obj.try_parse::<Cluster>())
        .transpose()?;
    Ok((old, new))
}

/// Rejects malformed fencing declarations and primary changes that involve a
/// fenced instance.
///
/// An instance counts as fenced when this controller's guard says so or when
/// the previously published status reports it as fenced, so that replicas that
/// do not hold the lease enforce the same constraint.
fn validate(guard: Option<&TopologyGuard>, old: Option<&Cluster>, new: &Cluster) -> Result<()> {
    FencingSet::from_annotation(new.fenced_instances())?;

    let Some(old) = old else {
        return Ok(());
    };
    let old_status = old.status.as_ref();
    let new_status = new.status.as_ref();
    let primaries = [
        (
            old_status.and_then(|s| s.current_primary.as_deref()),
            new_status.and_then(|s| s.current_primary.as_deref()),
        ),
        (
            old_status.and_then(|s| s.target_primary.as_deref()),
            new_status.and_then(|s| s.target_primary.as_deref()),
        ),
    ];
    for (from, to) in primaries {
        if from == to {
            continue;
        }
        let from = from.map(InstanceId::from);
        let to = to.map(InstanceId::from);
        if let Some(guard) = guard {
            guard.check_primary_change(from.as_ref(), to.as_ref())?;
        }
        for id in [from, to].into_iter().flatten() {
            if let Some(state) = published_fencing_state(old, &id) {
                bail!(RoleViolation::Frozen { instance: id, state });
            }
        }
    }

    Ok(())
}

/// Returns the instance's published state if it is fenced or being fenced.
fn published_fencing_state(cluster: &Cluster, id: &InstanceId) -> Option<FencingState> {
    let state = cluster
        .status
        .as_ref()?
        .fencing
        .as_ref()?
        .instances
        .get(id.as_str())?;
    [FencingState::FencingRequested, FencingState::Fenced]
        .into_iter()
        .find(|s| s.as_str() == state.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{
            executor::{Execute, ExecutionError},
            FencingSet, InstanceStatus, Observation, Reconciler, RetryPolicy, Role,
            RoleAssignment,
        },
        k8s::{ClusterSpec, ClusterStatus, FencingStatus},
    };
    use maplit::{btreemap, convert_args};

    struct Succeed;

    #[async_trait::async_trait]
    impl Execute for Succeed {
        async fn fence(&self, _: &InstanceId, _: Role) -> Result<(), ExecutionError> {
            Ok(())
        }

        async fn unfence(&self, _: &InstanceId, _: Role) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    fn mk_cluster(
        fenced_instances: Option<&str>,
        current_primary: &str,
        fencing: Option<FencingStatus>,
    ) -> Cluster {
        let mut cluster = Cluster::new("pg", ClusterSpec { instances: 3 });
        cluster.metadata.namespace = Some("db".to_string());
        cluster.metadata.annotations = fenced_instances.map(|v| {
            convert_args!(btreemap!(
                crate::k8s::labels::FENCED_INSTANCES_ANNOTATION => v,
            ))
        });
        cluster.status = Some(ClusterStatus {
            current_primary: Some(current_primary.to_string()),
            target_primary: Some(current_primary.to_string()),
            fencing,
        });
        cluster
    }

    async fn mk_guard(fenced: &str) -> TopologyGuard {
        let reconciler = Reconciler::new(Succeed, RetryPolicy::default());
        let instances = ["pg-1", "pg-2", "pg-3"]
            .into_iter()
            .map(|id| InstanceStatus {
                id: id.into(),
                ready: true,
                role: if id == "pg-1" {
                    Role::Primary
                } else {
                    Role::Replica
                },
                fence_marker: false,
            })
            .collect::<Vec<_>>();
        let roles = RoleAssignment::from_instances(&instances);
        reconciler
            .reconcile(&Observation {
                fencing: FencingSet::instances([fenced]),
                instances,
                roles,
            })
            .await;
        reconciler.guard()
    }

    #[test]
    fn rejects_malformed_declarations() {
        let cluster = mk_cluster(Some(r#"["*","pg-1"]"#), "pg-1", None);
        assert!(validate(None, None, &cluster).is_err());

        let cluster = mk_cluster(Some("pg-1"), "pg-1", None);
        assert!(validate(None, None, &cluster).is_err());

        let cluster = mk_cluster(Some(r#"["pg-1"]"#), "pg-1", None);
        assert!(validate(None, None, &cluster).is_ok());
    }

    #[tokio::test]
    async fn rejects_switchover_from_fenced_primary() {
        let guard = mk_guard("pg-1").await;
        let old = mk_cluster(Some(r#"["pg-1"]"#), "pg-1", None);
        let new = mk_cluster(Some(r#"["pg-1"]"#), "pg-2", None);
        let error = validate(Some(&guard), Some(&old), &new).unwrap_err();
        assert_eq!(
            error.to_string(),
            "instance pg-1 is Fenced; its role cannot change"
        );
    }

    #[tokio::test]
    async fn rejects_promotion_of_fenced_replica() {
        let guard = mk_guard("pg-2").await;
        let old = mk_cluster(Some(r#"["pg-2"]"#), "pg-1", None);
        let new = mk_cluster(Some(r#"["pg-2"]"#), "pg-2", None);
        assert!(validate(Some(&guard), Some(&old), &new).is_err());
    }

    #[tokio::test]
    async fn allows_switchover_between_unfenced_instances() {
        let guard = mk_guard("pg-3").await;
        let old = mk_cluster(Some(r#"["pg-3"]"#), "pg-1", None);
        let new = mk_cluster(Some(r#"["pg-3"]"#), "pg-2", None);
        assert!(validate(Some(&guard), Some(&old), &new).is_ok());
    }

    #[test]
    fn published_status_freezes_roles_without_guard() {
        let fencing = FencingStatus {
            instances: convert_args!(btreemap!(
                "pg-1" => "FencingRequested",
                "pg-2" => "Unfenced",
            )),
            converged: false,
        };
        let old = mk_cluster(Some(r#"["pg-1"]"#), "pg-1", Some(fencing.clone()));

        let new = mk_cluster(Some(r#"["pg-1"]"#), "pg-2", Some(fencing.clone()));
        assert!(validate(None, Some(&old), &new).is_err());

        // Unrelated updates pass.
        let new = mk_cluster(Some(r#"["pg-1"]"#), "pg-1", Some(fencing));
        assert!(validate(None, Some(&old), &new).is_ok());
    }
}
