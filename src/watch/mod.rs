//! Resource readiness watcher
//!
//! Blocks a lifecycle call until a freshly created or recreated object
//! satisfies a readiness predicate, without polling. The watch is opened
//! after the triggering write, starting at the resource version that write
//! returned, so the write itself is never re-delivered.
//!
//! Only `MODIFIED` events are expected while waiting. Anything else means the
//! object was replaced or removed underneath us and fails the wait at once.
//! Bookmarks carry no object and are skipped.

use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::Resource;
use tracing::debug;

use crate::kubecluster::{ClusterClient, EventStream, ObjectEvent};
use crate::validation::validate_label_selector;
use crate::{label_selector, Error, Result};
use crate::{AGENT_ID_LABEL, BOSH_JOB_CONTAINER, DISK_ID_LABEL};

/// Pause before reopening a watch the server closed
const REOPEN_DELAY: Duration = Duration::from_secs(1);

/// Watch until an object satisfies `ready` or `timeout` elapses
///
/// `open` opens a watch starting after the given resource version. The API
/// server ends every watch after its own timeout, so a stream that closes
/// before the deadline is reopened from the last resource version seen.
/// Reopening shares the one deadline with the events.
///
/// `operation` names the wait in the timeout error ("Pod create"); `kind`
/// names the watched object kind in protocol errors. Each stream is dropped
/// on every return path, which closes the server-side watch.
pub async fn wait_until<K, O, Fut, F>(
    mut open: O,
    resource_version: &str,
    kind: &'static str,
    operation: &str,
    timeout: Duration,
    mut ready: F,
) -> Result<K>
where
    K: Resource,
    O: FnMut(String) -> Fut,
    Fut: Future<Output = Result<EventStream<K>>>,
    F: FnMut(&K) -> bool,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut resource_version = resource_version.to_string();
    let mut reopening = false;

    loop {
        let mut events = tokio::select! {
            opened = async {
                if reopening {
                    tokio::time::sleep(REOPEN_DELAY).await;
                }
                open(resource_version.clone()).await
            } => opened?,
            _ = &mut deadline => return Err(Error::timeout(operation, timeout)),
        };

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(ObjectEvent::Modified(obj))) => {
                        if ready(&obj) {
                            return Ok(obj);
                        }
                        if let Some(rv) = obj.meta().resource_version.clone() {
                            resource_version = rv;
                        }
                        debug!(kind, operation, "object modified but not ready yet");
                    }
                    Some(Ok(ObjectEvent::Bookmark)) => {
                        debug!(kind, operation, "ignoring watch bookmark");
                    }
                    Some(Ok(other)) => {
                        return Err(Error::UnexpectedEvent {
                            kind,
                            event: other.to_string(),
                        });
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        debug!(kind, operation, %resource_version, "watch closed by server, reopening");
                        break;
                    }
                },
                _ = &mut deadline => return Err(Error::timeout(operation, timeout)),
            }
        }
        reopening = true;
    }
}

// =============================================================================
// Readiness predicates
// =============================================================================

/// A claim is ready once the control plane bound it to a volume
pub fn claim_is_bound(claim: &PersistentVolumeClaim) -> bool {
    claim
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Bound")
}

/// A deployment is ready once the controller observed the latest spec and
/// every requested replica is available
pub fn deployment_is_available(deployment: &Deployment) -> bool {
    let generation = deployment.metadata.generation.unwrap_or(0);
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);

    deployment.status.as_ref().is_some_and(|status| {
        status.observed_generation.unwrap_or(0) >= generation
            && status.available_replicas.unwrap_or(0) == desired
    })
}

/// A pod is ready once it is running and the job container is ready and
/// in the running state
pub fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }

    status
        .container_statuses
        .iter()
        .flatten()
        .filter(|cs| cs.name == BOSH_JOB_CONTAINER)
        .any(|cs| {
            cs.ready
                && cs
                    .state
                    .as_ref()
                    .is_some_and(|state| state.running.is_some())
        })
}

// =============================================================================
// Call-site waits
// =============================================================================

fn selector_for(key: &str, value: &str) -> Result<String> {
    let selector = label_selector(key, value);
    validate_label_selector(&selector).map_err(Error::validation)?;
    Ok(selector)
}

/// Wait for the claim labelled with `disk_id` to be bound
pub async fn wait_for_claim_bound(
    client: &dyn ClusterClient,
    disk_id: &str,
    resource_version: &str,
    timeout: Duration,
) -> Result<PersistentVolumeClaim> {
    let selector = &selector_for(DISK_ID_LABEL, disk_id)?;
    let open = move |rv: String| async move {
        client
            .watch_claims(selector, &rv)
            .await
            .map_err(|e| Error::wrap("Watching claim", e))
    };
    wait_until(
        open,
        resource_version,
        "PersistentVolumeClaim",
        "Disk creation",
        timeout,
        claim_is_bound,
    )
    .await
}

/// Wait for the deployment labelled with `agent_id` to become available
pub async fn wait_for_deployment_available(
    client: &dyn ClusterClient,
    agent_id: &str,
    resource_version: &str,
    timeout: Duration,
) -> Result<Deployment> {
    let selector = &selector_for(AGENT_ID_LABEL, agent_id)?;
    let open = move |rv: String| async move {
        client
            .watch_deployments(selector, &rv)
            .await
            .map_err(|e| Error::wrap("Watching deployment", e))
    };
    wait_until(
        open,
        resource_version,
        "Deployment",
        "Deployment creation",
        timeout,
        deployment_is_available,
    )
    .await
}

/// Wait for the pod labelled with `agent_id` to report ready
pub async fn wait_for_pod_ready(
    client: &dyn ClusterClient,
    agent_id: &str,
    resource_version: &str,
    timeout: Duration,
) -> Result<Pod> {
    let selector = &selector_for(AGENT_ID_LABEL, agent_id)?;
    let open = move |rv: String| async move {
        client
            .watch_pods(selector, &rv)
            .await
            .map_err(|e| Error::wrap("Watching pod", e))
    };
    wait_until(open, resource_version, "Pod", "Pod create", timeout, pod_is_ready).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kubecluster::MockClusterClient;
    use futures::{future, stream};
    use mockall::Sequence;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateWaiting, ContainerStatus,
        PersistentVolumeClaimStatus, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use tokio::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(300);

    pub(crate) fn claim(phase: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub(crate) fn deployment(generation: i64, observed: i64, replicas: i32, available: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(observed),
                available_replicas: Some(available),
                ..Default::default()
            }),
        }
    }

    pub(crate) fn pod(phase: &str, container: &str, ready: bool, running: bool) -> Pod {
        let state = if running {
            ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }
        } else {
            ContainerState {
                waiting: Some(ContainerStateWaiting::default()),
                ..Default::default()
            }
        };
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: container.to_string(),
                    ready,
                    state: Some(state),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Opener that hands out `events` on the first open only
    fn once<K: Send + 'static>(
        events: EventStream<K>,
    ) -> impl FnMut(String) -> future::Ready<Result<EventStream<K>>> {
        let mut events = Some(events);
        move |_| future::ready(Ok(events.take().unwrap_or_else(|| stream::pending().boxed())))
    }

    /// Events followed by a stream that never ends
    pub(crate) fn then_silence<K: Send + 'static>(events: Vec<ObjectEvent<K>>) -> EventStream<K> {
        stream::iter(events.into_iter().map(Ok))
            .chain(stream::pending())
            .boxed()
    }

    // =========================================================================
    // Predicates
    // =========================================================================

    #[test]
    fn test_claim_bound_only_in_bound_phase() {
        assert!(claim_is_bound(&claim("Bound")));
        assert!(!claim_is_bound(&claim("Pending")));
        assert!(!claim_is_bound(&PersistentVolumeClaim::default()));
    }

    #[test]
    fn test_deployment_needs_observed_generation_and_replicas() {
        assert!(deployment_is_available(&deployment(2, 2, 2, 2)));
        assert!(deployment_is_available(&deployment(2, 3, 2, 2)));
        assert!(!deployment_is_available(&deployment(3, 2, 2, 2)));
        assert!(!deployment_is_available(&deployment(2, 2, 2, 1)));
        assert!(!deployment_is_available(&Deployment::default()));
    }

    #[test]
    fn test_pod_needs_running_phase_and_ready_running_job_container() {
        assert!(pod_is_ready(&pod("Running", BOSH_JOB_CONTAINER, true, true)));
        assert!(!pod_is_ready(&pod("Pending", BOSH_JOB_CONTAINER, true, true)));
        assert!(!pod_is_ready(&pod("Running", BOSH_JOB_CONTAINER, false, true)));
        assert!(!pod_is_ready(&pod("Running", BOSH_JOB_CONTAINER, true, false)));
        assert!(!pod_is_ready(&pod("Running", "sidecar", true, true)));
        assert!(!pod_is_ready(&Pod::default()));
    }

    // =========================================================================
    // wait_until
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_returns_on_first_ready_modification() {
        let start = Instant::now();
        let events = then_silence(vec![
            ObjectEvent::Modified(claim("Pending")),
            ObjectEvent::Modified(claim("Bound")),
        ]);

        let got = wait_until(once(events), "1", "PersistentVolumeClaim", "Disk creation", TIMEOUT, claim_is_bound)
            .await
            .unwrap();

        assert!(claim_is_bound(&got));
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_the_configured_duration() {
        let start = Instant::now();
        let events = then_silence(vec![ObjectEvent::Modified(claim("Pending"))]);

        let err = wait_until(once(events), "1", "PersistentVolumeClaim", "Disk creation", TIMEOUT, claim_is_bound)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Disk creation failed with a timeout after 300s");
        assert!(start.elapsed() >= TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_event_fails_immediately() {
        let start = Instant::now();
        let events = then_silence(vec![ObjectEvent::Deleted(pod("Running", BOSH_JOB_CONTAINER, true, true))]);

        let err = wait_until(once(events), "1", "Pod", "Pod create", TIMEOUT, pod_is_ready)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnexpectedEvent { kind: "Pod", ref event } if event == "DELETED"));
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_event_is_a_protocol_violation() {
        let events = then_silence::<Pod>(vec![ObjectEvent::Error("too old resource version".to_string())]);

        let err = wait_until(once(events), "1", "Pod", "Pod create", TIMEOUT, pod_is_ready)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("too old resource version"));
        assert!(!err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bookmarks_are_skipped() {
        let events = then_silence(vec![
            ObjectEvent::Bookmark,
            ObjectEvent::Modified(claim("Bound")),
        ]);

        let got = wait_until(once(events), "1", "PersistentVolumeClaim", "Disk creation", TIMEOUT, claim_is_bound)
            .await
            .unwrap();
        assert!(claim_is_bound(&got));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_errors_propagate() {
        let events: EventStream<Pod> =
            stream::iter(vec![Err(Error::validation("decode failure"))]).boxed();

        let err = wait_until(once(events), "1", "Pod", "Pod create", TIMEOUT, pod_is_ready)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_is_released_on_every_exit() {
        for outcome in ["ready", "unexpected", "timeout"] {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<ObjectEvent<PersistentVolumeClaim>>();
            let events: EventStream<PersistentVolumeClaim> =
                stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (Ok(ev), rx)) })
                    .boxed();

            match outcome {
                "ready" => tx.send(ObjectEvent::Modified(claim("Bound"))).unwrap(),
                "unexpected" => tx.send(ObjectEvent::Added(claim("Bound"))).unwrap(),
                _ => {}
            }

            let _ = wait_until(once(events), "1", "PersistentVolumeClaim", "Disk creation", TIMEOUT, claim_is_bound).await;
            assert!(tx.is_closed(), "stream still open after {outcome}");
        }
    }

    // =========================================================================
    // Call-site waits
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_pod_wait_watches_agent_selector_from_resource_version() {
        let mut client = MockClusterClient::new();
        client
            .expect_watch_pods()
            .withf(|selector, rv| selector == "bosh.cloudfoundry.org/agent-id=agent-guid" && rv == "42")
            .times(1)
            .returning(|_, _| {
                Ok(then_silence(vec![ObjectEvent::Modified(pod(
                    "Running",
                    BOSH_JOB_CONTAINER,
                    true,
                    true,
                ))]))
            });

        let ready = wait_for_pod_ready(&client, "agent-guid", "42", TIMEOUT)
            .await
            .unwrap();
        assert!(pod_is_ready(&ready));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deployment_wait_uses_its_own_timeout_name() {
        let mut client = MockClusterClient::new();
        client
            .expect_watch_deployments()
            .returning(|_, _| Ok(then_silence(vec![ObjectEvent::Modified(deployment(1, 1, 2, 1))])));

        let err = wait_for_deployment_available(&client, "agent-guid", "7", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Deployment creation failed with a timeout after 30s"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_watch_is_reopened_from_last_seen_version() {
        let mut pending = pod("Pending", BOSH_JOB_CONTAINER, false, false);
        pending.metadata.resource_version = Some("43".to_string());

        let mut seq = Sequence::new();
        let mut client = MockClusterClient::new();
        client
            .expect_watch_pods()
            .withf(|_, rv| rv == "42")
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| {
                Ok(stream::iter(vec![Ok(ObjectEvent::Modified(pending.clone()))]).boxed())
            });
        client
            .expect_watch_pods()
            .withf(|selector, rv| selector == "bosh.cloudfoundry.org/agent-id=agent-guid" && rv == "43")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(then_silence(vec![ObjectEvent::Modified(pod(
                    "Running",
                    BOSH_JOB_CONTAINER,
                    true,
                    true,
                ))]))
            });

        let start = Instant::now();
        let ready = wait_for_pod_ready(&client, "agent-guid", "42", TIMEOUT)
            .await
            .unwrap();
        assert!(pod_is_ready(&ready));
        assert!(start.elapsed() < TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_holds_across_reopened_watches() {
        let timeout = Duration::from_secs(10);
        let opens = Arc::new(AtomicUsize::new(0));
        let counter = opens.clone();

        let mut client = MockClusterClient::new();
        client.expect_watch_claims().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(stream::iter(vec![Ok(ObjectEvent::Modified(claim("Pending")))]).boxed())
        });

        let start = Instant::now();
        let err = wait_for_claim_bound(&client, "disk-guid", "1", timeout)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Disk creation failed with a timeout after 10s");
        assert!(start.elapsed() >= timeout);
        assert!(opens.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_malformed_selector_never_opens_a_watch() {
        let mut client = MockClusterClient::new();
        client.expect_watch_claims().never();

        let err = wait_for_claim_bound(&client, "bad id!", "1", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_watch_open_failure_is_wrapped() {
        let mut client = MockClusterClient::new();
        client
            .expect_watch_claims()
            .returning(|_, _| Err(Error::client("bosh", "connection refused")));

        let err = wait_for_claim_bound(&client, "disk-guid", "1", TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Watching claim: "));
    }
}
