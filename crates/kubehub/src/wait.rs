//! Bounded polling and the readiness conditions built on it.
//!
//! Every wait goes through [`poll_until`]: check immediately, then once per interval, and give up
//! with [`KilnError::Timeout`] once the deadline passes. Conditions are observation-only closures
//! and can be re-evaluated any number of times.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Pod;
use kiln_core::{KilnError, KilnResult};
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::ClusterOps;

/// A repeatable readiness check. `Ok(true)` ends the wait, `Err` aborts it.
pub type Condition<'a> = Box<dyn FnMut() -> BoxFuture<'a, KilnResult<bool>> + Send + 'a>;

/// Poll `condition` until it is satisfied, fails, or `timeout` elapses.
pub async fn poll_until<F, Fut>(interval: Duration, timeout: Duration, what: &str, mut condition: F) -> KilnResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KilnResult<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await? {
            debug!(what, "condition satisfied");
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            counter!("poll_timeouts", 1u64);
            return Err(KilnError::Timeout { what: what.to_string(), after: timeout });
        }
        trace!(what, "condition not met yet");
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

/// Whether a pod has started: containers past waiting, init containers finished,
/// phase Running or Succeeded. A Failed pod reads as not ready.
pub fn pod_is_running(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else { return false };
    let containers_started = status
        .container_statuses
        .iter()
        .flatten()
        .all(|c| c.state.as_ref().map(|s| s.waiting.is_none()).unwrap_or(true));
    let inits_done = status
        .init_container_statuses
        .iter()
        .flatten()
        .all(|c| c.state.as_ref().map(|s| s.waiting.is_none() && s.running.is_none()).unwrap_or(true));
    if !containers_started || !inits_done {
        return false;
    }
    match status.phase.as_deref() {
        Some("Running") | Some("Succeeded") => true,
        Some("Failed") => {
            warn!(pod = ?pod.metadata.name, ns = ?pod.metadata.namespace, "pod failed; still waiting");
            false
        }
        _ => false,
    }
}

pub fn pod_running<'a>(cluster: &'a dyn ClusterOps, namespace: &'a str, pod: &'a str) -> Condition<'a> {
    Box::new(move || {
        Box::pin(async move {
            match cluster.get_pod(namespace, pod).await {
                Ok(p) => Ok(pod_is_running(&p)),
                // not created yet
                Err(KilnError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            }
        })
    })
}

pub fn pod_exists<'a>(cluster: &'a dyn ClusterOps, namespace: &'a str, selector: &'a str) -> Condition<'a> {
    Box::new(move || Box::pin(async move { Ok(!cluster.list_pods(namespace, selector).await?.is_empty()) }))
}

/// Satisfied once a Get on the namespace reports not found. Any other error aborts.
pub fn namespace_gone<'a>(cluster: &'a dyn ClusterOps, namespace: &'a str) -> Condition<'a> {
    Box::new(move || Box::pin(async move { Ok(cluster.get_namespace(namespace).await?.is_none()) }))
}

pub fn job_completed<'a>(cluster: &'a dyn ClusterOps, namespace: &'a str, job: &'a str) -> Condition<'a> {
    Box::new(move || {
        Box::pin(async move {
            let j = cluster.get_job(namespace, job).await?;
            let want = j.spec.as_ref().and_then(|s| s.completions).unwrap_or(1);
            let done = j.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0);
            Ok(done >= want)
        })
    })
}

/// First load-balancer ingress IP (or hostname) of services matching `field_selector`.
pub async fn external_ip(cluster: &dyn ClusterOps, field_selector: &str) -> KilnResult<Option<String>> {
    let services = cluster.list_services(None, field_selector).await?;
    Ok(services
        .iter()
        .filter_map(|s| s.status.as_ref()?.load_balancer.as_ref()?.ingress.as_ref())
        .flatten()
        .find_map(|i| i.ip.clone().or_else(|| i.hostname.clone()))
        .filter(|ip| !ip.is_empty()))
}

pub fn external_ip_assigned<'a>(cluster: &'a dyn ClusterOps, field_selector: &'a str) -> Condition<'a> {
    Box::new(move || Box::pin(async move { Ok(external_ip(cluster, field_selector).await?.is_some()) }))
}

pub async fn wait_for_pod_running(
    cluster: &dyn ClusterOps,
    namespace: &str,
    pod: &str,
    interval: Duration,
    timeout: Duration,
) -> KilnResult<()> {
    let what = format!("pod {}/{} running", namespace, pod);
    poll_until(interval, timeout, &what, pod_running(cluster, namespace, pod)).await
}

pub async fn wait_until_pod_by_selector_exists(
    cluster: &dyn ClusterOps,
    namespace: &str,
    selector: &str,
    interval: Duration,
    timeout: Duration,
) -> KilnResult<()> {
    let what = format!("pod [{}] in {}", selector, namespace);
    poll_until(interval, timeout, &what, pod_exists(cluster, namespace, selector)).await
}

/// Wait for every pod currently matching `selector` to run. No match is an error.
pub async fn wait_for_pods_by_selector_running(
    cluster: &dyn ClusterOps,
    namespace: &str,
    selector: &str,
    interval: Duration,
    timeout: Duration,
) -> KilnResult<()> {
    let pods = cluster.list_pods(namespace, selector).await?;
    if pods.is_empty() {
        return Err(KilnError::NotFound(format!("no pods in {} match [{}]", namespace, selector)));
    }
    for name in pods.iter().filter_map(|p| p.metadata.name.as_deref()) {
        wait_for_pod_running(cluster, namespace, name, interval, timeout).await?;
    }
    Ok(())
}

/// Existence first, then readiness, each bounded by `timeout`.
pub async fn wait_for_workload(
    cluster: &dyn ClusterOps,
    namespace: &str,
    selector: &str,
    interval: Duration,
    timeout: Duration,
) -> KilnResult<()> {
    wait_until_pod_by_selector_exists(cluster, namespace, selector, interval, timeout).await?;
    wait_for_pods_by_selector_running(cluster, namespace, selector, interval, timeout).await
}

pub async fn wait_for_namespace_gone(
    cluster: &dyn ClusterOps,
    namespace: &str,
    interval: Duration,
    timeout: Duration,
) -> KilnResult<()> {
    let what = format!("namespace {} gone", namespace);
    poll_until(interval, timeout, &what, namespace_gone(cluster, namespace)).await
}

pub async fn wait_for_job_completed(
    cluster: &dyn ClusterOps,
    namespace: &str,
    job: &str,
    interval: Duration,
    timeout: Duration,
) -> KilnResult<()> {
    let what = format!("job {}/{} completed", namespace, job);
    poll_until(interval, timeout, &what, job_completed(cluster, namespace, job)).await
}

/// Wait for a load-balancer address and return it.
pub async fn wait_for_external_ip(
    cluster: &dyn ClusterOps,
    field_selector: &str,
    interval: Duration,
    timeout: Duration,
) -> KilnResult<String> {
    let what = format!("external ip for services [{}]", field_selector);
    poll_until(interval, timeout, &what, external_ip_assigned(cluster, field_selector)).await?;
    external_ip(cluster, field_selector)
        .await?
        .ok_or_else(|| KilnError::remote(format!("{} vanished after assignment", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeCluster;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateRunning, ContainerStateWaiting, ContainerStatus, PodStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn status(phase: &str, waiting: bool) -> PodStatus {
        let state = if waiting {
            ContainerState { waiting: Some(ContainerStateWaiting::default()), ..Default::default() }
        } else {
            ContainerState { running: Some(ContainerStateRunning::default()), ..Default::default() }
        };
        PodStatus {
            phase: Some(phase.into()),
            container_statuses: Some(vec![ContainerStatus { name: "main".into(), state: Some(state), ..Default::default() }]),
            ..Default::default()
        }
    }

    fn pod_with(status: PodStatus) -> Pod {
        Pod { status: Some(status), ..Default::default() }
    }

    #[test]
    fn running_requires_phase_and_started_containers() {
        assert!(pod_is_running(&pod_with(status("Running", false))));
        assert!(pod_is_running(&pod_with(status("Succeeded", false))));
        assert!(!pod_is_running(&pod_with(status("Running", true))));
        assert!(!pod_is_running(&pod_with(status("Pending", false))));
        assert!(!pod_is_running(&Pod::default()));
    }

    #[test]
    fn failed_pod_is_not_ready() {
        assert!(!pod_is_running(&pod_with(status("Failed", false))));
    }

    #[test]
    fn running_init_container_blocks() {
        let mut st = status("Running", false);
        st.init_container_statuses = Some(vec![ContainerStatus {
            name: "init".into(),
            state: Some(ContainerState { running: Some(ContainerStateRunning::default()), ..Default::default() }),
            ..Default::default()
        }]);
        assert!(!pod_is_running(&pod_with(st)));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_the_bound() {
        let calls = AtomicUsize::new(0);
        let start = Instant::now();
        let res = poll_until(Duration::from_secs(1), Duration::from_secs(5), "never", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(false) }
        })
        .await;
        let waited = start.elapsed();
        assert!(matches!(res, Err(KilnError::Timeout { .. })), "res={:?}", res);
        assert!(waited >= Duration::from_secs(5), "waited={:?}", waited);
        assert!(waited < Duration::from_secs(6), "waited={:?}", waited);
        // immediate check plus one per second
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_immediately_does_not_sleep() {
        let start = Instant::now();
        poll_until(Duration::from_secs(1), Duration::from_secs(5), "now", || async { Ok(true) }).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn condition_error_aborts() {
        let calls = AtomicUsize::new(0);
        let res = poll_until(Duration::from_secs(1), Duration::from_secs(5), "boom", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 2 {
                    Err(KilnError::remote("api down"))
                } else {
                    Ok(false)
                }
            }
        })
        .await;
        assert!(matches!(res, Err(KilnError::Remote(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn namespace_gone_waits_for_not_found() {
        let fake = FakeCluster::new();
        fake.create_namespace("kiln", FakeCluster::owned_labels()).await.unwrap();
        fake.delete_namespace("kiln").await.unwrap();
        wait_for_namespace_gone(&fake, "kiln", Duration::from_secs(1), Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn namespace_gone_aborts_on_other_errors() {
        let fake = FakeCluster::new();
        fake.fail_next("get_namespace", KilnError::remote("forbidden"));
        let res = wait_for_namespace_gone(&fake, "kiln", Duration::from_secs(1), Duration::from_secs(5)).await;
        assert!(matches!(res, Err(KilnError::Remote(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn selector_wait_requires_a_match() {
        let fake = FakeCluster::new();
        let res = wait_for_pods_by_selector_running(&fake, "ns", "app=x", Duration::from_secs(1), Duration::from_secs(2)).await;
        assert!(matches!(res, Err(KilnError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn external_ip_is_read_from_load_balancer() {
        let fake = FakeCluster::new();
        fake.add_load_balancer("traefik", "traefik", "198.51.100.4");
        let ip = wait_for_external_ip(&fake, "metadata.name=traefik", Duration::from_secs(1), Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(ip, "198.51.100.4");
    }
}
