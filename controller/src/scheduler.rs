//! One-shot job execution: admission under per-namespace in-flight caps, pod
//! startup tracking, cancellation, and the periodic sweep of terminal jobs.

use crate::build::Builder;
use crate::config::Config;
use crate::k8s::{
    api_error, labels, Cluster, DeleteParams, Event, Job, ListParams, Lock, PostParams,
    PropagationPolicy, ResourceExt,
};
use crate::registry::Registry;
use direktiv_functions_core::{sanitize_label, Error, FunctionDefinition, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, instrument, warn};

/// A pod that has not produced an IP within this bound is abandoned.
const POD_STARTUP_TIMEOUT: time::Duration = time::Duration::from_secs(30);

const CLEANER_INTERVAL: time::Duration = time::Duration::from_secs(60);

const CANCEL_GRACE_SECONDS: i64 = 30;

const CLEANER_LOCK_KEY: &str = "direktiv-job-cleaner";

pub struct Scheduler {
    cluster: Cluster,
    builder: Builder,
    registry: Registry,
    lock: Lock,
    config: Arc<Config>,
    gauge: Gauge,
}

/// The authoritative per-namespace in-flight job count.
///
/// Jobs are counted once: an admission reserves a slot, binding records the
/// created job's name, and the watch loop reconciles against cluster events.
/// Watch restarts rebuild the whole gauge, so double counting across a
/// restart window is impossible.
#[derive(Clone, Default)]
struct Gauge(Arc<Mutex<GaugeState>>);

#[derive(Default)]
struct GaugeState {
    /// Observed job name to owning namespace.
    jobs: HashMap<String, String>,
    /// In-flight count per namespace, covering observed jobs only.
    counts: HashMap<String, usize>,
    /// Admitted-but-not-yet-observed slots per namespace.
    reserved: HashMap<String, usize>,
}

// === impl Scheduler ===

impl Scheduler {
    pub fn new(
        cluster: Cluster,
        builder: Builder,
        registry: Registry,
        lock: Lock,
        config: Arc<Config>,
    ) -> Self {
        Self {
            cluster,
            builder,
            registry,
            lock,
            config,
            gauge: Gauge::default(),
        }
    }

    /// Drives the job watch that keeps the gauge current, and the periodic
    /// cleaner. Readiness is signalled once the initial job listing has been
    /// folded into the gauge.
    pub async fn run(self: Arc<Self>, ready: watch::Sender<bool>) {
        let params =
            ListParams::default().labels(&labels::selector(vec![(labels::JOB, "true")]));
        let mut jobs = self.cluster.watch_jobs(params);
        let mut cleaner = time::interval(CLEANER_INTERVAL);
        cleaner.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                ev = jobs.recv() => match ev {
                    Event::Applied(job) => {
                        if let Some(ns) = job_namespace(&job) {
                            self.gauge.applied(&job.name(), &ns);
                        }
                    }
                    Event::Deleted(job) => self.gauge.deleted(&job.name()),
                    Event::Restarted(list) => {
                        self.gauge.reset(
                            list.iter()
                                .filter_map(|j| job_namespace(j).map(|ns| (j.name(), ns))),
                        );
                        let _ = ready.send(true);
                    }
                },
                _ = cleaner.tick() => {
                    if self.config.pod_cleaner {
                        // Cleanup failures must never block new submissions.
                        if let Err(error) = self.clean().await {
                            warn!(%error, "Job cleanup failed");
                        }
                    }
                }
            }
        }
    }

    /// Schedules a one-shot execution and waits for its pod to come up.
    ///
    /// Returns the pod IP and the dashed-IP cluster hostname. Fails
    /// immediately when the namespace is at its cap; abandons and deletes the
    /// job when no pod IP appears within the startup deadline.
    #[instrument(skip(self, fd), fields(action = %action_id, namespace = %fd.namespace_name))]
    pub async fn create(
        &self,
        fd: &FunctionDefinition,
        action_id: &str,
        instance_id: &str,
        step: i64,
    ) -> Result<(String, String)> {
        fd.validate()?;
        let ns = sanitize_label(tenant(fd));
        self.gauge.admit(&ns, self.config.max_jobs)?;

        // Until the job exists the admission is only a reservation; give the
        // slot back on any failure before then.
        let job_name = match self.submit(fd, &ns, action_id, instance_id, step).await {
            Ok(name) => name,
            Err(error) => {
                self.gauge.unreserve(&ns);
                return Err(error);
            }
        };
        self.await_pod(&job_name).await
    }

    async fn submit(
        &self,
        fd: &FunctionDefinition,
        ns: &str,
        action_id: &str,
        instance_id: &str,
        step: i64,
    ) -> Result<String> {
        let pull = self.registry.pull_secret_names(ns).await?;
        let job = self.builder.job(fd, action_id, instance_id, step, &pull)?;
        let created = self
            .cluster
            .jobs()
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| api_error(e, action_id))?;
        let job_name = created.name();
        self.gauge.bind(ns, &job_name);
        debug!(%job_name, "Created job");
        Ok(job_name)
    }

    /// Waits for the job's pod to report an IP; a pod that never does is
    /// deleted along with its job.
    async fn await_pod(&self, job_name: &str) -> Result<(String, String)> {
        let mut pods = self.cluster.watch_pods(
            ListParams::default()
                .labels(&labels::selector(vec![(labels::JOB_NAME, job_name)])),
        );
        let mut seen_pod: Option<String> = None;
        let deadline = time::sleep(POD_STARTUP_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                ev = pods.recv() => {
                    let observed = match ev {
                        Event::Applied(pod) => vec![pod],
                        Event::Restarted(pods) => pods,
                        Event::Deleted(_) => continue,
                    };
                    for pod in observed {
                        seen_pod = Some(pod.name());
                        let ip = pod
                            .status
                            .as_ref()
                            .and_then(|s| s.pod_ip.clone())
                            .unwrap_or_default();
                        if !ip.is_empty() {
                            let hostname = format!(
                                "{}.{}.pod",
                                ip.replace('.', "-"),
                                self.cluster.namespace()
                            );
                            return Ok((ip, hostname));
                        }
                    }
                }
                _ = &mut deadline => {
                    self.remove_job(&job_name).await;
                    if let Some(pod) = seen_pod {
                        if let Err(error) = self
                            .cluster
                            .pods()
                            .delete(&pod, &DeleteParams::default())
                            .await
                        {
                            warn!(%error, %pod, "Failed to delete abandoned pod");
                        }
                    }
                    return Err(Error::Timeout(format!("pod startup for job {}", job_name)));
                }
            }
        }
    }

    /// Bulk-deletes every job created for an action.
    #[instrument(skip(self))]
    pub async fn cancel(&self, action_id: &str) -> Result<()> {
        let params = ListParams::default().labels(&labels::selector(vec![(
            labels::ACTION_ID,
            sanitize_label(action_id),
        )]));
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            grace_period_seconds: Some(CANCEL_GRACE_SECONDS),
            ..Default::default()
        };
        self.cluster
            .jobs()
            .delete_collection(&dp, &params)
            .await
            .map(|_| ())
            .map_err(|e| api_error(e, action_id))
    }

    /// Deletes terminal jobs. Runs under a non-blocking lock so concurrent
    /// control planes do not sweep the same set.
    async fn clean(&self) -> Result<()> {
        let grant = match self.lock.try_acquire(CLEANER_LOCK_KEY).await? {
            Some(grant) => grant,
            None => return Ok(()),
        };
        let result = self.clean_locked().await;
        if let Err(error) = self.lock.release(&grant).await {
            warn!(%error, "Failed to release cleaner lock");
        }
        result
    }

    async fn clean_locked(&self) -> Result<()> {
        let params =
            ListParams::default().labels(&labels::selector(vec![(labels::JOB, "true")]));
        let jobs = self
            .cluster
            .jobs()
            .list(&params)
            .await
            .map_err(|e| api_error(e, "jobs"))?;

        for job in jobs.items {
            if !job_finished(&job) {
                continue;
            }
            let name = job.name();
            let dp = DeleteParams {
                propagation_policy: Some(PropagationPolicy::Background),
                ..Default::default()
            };
            match self.cluster.jobs().delete(&name, &dp).await {
                Ok(_) => debug!(job = %name, "Swept terminal job"),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(error) => warn!(%error, job = %name, "Failed to sweep job"),
            }
        }
        Ok(())
    }

    async fn remove_job(&self, name: &str) {
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match self.cluster.jobs().delete(name, &dp).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(error) => warn!(%error, job = %name, "Failed to delete job"),
        }
    }
}

// === impl Gauge ===

impl Gauge {
    /// Admits a new job or rejects immediately at the cap. An admission holds
    /// a reserved slot until `bind` or `unreserve`.
    fn admit(&self, ns: &str, max_jobs: usize) -> Result<()> {
        let mut state = self.0.lock();
        let in_flight =
            state.counts.get(ns).copied().unwrap_or(0) + state.reserved.get(ns).copied().unwrap_or(0);
        if in_flight >= max_jobs {
            return Err(Error::MaxJobsExceeded(ns.to_string()));
        }
        *state.reserved.entry(ns.to_string()).or_insert(0) += 1;
        Ok(())
    }

    /// Converts a reservation into an observed job. A watch event may have
    /// arrived first; the job is only counted once either way.
    fn bind(&self, ns: &str, job: &str) {
        let mut state = self.0.lock();
        state.release_reservation(ns);
        state.observe(job, ns);
    }

    /// Drops a reservation whose job was never created.
    fn unreserve(&self, ns: &str) {
        self.0.lock().release_reservation(ns);
    }

    fn applied(&self, job: &str, ns: &str) {
        self.0.lock().observe(job, ns);
    }

    fn deleted(&self, job: &str) {
        let mut state = self.0.lock();
        if let Some(ns) = state.jobs.remove(job) {
            state.decrement(&ns);
        }
    }

    /// Rebuilds the observed set from a full listing.
    fn reset(&self, jobs: impl IntoIterator<Item = (String, String)>) {
        let mut state = self.0.lock();
        state.jobs.clear();
        state.counts.clear();
        for (job, ns) in jobs {
            state.observe(&job, &ns);
        }
    }

    fn count(&self, ns: &str) -> usize {
        let state = self.0.lock();
        state.counts.get(ns).copied().unwrap_or(0) + state.reserved.get(ns).copied().unwrap_or(0)
    }
}

impl GaugeState {
    fn observe(&mut self, job: &str, ns: &str) {
        if self
            .jobs
            .insert(job.to_string(), ns.to_string())
            .is_none()
        {
            *self.counts.entry(ns.to_string()).or_insert(0) += 1;
        }
    }

    fn decrement(&mut self, ns: &str) {
        if let Some(count) = self.counts.get_mut(ns) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts.remove(ns);
            }
        }
    }

    fn release_reservation(&mut self, ns: &str) {
        if let Some(reserved) = self.reserved.get_mut(ns) {
            *reserved = reserved.saturating_sub(1);
            if *reserved == 0 {
                self.reserved.remove(ns);
            }
        }
    }
}

fn tenant(fd: &FunctionDefinition) -> &str {
    if fd.namespace_name.is_empty() {
        &fd.namespace
    } else {
        &fd.namespace_name
    }
}

fn job_namespace(job: &Job) -> Option<String> {
    job.metadata.labels.get(labels::NAMESPACE_NAME).cloned()
}

/// A job is terminal once nothing is active and at least one pod finished.
fn job_finished(job: &Job) -> bool {
    job.status
        .as_ref()
        .map(|s| {
            s.active.unwrap_or(0) == 0
                && (s.succeeded.unwrap_or(0) > 0 || s.failed.unwrap_or(0) > 0)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn gauge_rejects_at_the_cap() {
        let gauge = Gauge::default();
        gauge.admit("n1", 2).unwrap();
        gauge.admit("n1", 2).unwrap();
        assert!(matches!(
            gauge.admit("n1", 2),
            Err(Error::MaxJobsExceeded(ns)) if ns == "n1"
        ));

        // Other namespaces are unaffected.
        gauge.admit("n2", 2).unwrap();
    }

    #[test]
    fn gauge_frees_a_slot_when_a_job_ends() {
        let gauge = Gauge::default();
        gauge.admit("n1", 1).unwrap();
        gauge.bind("n1", "job-a");
        assert!(gauge.admit("n1", 1).is_err());

        gauge.deleted("job-a");
        gauge.admit("n1", 1).unwrap();
    }

    #[test]
    fn gauge_counts_a_job_once_across_bind_and_watch() {
        let gauge = Gauge::default();
        gauge.admit("n1", 2).unwrap();
        // The watch observes the job before the creator binds it.
        gauge.applied("job-a", "n1");
        gauge.bind("n1", "job-a");
        assert_eq!(gauge.count("n1"), 1);

        // And in the opposite order.
        gauge.admit("n1", 2).unwrap();
        gauge.bind("n1", "job-b");
        gauge.applied("job-b", "n1");
        assert_eq!(gauge.count("n1"), 2);
    }

    #[test]
    fn gauge_rebuild_does_not_double_count() {
        let gauge = Gauge::default();
        gauge.admit("n1", 10).unwrap();
        gauge.bind("n1", "job-a");
        gauge.applied("job-b", "n1");

        // A watch restart re-lists everything already observed.
        gauge.reset(vec![
            ("job-a".to_string(), "n1".to_string()),
            ("job-b".to_string(), "n1".to_string()),
        ]);
        assert_eq!(gauge.count("n1"), 2);

        // A restart that no longer sees a job drops it.
        gauge.reset(vec![("job-b".to_string(), "n1".to_string())]);
        assert_eq!(gauge.count("n1"), 1);
    }

    #[test]
    fn gauge_aborted_admission_frees_the_slot() {
        let gauge = Gauge::default();
        gauge.admit("n1", 1).unwrap();
        gauge.unreserve("n1");
        gauge.admit("n1", 1).unwrap();
    }

    fn mk_job(active: i32, succeeded: i32, failed: i32) -> Job {
        Job {
            metadata: ObjectMeta::default(),
            status: Some(JobStatus {
                active: Some(active),
                succeeded: Some(succeeded),
                failed: Some(failed),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn finished_jobs_are_terminal_only() {
        assert!(job_finished(&mk_job(0, 1, 0)));
        assert!(job_finished(&mk_job(0, 0, 1)));
        assert!(!job_finished(&mk_job(1, 0, 0)));
        assert!(!job_finished(&mk_job(0, 0, 0)));
        assert!(!job_finished(&Job::default()));
    }
}
