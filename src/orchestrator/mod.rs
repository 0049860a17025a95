//! Provisioning run driver.
//!
//! The orchestrator walks the dependency plan tier by tier and drives each
//! component through the [`ComponentState`] machine:
//!
//! ```text
//! Pending → Probing → Satisfied
//!                   → Cleaning → Installing → Verifying → Satisfied | Failed
//! Pending → SkippedDependency
//! ```
//!
//! Inside a tier, optional components that hold no exclusive resource and
//! own disjoint paths run concurrently on scoped worker threads; everything
//! else runs in sequence. Workers report back over a channel and the
//! orchestrator alone owns the outcome table.

#![allow(missing_docs)]

pub mod signals;
pub mod state;
pub mod summary;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::core::config::Config;
use crate::core::errors::{DvsError, Result};
use crate::core::paths::paths_overlap;
use crate::installer::cleanup::{CleanupReport, StepOutcome};
use crate::installer::{CleanupAgent, ComponentInstaller, Fetcher, InstallContext, InstallOutcome};
use crate::logger::ActivityLog;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::platform::env::Environment;
use crate::platform::pal::{CommandRunner, HostFacts};
use crate::probe::{HealthCheck, VersionProbe};
use crate::profile::{Mutation, ProfileMutator};
use crate::registry::plan::Plan;
use crate::registry::{Component, Registry, TemplateContext};

pub use signals::CancelFlag;
pub use state::{ComponentState, ProgressSink, SilentProgress};
pub use summary::{ComponentReport, RunSummary, SummaryCounts};

/// Clean+install cycles per component: the first attempt plus one retry
/// after a failed verification.
const MAX_ATTEMPTS: u32 = 2;

static NO_LOG: ActivityLog = ActivityLog::disabled();
static SILENT: SilentProgress = SilentProgress;

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Restrict the run to these components and their dependencies.
    pub only: Option<Vec<String>>,
    pub dry_run: bool,
    pub jobs: usize,
    pub fetch_timeout: Duration,
    pub probe_timeout: Duration,
    pub staging_dir: Option<PathBuf>,
    /// Effective-config hash recorded in `run_start`.
    pub config_hash: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            only: None,
            dry_run: false,
            jobs: 4,
            fetch_timeout: Duration::from_secs(600),
            probe_timeout: Duration::from_secs(30),
            staging_dir: None,
            config_hash: None,
        }
    }
}

impl RunOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            only: None,
            dry_run: config.run.dry_run,
            jobs: config.run.jobs,
            fetch_timeout: config.run.fetch_timeout(),
            probe_timeout: config.run.probe_timeout(),
            staging_dir: config.paths.staging_dir.clone(),
            config_hash: config.stable_hash().ok(),
        }
    }
}

/// One row of `devstation status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    pub name: String,
    pub required: bool,
    pub enabled: bool,
    pub desired: String,
    pub method: &'static str,
    pub health: HealthCheck,
    /// Managed profile block present with the expected content.
    pub profile_block: bool,
}

/// Run-wide resources shared by every worker.
struct Shared {
    env: RwLock<Environment>,
    profile: Mutex<ProfileMutator>,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
}

impl Shared {
    fn new(profile: ProfileMutator, env: Environment) -> Self {
        Self {
            env: RwLock::new(env),
            profile: Mutex::new(profile),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn abort(&self, reason: String) {
        let mut slot = self.abort_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.aborted.store(true, Ordering::SeqCst);
    }
}

pub struct Orchestrator<'a> {
    registry: &'a Registry,
    host: &'a HostFacts,
    runner: &'a dyn CommandRunner,
    fetcher: &'a dyn Fetcher,
    options: RunOptions,
    log: &'a ActivityLog,
    progress: &'a dyn ProgressSink,
    cancel: CancelFlag,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(
        registry: &'a Registry,
        host: &'a HostFacts,
        runner: &'a dyn CommandRunner,
        fetcher: &'a dyn Fetcher,
    ) -> Self {
        Self {
            registry,
            host,
            runner,
            fetcher,
            options: RunOptions::default(),
            log: &NO_LOG,
            progress: &SILENT,
            cancel: CancelFlag::new(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_log(mut self, log: &'a ActivityLog) -> Self {
        self.log = log;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub const fn options(&self) -> &RunOptions {
        &self.options
    }

    /// The plan this orchestrator would execute.
    pub fn plan(&self) -> Result<Plan> {
        self.registry.plan(self.options.only.as_deref())
    }

    // ──────────────────── provision ────────────────────

    /// Provision every planned component.
    ///
    /// Only planning and the initial profile read can fail; everything that
    /// happens to individual components is recorded in the summary.
    pub fn run(&self, profile: ProfileMutator, mut env: Environment) -> Result<RunSummary> {
        let started = Instant::now();
        let plan = self.plan()?;
        let seeded = self.seed_environment(&plan, &profile, &mut env)?;

        self.log.record(
            &LogEntry::new(EventType::RunStart, Severity::Info).details(format!(
                "components={} tiers={} jobs={} dry_run={} seeded={} config_hash={}",
                plan.len(),
                plan.tiers.len(),
                self.options.jobs,
                self.options.dry_run,
                seeded,
                self.options.config_hash.as_deref().unwrap_or("-"),
            )),
        );

        let shared = Shared::new(profile, env);
        let mut states: HashMap<String, ComponentState> = HashMap::new();
        let mut summary = RunSummary {
            dry_run: self.options.dry_run,
            ..RunSummary::default()
        };

        for tier in &plan.tiers {
            let mut runnable = Vec::new();
            for name in tier {
                let Some(component) = self.registry.get(name) else {
                    continue;
                };
                let gated = self
                    .stop_reason(&shared)
                    .map(str::to_string)
                    .or_else(|| {
                        self.unsatisfied_dependency(component, &states)
                            .map(|dep| format!("dependency unsatisfied: {dep}"))
                    });
                match gated {
                    Some(reason) => {
                        let report = self.skip(component, reason);
                        self.progress.finished(&report);
                        states.insert(report.name.clone(), report.state);
                        summary.components.push(report);
                    }
                    None => runnable.push(component),
                }
            }

            let (batch, sequential) = self.partition(&runnable, &shared.env.read());
            let mut finished = self.run_batch(&batch, &shared);
            for component in sequential {
                finished.push(self.run_one(component, &shared));
            }
            for report in finished {
                states.insert(report.name.clone(), report.state);
                summary.components.push(report);
            }
        }

        summary.sort_by_plan(plan.order());
        summary.cancelled = self.cancel.is_cancelled();
        summary.aborted = shared.is_aborted();
        summary.abort_reason = shared.abort_reason.lock().clone();
        summary.profile_backup = shared
            .profile
            .lock()
            .backup_path()
            .map(|p| p.display().to_string());
        summary.duration_ms = elapsed_ms(started);

        let counts = summary.counts();
        self.log.record(
            &LogEntry::new(
                EventType::RunComplete,
                if summary.success() {
                    Severity::Info
                } else {
                    Severity::Warning
                },
            )
            .ok(summary.success())
            .duration(started.elapsed())
            .details(format!(
                "already_satisfied={} installed={} skipped={} failed={} cancelled={} aborted={}",
                counts.already_satisfied,
                counts.installed,
                counts.skipped,
                counts.failed,
                summary.cancelled,
                summary.aborted,
            )),
        );
        self.log.sync();
        Ok(summary)
    }

    /// Split runnable components into a concurrent batch and a sequential
    /// remainder.
    fn partition<'c>(
        &self,
        runnable: &[&'c Component],
        env: &Environment,
    ) -> (Vec<&'c Component>, Vec<&'c Component>) {
        if self.options.jobs <= 1 || runnable.len() < 2 {
            return (Vec::new(), runnable.to_vec());
        }
        let mut batch = Vec::new();
        let mut sequential = Vec::new();
        let mut claimed: Vec<PathBuf> = Vec::new();
        for &component in runnable {
            let ctx = TemplateContext::for_component(component, self.host);
            let paths = component.resolved_owned_paths(&ctx, env);
            let disjoint = paths
                .iter()
                .all(|p| claimed.iter().all(|q| !paths_overlap(p, q)));
            if component.is_concurrency_safe() && disjoint {
                claimed.extend(paths);
                batch.push(component);
            } else {
                sequential.push(component);
            }
        }
        if batch.len() < 2 {
            sequential.splice(0..0, batch.drain(..));
        }
        (batch, sequential)
    }

    /// Run `batch` on up to `jobs` scoped workers.
    fn run_batch(&self, batch: &[&Component], shared: &Shared) -> Vec<ComponentReport> {
        if batch.is_empty() {
            return Vec::new();
        }
        let (work_tx, work_rx) = crossbeam_channel::unbounded::<&Component>();
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<ComponentReport>();
        for &component in batch {
            let _ = work_tx.send(component);
        }
        drop(work_tx);

        let workers = self.options.jobs.min(batch.len()).max(1);
        thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let done_tx = done_tx.clone();
                scope.spawn(move || {
                    for component in work_rx {
                        if done_tx.send(self.run_one(component, shared)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(done_tx);
            done_rx.iter().collect()
        })
    }

    fn run_one(&self, component: &Component, shared: &Shared) -> ComponentReport {
        let started = Instant::now();
        let mut report = match self.stop_reason(shared) {
            Some(reason) => self.skip(component, reason.to_string()),
            None => self.drive(component, shared),
        };
        report.duration_ms = elapsed_ms(started);
        self.progress.finished(&report);
        report
    }

    /// The per-component pipeline.
    fn drive(&self, component: &Component, shared: &Shared) -> ComponentReport {
        let mut track = Tracker::new(self, component);
        track.enter(ComponentState::Probing);

        let ctx = TemplateContext::for_component(component, self.host);
        let snapshot = shared.env.read().clone();
        let health = self.probe().probe(component, &ctx, &snapshot);
        self.record_probe(component, &health);

        if !component.enabled {
            return match health {
                HealthCheck::PresentAndHealthy { version } => track.finish(
                    ComponentState::Satisfied,
                    InstallOutcome::AlreadySatisfied { version },
                ),
                HealthCheck::Absent | HealthCheck::PresentButUnhealthy { .. } => track.finish(
                    ComponentState::SkippedDependency,
                    InstallOutcome::skipped("disabled by configuration"),
                ),
            };
        }

        if let HealthCheck::PresentAndHealthy { version } = health {
            if !self.options.dry_run
                && let Err(error) = self.configure(component, shared)
            {
                return self.abort(track, shared, &error);
            }
            return track.finish(
                ComponentState::Satisfied,
                InstallOutcome::AlreadySatisfied { version },
            );
        }

        if self.options.dry_run {
            return track.dry_run();
        }

        let ctx = self.install_context(shared);
        let cleanup = CleanupAgent::new(self.runner, self.options.fetch_timeout);
        let installer = ComponentInstaller::new(self.fetcher, self.probe());

        for attempt in 1..=MAX_ATTEMPTS {
            if let Some(reason) = self.stop_reason(shared) {
                return track.finish(
                    ComponentState::SkippedDependency,
                    InstallOutcome::skipped(reason),
                );
            }
            track.attempts = attempt;

            track.enter(ComponentState::Cleaning);
            let mut report = cleanup.clean(component, &ctx);
            self.record_cleanup(&report);
            if let Some(error) = report.profile_error.take() {
                return self.abort(track, shared, &error);
            }
            if let Some(reason) = self.stop_reason(shared) {
                return track.finish(
                    ComponentState::SkippedDependency,
                    InstallOutcome::skipped(reason),
                );
            }

            track.enter(ComponentState::Installing);
            let install_started = Instant::now();
            match installer.install(component, &ctx) {
                Ok(installation) => {
                    track.enter(ComponentState::Verifying);
                    self.record_profile(component, shared, installation.profile);
                    let mut entry = LogEntry::new(EventType::InstallComplete, Severity::Info)
                        .component(&component.name)
                        .duration(install_started.elapsed())
                        .ok(true);
                    if let Some(version) = installation.outcome.version() {
                        entry = entry.version(version);
                    }
                    self.log.record(&entry);
                    return track.finish(ComponentState::Satisfied, installation.outcome);
                }
                Err(error) if error.is_fatal_to_run() => {
                    return self.abort(track, shared, &error);
                }
                Err(error) => {
                    let verification = matches!(error, DvsError::Install { .. });
                    let retry = verification && attempt < MAX_ATTEMPTS;
                    if verification {
                        track.enter(ComponentState::Verifying);
                    }
                    self.log.record(
                        &LogEntry::new(EventType::InstallFailed, Severity::Warning)
                            .component(&component.name)
                            .duration(install_started.elapsed())
                            .error(&error)
                            .details(if retry {
                                "retrying with a clean reinstall"
                            } else if error.is_retryable() {
                                "giving up; a later run may succeed"
                            } else {
                                "giving up"
                            }),
                    );
                    if !retry {
                        return track.finish(
                            ComponentState::Failed,
                            InstallOutcome::failed(failure_reason(&error)),
                        );
                    }
                }
            }
        }
        track.finish(
            ComponentState::Failed,
            InstallOutcome::failed("install attempts exhausted"),
        )
    }

    /// Upsert the block and apply exports for an already-healthy component.
    fn configure(&self, component: &Component, shared: &Shared) -> Result<()> {
        let mutation = self.install_context(shared).configure(component)?;
        self.record_profile(component, shared, mutation);
        Ok(())
    }

    fn record_profile(&self, component: &Component, shared: &Shared, mutation: Option<Mutation>) {
        if let Some(mutation) = mutation.filter(|m| m.changed()) {
            self.log.record(
                &LogEntry::new(EventType::ProfileUpdate, Severity::Info)
                    .component(&component.name)
                    .path(shared.profile.lock().path())
                    .details(mutation_label(mutation)),
            );
        }
    }

    /// Record a run-fatal error and fail the component.
    fn abort(&self, track: Tracker<'_, '_>, shared: &Shared, error: &DvsError) -> ComponentReport {
        shared.abort(error.to_string());
        self.log.record(
            &LogEntry::new(EventType::InstallFailed, Severity::Critical)
                .component(&track.component.name)
                .error(error)
                .details("run aborted"),
        );
        track.finish(
            ComponentState::Failed,
            InstallOutcome::failed(error.to_string()),
        )
    }

    fn skip(&self, component: &Component, reason: String) -> ComponentReport {
        self.progress
            .state_changed(&component.name, ComponentState::SkippedDependency);
        self.log.record(
            &LogEntry::new(EventType::DependencySkip, Severity::Warning)
                .component(&component.name)
                .state(ComponentState::SkippedDependency.as_str())
                .details(reason.clone()),
        );
        ComponentReport::skipped(&component.name, component.required, reason)
    }

    fn stop_reason(&self, shared: &Shared) -> Option<&'static str> {
        if shared.is_aborted() {
            Some("run aborted")
        } else if self.cancel.is_cancelled() {
            Some("cancelled")
        } else {
            None
        }
    }

    fn unsatisfied_dependency<'c>(
        &self,
        component: &'c Component,
        states: &HashMap<String, ComponentState>,
    ) -> Option<&'c str> {
        component
            .depends_on
            .iter()
            .find(|dep| match states.get(dep.as_str()) {
                Some(ComponentState::Satisfied) => false,
                // A dry run reports would-install components as pending;
                // their dependents are still worth probing.
                Some(ComponentState::Pending) => !self.options.dry_run,
                _ => true,
            })
            .map(String::as_str)
    }

    // ──────────────────── status & clean ────────────────────

    /// Probe every planned component without changing anything.
    pub fn status(&self, profile: &ProfileMutator, mut env: Environment) -> Result<Vec<StatusRow>> {
        let plan = self.plan()?;
        self.seed_environment(&plan, profile, &mut env)?;
        let blocks = profile.blocks()?;
        let probe = self.probe();

        let mut rows = Vec::with_capacity(plan.len());
        for name in plan.order() {
            let Some(component) = self.registry.get(name) else {
                continue;
            };
            let ctx = TemplateContext::for_component(component, self.host);
            let health = probe.probe(component, &ctx, &env);
            self.record_probe(component, &health);
            let expected = component.profile_content(&ctx);
            let profile_block = blocks
                .iter()
                .any(|b| b.name == component.name && Some(&b.content) == expected.as_ref());
            rows.push(StatusRow {
                name: component.name.clone(),
                required: component.required,
                enabled: component.enabled,
                desired: component.version.to_string(),
                method: component.method.label(),
                health,
                profile_block,
            });
        }
        Ok(rows)
    }

    /// Run the cleanup agent for one component.
    ///
    /// Step failures stay in the report; a profile write failure is
    /// returned as the error after the other steps have run.
    pub fn clean(&self, name: &str, profile: ProfileMutator, mut env: Environment) -> Result<CleanupReport> {
        let Some(component) = self.registry.get(name) else {
            return Err(DvsError::InvalidConfig {
                details: format!("unknown component {name:?}"),
            });
        };
        let plan = self.plan()?;
        self.seed_environment(&plan, &profile, &mut env)?;

        let shared = Shared::new(profile, env);
        let agent = CleanupAgent::new(self.runner, self.options.fetch_timeout);
        let mut report = agent.clean(component, &self.install_context(&shared));
        self.record_cleanup(&report);
        self.log.sync();
        match report.profile_error.take() {
            Some(error) => Err(error),
            None => Ok(report),
        }
    }

    // ──────────────────── helpers ────────────────────

    fn probe(&self) -> VersionProbe<'a> {
        VersionProbe::new(self.runner, self.options.probe_timeout)
    }

    fn install_context<'s>(&'s self, shared: &'s Shared) -> InstallContext<'s> {
        InstallContext {
            host: self.host,
            env: &shared.env,
            profile: &shared.profile,
            fetch_timeout: self.options.fetch_timeout,
            staging_dir: self.options.staging_dir.as_deref(),
        }
    }

    /// Apply the exports of every planned component whose managed block is
    /// already in the profile with the expected content, so probes see the
    /// environment a fresh login shell would have.
    fn seed_environment(&self, plan: &Plan, profile: &ProfileMutator, env: &mut Environment) -> Result<usize> {
        let blocks = profile.blocks()?;
        let mut seeded = 0;
        for name in plan.order() {
            let Some(component) = self.registry.get(name) else {
                continue;
            };
            let ctx = TemplateContext::for_component(component, self.host);
            let Some(expected) = component.profile_content(&ctx) else {
                continue;
            };
            if blocks
                .iter()
                .any(|b| b.name == component.name && b.content == expected)
            {
                component.apply_exports(&ctx, env);
                seeded += 1;
            }
        }
        Ok(seeded)
    }

    fn record_probe(&self, component: &Component, health: &HealthCheck) {
        self.progress.probed(&component.name, health);
        let mut entry = LogEntry::new(EventType::Probe, Severity::Info)
            .component(&component.name)
            .state(health.label())
            .ok(health.is_healthy());
        match health {
            HealthCheck::PresentAndHealthy { version } => entry = entry.version(version),
            HealthCheck::PresentButUnhealthy { detail } => entry = entry.details(detail),
            HealthCheck::Absent => {}
        }
        self.log.record(&entry);
    }

    fn record_cleanup(&self, report: &CleanupReport) {
        for step in &report.steps {
            let (severity, ok) = match &step.outcome {
                StepOutcome::Failed(_) => (Severity::Warning, false),
                StepOutcome::Removed | StepOutcome::Absent => (Severity::Info, true),
            };
            let mut entry = LogEntry::new(EventType::CleanupStep, severity)
                .component(&report.component)
                .state(step.stage.as_str())
                .ok(ok);
            entry = match &step.outcome {
                StepOutcome::Removed => entry.details(format!("removed {}", step.target)),
                StepOutcome::Absent => entry.details(format!("absent {}", step.target)),
                StepOutcome::Failed(reason) => entry.details(format!("{}: {reason}", step.target)),
            };
            self.log.record(&entry);
        }
    }
}

/// Walks one component through the state machine, logging every edge.
struct Tracker<'o, 'c> {
    orchestrator: &'o Orchestrator<'o>,
    component: &'c Component,
    state: ComponentState,
    attempts: u32,
}

impl<'o, 'c> Tracker<'o, 'c> {
    fn new(orchestrator: &'o Orchestrator<'o>, component: &'c Component) -> Self {
        Self {
            orchestrator,
            component,
            state: ComponentState::Pending,
            attempts: 0,
        }
    }

    fn enter(&mut self, next: ComponentState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "{}: illegal transition {} -> {next}",
            self.component.name,
            self.state
        );
        self.state = next;
        self.orchestrator
            .progress
            .state_changed(&self.component.name, next);
        self.orchestrator.log.record(
            &LogEntry::new(EventType::StateChange, Severity::Info)
                .component(&self.component.name)
                .state(next.as_str()),
        );
    }

    fn finish(mut self, state: ComponentState, outcome: InstallOutcome) -> ComponentReport {
        self.enter(state);
        self.report(outcome)
    }

    /// Dry runs stop after probing; the component stays pending.
    fn dry_run(self) -> ComponentReport {
        let mut report = self.report(InstallOutcome::skipped("dry run: would install"));
        report.state = ComponentState::Pending;
        report
    }

    fn report(self, outcome: InstallOutcome) -> ComponentReport {
        let mut report = ComponentReport::new(
            &self.component.name,
            self.component.required,
            self.state,
            outcome,
        );
        report.attempts = self.attempts;
        report
    }
}

fn failure_reason(error: &DvsError) -> String {
    match error {
        DvsError::Timeout { after, .. } => format!("timeout after {}s", after.as_secs()),
        other => other.to_string(),
    }
}

const fn mutation_label(mutation: Mutation) -> &'static str {
    match mutation {
        Mutation::Unchanged => "unchanged",
        Mutation::Inserted => "inserted",
        Mutation::Replaced => "replaced",
        Mutation::Removed => "removed",
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::{FetchError, FetchReceipt, FetchRequest};
    use crate::platform::pal::SystemRunner;
    use crate::registry::test_support::{component, host};
    use crate::registry::{ArchiveFormat, ArchiveSpec, InstallMethod, ProfileExport, VersionSpec};
    use std::collections::HashSet;
    use std::fs;
    use tempfile::TempDir;

    /// Stages a shell script that prints `<name> <version>`.
    #[derive(Default)]
    struct ScriptFetcher {
        /// Version to stage per component; the pin when absent.
        versions: HashMap<String, String>,
        broken: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptFetcher {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl Fetcher for ScriptFetcher {
        fn fetch(&self, request: &FetchRequest<'_>) -> std::result::Result<FetchReceipt, FetchError> {
            let name = &request.component.name;
            self.calls.lock().push(name.clone());
            if self.broken.contains(name) {
                return Err(FetchError::Command {
                    command: "curl".into(),
                    detail: "exit code 22".into(),
                });
            }
            let version = self
                .versions
                .get(name)
                .cloned()
                .unwrap_or_else(|| request.ctx.version.clone());
            let staging = request.staging.expect("binary components stage");
            let payload = staging.join("download");
            fs::write(&payload, format!("#!/bin/sh\necho \"{name} {version}\"\n")).unwrap();
            Ok(FetchReceipt {
                version,
                payload: Some(payload),
            })
        }
    }

    fn tool(name: &str, deps: &[&str]) -> Component {
        let mut c = component(name, deps);
        c.version = VersionSpec::Exact("1.0.0".into());
        c.probe.version_pattern = format!(r"{name} (\S+)");
        c.method = InstallMethod::DownloadArchive(ArchiveSpec {
            url: "https://example.invalid/{version}".into(),
            latest_url: None,
            latest_pattern: None,
            format: ArchiveFormat::Binary,
            archive_root: None,
            install_root: format!("$HOME/tools/{name}/{name}"),
            sha256: None,
        });
        c.exports = vec![
            ProfileExport::PrependPath(format!("$HOME/tools/{name}")),
            ProfileExport::set(
                &format!("{}_HOME", name.to_ascii_uppercase()),
                &format!("$HOME/tools/{name}"),
            ),
        ];
        c
    }

    struct Fixture {
        tmp: TempDir,
        registry: Registry,
        host: HostFacts,
    }

    impl Fixture {
        fn new(components: Vec<Component>) -> Self {
            let tmp = TempDir::new().unwrap();
            Self {
                tmp,
                registry: Registry::new(components).unwrap(),
                host: host(),
            }
        }

        fn env(&self) -> Environment {
            Environment::from_pairs([
                ("HOME".to_string(), self.tmp.path().to_string_lossy().into_owned()),
                ("PATH".to_string(), "/usr/bin:/bin".to_string()),
            ])
        }

        fn profile_path(&self) -> PathBuf {
            self.tmp.path().join(".bashrc")
        }

        fn profile_text(&self) -> String {
            fs::read_to_string(self.profile_path()).unwrap_or_default()
        }

        fn run_with(&self, fetcher: &ScriptFetcher, options: RunOptions) -> RunSummary {
            Orchestrator::new(&self.registry, &self.host, &SystemRunner, fetcher)
                .with_options(RunOptions {
                    fetch_timeout: Duration::from_secs(10),
                    probe_timeout: Duration::from_secs(10),
                    ..options
                })
                .run(ProfileMutator::new(self.profile_path()), self.env())
                .unwrap()
        }

        fn run(&self, fetcher: &ScriptFetcher) -> RunSummary {
            self.run_with(fetcher, RunOptions::default())
        }
    }

    fn outcome<'s>(summary: &'s RunSummary, name: &str) -> &'s InstallOutcome {
        &summary.get(name).unwrap().outcome
    }

    #[test]
    fn installs_then_second_run_is_idempotent() {
        let mut foundation = tool("alpha", &[]);
        foundation.required = true;
        let fx = Fixture::new(vec![foundation, tool("beta", &["alpha"])]);

        let fetcher = ScriptFetcher::default();
        let first = fx.run(&fetcher);
        assert!(first.success(), "{first:?}");
        assert_eq!(
            outcome(&first, "alpha"),
            &InstallOutcome::Installed { version: "1.0.0".into() }
        );
        assert_eq!(first.get("alpha").unwrap().attempts, 1);
        let profile_after_first = fx.profile_text();
        assert_eq!(profile_after_first.matches("# >>> devstation:alpha >>>").count(), 1);

        let second = fx.run(&fetcher);
        assert!(second.success());
        for name in ["alpha", "beta"] {
            assert_eq!(
                outcome(&second, name),
                &InstallOutcome::AlreadySatisfied { version: "1.0.0".into() },
                "{name}"
            );
        }
        assert_eq!(fetcher.calls().len(), 2, "no fetch on the second run");
        assert_eq!(fx.profile_text(), profile_after_first);
    }

    #[test]
    fn foundation_failure_skips_dependents() {
        let mut foundation = tool("alpha", &[]);
        foundation.required = true;
        let fx = Fixture::new(vec![
            foundation,
            tool("beta", &["alpha"]),
            tool("gamma", &["beta"]),
            tool("delta", &[]),
        ]);
        let fetcher = ScriptFetcher {
            broken: HashSet::from(["alpha".to_string()]),
            ..ScriptFetcher::default()
        };
        let summary = fx.run(&fetcher);

        assert!(!summary.success());
        let alpha = summary.get("alpha").unwrap();
        assert_eq!(alpha.state, ComponentState::Failed);
        assert!(alpha.outcome.to_string().contains("DVS-2101"));
        assert_eq!(alpha.attempts, 1, "fetch failures are not retried");
        assert_eq!(
            outcome(&summary, "beta"),
            &InstallOutcome::skipped("dependency unsatisfied: alpha")
        );
        assert_eq!(summary.get("gamma").unwrap().state, ComponentState::SkippedDependency);
        assert!(summary.get("delta").unwrap().is_satisfied());
        assert!(!fetcher.calls().contains(&"beta".to_string()));
    }

    #[test]
    fn verification_failure_retries_once() {
        let fx = Fixture::new(vec![tool("alpha", &[])]);
        let fetcher = ScriptFetcher {
            versions: HashMap::from([("alpha".to_string(), "0.9.0".to_string())]),
            ..ScriptFetcher::default()
        };
        let summary = fx.run(&fetcher);
        let alpha = summary.get("alpha").unwrap();
        assert_eq!(alpha.state, ComponentState::Failed);
        assert_eq!(alpha.attempts, 2);
        assert_eq!(fetcher.calls().len(), 2);
        assert!(alpha.outcome.to_string().contains("does not match pin"));
        // Optional failure still leaves the run successful.
        assert!(summary.success());
    }

    #[test]
    fn dry_run_probes_only() {
        let fx = Fixture::new(vec![tool("alpha", &[]), tool("beta", &["alpha"])]);
        let fetcher = ScriptFetcher::default();
        let summary = fx.run_with(
            &fetcher,
            RunOptions {
                dry_run: true,
                ..RunOptions::default()
            },
        );
        assert!(summary.success());
        assert!(summary.dry_run);
        for name in ["alpha", "beta"] {
            let report = summary.get(name).unwrap();
            assert_eq!(report.state, ComponentState::Pending);
            assert_eq!(report.outcome, InstallOutcome::skipped("dry run: would install"));
        }
        assert!(fetcher.calls().is_empty());
        assert!(!fx.profile_path().exists());
    }

    #[test]
    fn disabled_components_are_never_installed() {
        let mut beta = tool("beta", &[]);
        beta.enabled = false;
        let fx = Fixture::new(vec![tool("alpha", &[]), beta, tool("gamma", &["beta"])]);
        let fetcher = ScriptFetcher::default();
        let summary = fx.run(&fetcher);
        assert_eq!(
            outcome(&summary, "beta"),
            &InstallOutcome::skipped("disabled by configuration")
        );
        assert_eq!(summary.get("gamma").unwrap().state, ComponentState::SkippedDependency);
        assert_eq!(fetcher.calls(), ["alpha".to_string()]);
    }

    #[test]
    fn only_restricts_to_closure() {
        let fx = Fixture::new(vec![tool("alpha", &[]), tool("beta", &["alpha"]), tool("gamma", &[])]);
        let fetcher = ScriptFetcher::default();
        let summary = fx.run_with(
            &fetcher,
            RunOptions {
                only: Some(vec!["beta".into()]),
                ..RunOptions::default()
            },
        );
        let names: Vec<_> = summary.components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["alpha", "beta"]);
    }

    #[test]
    fn cancellation_skips_unstarted_components() {
        let fx = Fixture::new(vec![tool("alpha", &[]), tool("beta", &[])]);
        let fetcher = ScriptFetcher::default();
        let cancel = CancelFlag::new();
        cancel.request_cancel();
        let summary = Orchestrator::new(&fx.registry, &fx.host, &SystemRunner, &fetcher)
            .with_cancel(cancel)
            .run(ProfileMutator::new(fx.profile_path()), fx.env())
            .unwrap();
        assert!(summary.cancelled);
        assert!(!summary.success());
        for report in &summary.components {
            assert_eq!(report.outcome, InstallOutcome::skipped("cancelled"));
        }
        assert!(fetcher.calls().is_empty());
    }

    /// Cancels the run once the first fetch has happened.
    struct CancelAfterFetch {
        inner: ScriptFetcher,
        cancel: CancelFlag,
    }

    impl Fetcher for CancelAfterFetch {
        fn fetch(&self, request: &FetchRequest<'_>) -> std::result::Result<FetchReceipt, FetchError> {
            let receipt = self.inner.fetch(request);
            self.cancel.request_cancel();
            receipt
        }
    }

    #[test]
    fn cancellation_mid_tier_skips_remaining_components() {
        let fx = Fixture::new(vec![tool("alpha", &[]), tool("beta", &[])]);
        let cancel = CancelFlag::new();
        let fetcher = CancelAfterFetch {
            inner: ScriptFetcher::default(),
            cancel: cancel.clone(),
        };
        let summary = Orchestrator::new(&fx.registry, &fx.host, &SystemRunner, &fetcher)
            .with_options(RunOptions {
                jobs: 1,
                fetch_timeout: Duration::from_secs(10),
                probe_timeout: Duration::from_secs(10),
                ..RunOptions::default()
            })
            .with_cancel(cancel)
            .run(ProfileMutator::new(fx.profile_path()), fx.env())
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(fetcher.inner.calls().len(), 1);
        let fetched = fetcher.inner.calls()[0].clone();
        for report in &summary.components {
            if report.name == fetched {
                assert!(report.is_satisfied(), "{report:?}");
            } else {
                assert_eq!(report.outcome, InstallOutcome::skipped("cancelled"));
                assert_eq!(report.state, ComponentState::SkippedDependency);
            }
        }
    }

    #[test]
    fn corrupt_profile_aborts_before_any_work() {
        let fx = Fixture::new(vec![tool("alpha", &[])]);
        fs::write(fx.profile_path(), "# >>> devstation:alpha >>>\nexport X=1\n").unwrap();
        let fetcher = ScriptFetcher::default();
        let err = Orchestrator::new(&fx.registry, &fx.host, &SystemRunner, &fetcher)
            .run(ProfileMutator::new(fx.profile_path()), fx.env())
            .unwrap_err();
        assert_eq!(err.code(), "DVS-3001");
        assert!(fetcher.calls().is_empty());
    }

    #[test]
    fn concurrent_and_sequential_runs_write_the_same_blocks() {
        let names = ["alpha", "beta", "gamma", "delta"];
        let blocks = |jobs: usize| {
            let fx = Fixture::new(names.iter().map(|n| tool(n, &[])).collect());
            let summary = fx.run_with(
                &ScriptFetcher::default(),
                RunOptions {
                    jobs,
                    ..RunOptions::default()
                },
            );
            assert!(summary.components.iter().all(ComponentReport::is_satisfied));
            let mut found: Vec<_> = ProfileMutator::new(fx.profile_path())
                .blocks()
                .unwrap()
                .into_iter()
                .map(|b| {
                    let home = fx.tmp.path().to_string_lossy().into_owned();
                    (b.name, b.content.replace(&home, "$HOME"))
                })
                .collect();
            found.sort();
            found
        };
        let sequential = blocks(1);
        let concurrent = blocks(4);
        assert_eq!(sequential.len(), 4);
        assert_eq!(sequential, concurrent);
    }

    fn partition_names(fx: &Fixture) -> (Vec<String>, Vec<String>) {
        let fetcher = ScriptFetcher::default();
        let orchestrator = Orchestrator::new(&fx.registry, &fx.host, &SystemRunner, &fetcher);
        let runnable: Vec<&Component> = fx.registry.components().iter().collect();
        let (batch, sequential) = orchestrator.partition(&runnable, &fx.env());
        let names = |v: Vec<&Component>| v.into_iter().map(|c| c.name.clone()).collect();
        (names(batch), names(sequential))
    }

    #[test]
    fn partition_batches_disjoint_optional_components() {
        let mut required = tool("alpha", &[]);
        required.required = true;
        let fx = Fixture::new(vec![required, tool("gamma", &[]), tool("delta", &[])]);
        let (batch, sequential) = partition_names(&fx);
        assert_eq!(batch, ["gamma", "delta"]);
        assert_eq!(sequential, ["alpha"]);
    }

    #[test]
    fn partition_keeps_overlapping_components_sequential() {
        let mut nested = tool("beta", &[]);
        nested.owned_paths = vec!["$HOME/tools".into()];
        let fx = Fixture::new(vec![nested, tool("gamma", &[]), tool("delta", &[])]);
        // beta owns $HOME/tools, which contains every other install root, so
        // nothing can share its batch and a batch of one is not worth a thread.
        let (batch, sequential) = partition_names(&fx);
        assert!(batch.is_empty());
        assert_eq!(sequential, ["beta", "gamma", "delta"]);
    }

    #[test]
    fn status_reports_health_and_blocks() {
        let fx = Fixture::new(vec![tool("alpha", &[]), tool("beta", &[])]);
        fx.run_with(
            &ScriptFetcher::default(),
            RunOptions {
                only: Some(vec!["alpha".into()]),
                ..RunOptions::default()
            },
        );
        let fetcher = ScriptFetcher::default();
        let rows = Orchestrator::new(&fx.registry, &fx.host, &SystemRunner, &fetcher)
            .status(&ProfileMutator::new(fx.profile_path()), fx.env())
            .unwrap();
        let alpha = rows.iter().find(|r| r.name == "alpha").unwrap();
        assert!(alpha.health.is_healthy());
        assert!(alpha.profile_block);
        let beta = rows.iter().find(|r| r.name == "beta").unwrap();
        assert_eq!(beta.health, HealthCheck::Absent);
        assert!(!beta.profile_block);
    }

    #[test]
    fn clean_removes_install_and_block() {
        let fx = Fixture::new(vec![tool("alpha", &[])]);
        fx.run(&ScriptFetcher::default());
        assert!(fx.tmp.path().join("tools/alpha/alpha").exists());

        let fetcher = ScriptFetcher::default();
        let report = Orchestrator::new(&fx.registry, &fx.host, &SystemRunner, &fetcher)
            .clean("alpha", ProfileMutator::new(fx.profile_path()), fx.env())
            .unwrap();
        assert!(report.removed_count() >= 2);
        assert!(!fx.tmp.path().join("tools/alpha/alpha").exists());
        assert!(!fx.profile_text().contains("devstation:alpha"));
    }

    #[test]
    fn activity_log_records_the_run() {
        let fx = Fixture::new(vec![tool("alpha", &[])]);
        let log_path = fx.tmp.path().join("activity.jsonl");
        let log = ActivityLog::open(&log_path);
        let fetcher = ScriptFetcher::default();
        Orchestrator::new(&fx.registry, &fx.host, &SystemRunner, &fetcher)
            .with_log(&log)
            .run(ProfileMutator::new(fx.profile_path()), fx.env())
            .unwrap();
        let events: Vec<String> = fs::read_to_string(&log_path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(events.first().map(String::as_str), Some("run_start"));
        assert_eq!(events.last().map(String::as_str), Some("run_complete"));
        for expected in ["probe", "state_change", "cleanup_step", "install_complete"] {
            assert!(events.iter().any(|e| e == expected), "missing {expected}: {events:?}");
        }
    }

    #[test]
    fn failure_reason_for_timeouts() {
        let reason = failure_reason(&DvsError::Timeout {
            component: "go".into(),
            after: Duration::from_secs(3),
        });
        assert_eq!(reason, "timeout after 3s");
    }
}
