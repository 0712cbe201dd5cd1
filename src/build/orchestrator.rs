//! Build task orchestration
//!
//! One task per selected package is queued onto a worker pool sized to the
//! configured parallelism. Each task builds, bumps the package version when
//! the build succeeds, then attempts a best-effort deploy. The run returns
//! once every task has completed and every worker has exited.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{Builder, Deployer};
use crate::config::{BuildConfig, BuildPackage, TlsConfig};
use crate::network::DeployClient;
use crate::pool::{PendingWork, WorkerPool};

/// One package to build
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub package: BuildPackage,
}

/// Outcome of a task
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub name: String,
    /// Package state after the task, including any version bump
    pub package: BuildPackage,
    pub built: bool,
    /// `None` when no deploy was attempted
    pub deployed: Option<bool>,
}

/// Runs build tasks over a fixed set of workers
pub struct Orchestrator {
    parallel: usize,
    builder: Arc<dyn Builder>,
    deployer: Option<Arc<dyn Deployer>>,
}

impl Orchestrator {
    pub fn new(parallel: usize, builder: Arc<dyn Builder>) -> Self {
        Self {
            parallel: parallel.max(1),
            builder,
            deployer: None,
        }
    }

    pub fn with_deployer(mut self, deployer: Arc<dyn Deployer>) -> Self {
        self.deployer = Some(deployer);
        self
    }

    /// Deploy through a [`DeployClient`] built from `tls`.
    ///
    /// Unusable TLS material only disables deploys; builds still run.
    pub fn with_tls(self, tls: Option<&TlsConfig>) -> Self {
        let Some(tls) = tls else {
            return self;
        };

        match DeployClient::new(tls) {
            Ok(client) => self.with_deployer(Arc::new(client)),
            Err(e) => {
                tracing::error!("Deploys disabled, TLS identity unusable: {}", e);
                self
            }
        }
    }

    /// Tasks for the requested names, or for every package when none are requested
    pub fn select_tasks(packages: &BTreeMap<String, BuildPackage>, requested: &[String]) -> Vec<Task> {
        if requested.is_empty() {
            return packages
                .iter()
                .map(|(name, package)| Task {
                    name: name.clone(),
                    package: package.clone(),
                })
                .collect();
        }

        let mut tasks: Vec<Task> = Vec::new();
        for name in requested {
            if tasks.iter().any(|task| &task.name == name) {
                continue;
            }
            match packages.get_key_value(name) {
                Some((name, package)) => tasks.push(Task {
                    name: name.clone(),
                    package: package.clone(),
                }),
                None => tracing::warn!("Package `{}` is not configured, skipping", name),
            }
        }
        tasks
    }

    /// Process every task exactly once and collect the reports
    pub async fn run(&self, tasks: Vec<Task>) -> Vec<TaskReport> {
        let pool = WorkerPool::new("build", self.parallel, self.parallel);
        let pending = PendingWork::new();
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();

        for task in tasks {
            let guard = pending.register();
            let builder = self.builder.clone();
            let deployer = self.deployer.clone();
            let report_tx = report_tx.clone();

            let job = async move {
                let _guard = guard;
                let report = process_task(task, builder.as_ref(), deployer.as_deref()).await;
                let _ = report_tx.send(report);
            };

            if let Err(e) = pool.submit(job).await {
                tracing::error!("Could not queue build task: {}", e);
            }
        }
        drop(report_tx);

        pending.wait_idle().await;
        pool.shutdown().await;

        let mut reports = Vec::new();
        while let Some(report) = report_rx.recv().await {
            reports.push(report);
        }
        reports
    }
}

async fn process_task(
    task: Task,
    builder: &dyn Builder,
    deployer: Option<&dyn Deployer>,
) -> TaskReport {
    let Task { name, mut package } = task;

    if let Err(e) = builder.build(&name, &package).await {
        tracing::error!("`{}` build failed: {}", name, e);
        return TaskReport {
            name,
            package,
            built: false,
            deployed: None,
        };
    }

    tracing::info!("`{}` build completed", name);
    if let Some(version) = package.version.as_mut() {
        version.bump_patch();
    }

    let deployed = match (deployer, package.deploy.as_deref()) {
        (Some(deployer), Some(target)) => match deployer.deploy(&name, &package).await {
            Ok(()) => Some(true),
            Err(e) => {
                tracing::error!("`{}` deploy to {} failed: {}", name, target, e);
                Some(false)
            }
        },
        (None, Some(target)) => {
            tracing::warn!("`{}` has deploy target {} but no usable TLS identity, skipping deploy", name, target);
            None
        }
        _ => None,
    };

    TaskReport {
        name,
        package,
        built: true,
        deployed,
    }
}

/// Copy bumped versions from successful builds back into the config.
///
/// Returns how many packages changed.
pub fn apply_reports(config: &mut BuildConfig, reports: &[TaskReport]) -> usize {
    let mut changed = 0;
    for report in reports.iter().filter(|report| report.built) {
        if let Some(package) = config.packages.get_mut(&report.name) {
            if package.version != report.package.version {
                package.version = report.package.version;
                changed += 1;
            }
        }
    }
    changed
}
