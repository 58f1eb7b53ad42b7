use crate::process::{exit_code_of, spawn_failure_code, unresolved_code, ProcessConfig};
use chrono::Utc;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use trainlaunch_config::parse_launchfile;
use trainlaunch_core::{LaunchPlan, LaunchRecord, LaunchStatus, Result};
use uuid::Uuid;

/// Sets up the child's environment, starts the training program and waits for it
#[derive(Clone)]
pub struct LaunchExecutor {
    work_dir: Option<PathBuf>,
}

impl LaunchExecutor {
    pub fn new() -> Self {
        Self { work_dir: None }
    }

    pub fn with_work_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Execute a plan from a Launchfile string
    pub async fn execute_from_launchfile(&self, launchfile_content: &str) -> Result<LaunchRecord> {
        let plan = parse_launchfile(launchfile_content)?;
        self.execute(&plan).await
    }

    /// Validate and execute a plan. Failing to start the entrypoint is reported
    /// through the record's status and exit code, not as an error.
    pub async fn execute(&self, plan: &LaunchPlan) -> Result<LaunchRecord> {
        plan.validate()?;

        let launch_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start_instant = std::time::Instant::now();
        let program = &plan.entrypoint.program;

        info!(
            launch_id = %launch_id,
            run_name = %plan.training.name,
            program = %program,
            "Starting launch"
        );

        let cwd = match self.work_dir {
            Some(ref dir) => dir.clone(),
            None => env::current_dir()?,
        };

        let record = |status: LaunchStatus, exit_code: i32| LaunchRecord {
            id: launch_id,
            run_name: plan.training.name.clone(),
            program: program.clone(),
            argv: plan.argv(),
            env: plan.env.vars(),
            status,
            exit_code,
            duration_ms: start_instant.elapsed().as_millis() as u64,
            started_at,
            completed_at: Some(Utc::now()),
        };

        // The child looks the program up with its own PATH, which the plan may override.
        let search_path = plan
            .env
            .extra
            .get("PATH")
            .map(OsString::from)
            .or_else(|| env::var_os("PATH"));

        let resolved = match which::which_in(program, search_path, &cwd) {
            Ok(path) => path,
            Err(e) => {
                let exit_code = unresolved_code(program, &cwd);
                error!(
                    launch_id = %launch_id,
                    program = %program,
                    error = %e,
                    exit_code,
                    "Entrypoint could not be resolved"
                );
                return Ok(record(LaunchStatus::SpawnFailed, exit_code));
            }
        };

        let config = ProcessConfig::from_plan(plan, resolved, self.work_dir.clone());
        for (name, value) in &config.env {
            info!(launch_id = %launch_id, "{}={}", name, value);
        }

        let mut child = match config.command().spawn() {
            Ok(child) => child,
            Err(e) => {
                let exit_code = spawn_failure_code(e.kind());
                error!(
                    launch_id = %launch_id,
                    program = %config.program.display(),
                    error = %e,
                    exit_code,
                    "Failed to spawn entrypoint"
                );
                return Ok(record(LaunchStatus::SpawnFailed, exit_code));
            }
        };

        info!(launch_id = %launch_id, pid = ?child.id(), "Training program started");

        // The child shares our process group and sees the interrupt itself;
        // keep waiting so its exit status is still propagated.
        let mut watch_interrupts = true;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                interrupt = tokio::signal::ctrl_c(), if watch_interrupts => match interrupt {
                    Ok(()) => warn!(
                        launch_id = %launch_id,
                        "Interrupt received, waiting for the training program to exit"
                    ),
                    Err(e) => {
                        warn!(launch_id = %launch_id, error = %e, "Cannot listen for interrupts");
                        watch_interrupts = false;
                    }
                },
            }
        };

        let (launch_status, exit_code) = exit_code_of(&status);

        info!(
            launch_id = %launch_id,
            run_name = %plan.training.name,
            status = ?launch_status,
            exit_code,
            "Launch completed"
        );

        Ok(record(launch_status, exit_code))
    }
}

impl Default for LaunchExecutor {
    fn default() -> Self {
        Self::new()
    }
}
