use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

use crate::error::{LaunchError, Result};

pub const OMP_NUM_THREADS: &str = "OMP_NUM_THREADS";
pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";
pub const NCCL_DEBUG: &str = "NCCL_DEBUG";
pub const NCCL_TIMEOUT: &str = "NCCL_TIMEOUT";
pub const NCCL_SOCKET_IFNAME: &str = "NCCL_SOCKET_IFNAME";

/// Variables always set on the child, in the order they are emitted
pub const FIXED_ENV_VARS: [&str; 5] = [
    OMP_NUM_THREADS,
    CUDA_VISIBLE_DEVICES,
    NCCL_DEBUG,
    NCCL_TIMEOUT,
    NCCL_SOCKET_IFNAME,
];

/// Reporting backends the training program knows about
pub const KNOWN_REPORT_BACKENDS: [&str; 1] = ["wandb"];

/// NCCL debug verbosity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum NcclDebug {
    Version,
    Warn,
    Info,
    Trace,
}

impl NcclDebug {
    pub fn as_str(&self) -> &'static str {
        match self {
            NcclDebug::Version => "VERSION",
            NcclDebug::Warn => "WARN",
            NcclDebug::Info => "INFO",
            NcclDebug::Trace => "TRACE",
        }
    }
}

impl fmt::Display for NcclDebug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NcclDebug {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "VERSION" => Ok(NcclDebug::Version),
            "WARN" => Ok(NcclDebug::Warn),
            "INFO" => Ok(NcclDebug::Info),
            "TRACE" => Ok(NcclDebug::Trace),
            other => Err(LaunchError::ParseError(format!(
                "unknown NCCL debug level '{}' (expected VERSION, WARN, INFO or TRACE)",
                other
            ))),
        }
    }
}

/// Process environment handed to the training program
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeEnv {
    pub omp_num_threads: u32,
    pub cuda_visible_devices: Vec<u32>,
    pub nccl_debug: NcclDebug,
    pub nccl_timeout_secs: u64,
    pub nccl_socket_ifname: String,
    pub extra: BTreeMap<String, String>,
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        Self {
            omp_num_threads: 8,
            cuda_visible_devices: (0..8).collect(),
            nccl_debug: NcclDebug::Info,
            nccl_timeout_secs: 3600,
            nccl_socket_ifname: "eth0".to_string(),
            extra: BTreeMap::new(),
        }
    }
}

impl RuntimeEnv {
    /// Fixed variables first, then `extra` in name order.
    pub fn vars(&self) -> Vec<(String, String)> {
        let devices = self
            .cuda_visible_devices
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut vars = vec![
            (OMP_NUM_THREADS.to_string(), self.omp_num_threads.to_string()),
            (CUDA_VISIBLE_DEVICES.to_string(), devices),
            (NCCL_DEBUG.to_string(), self.nccl_debug.to_string()),
            (NCCL_TIMEOUT.to_string(), self.nccl_timeout_secs.to_string()),
            (NCCL_SOCKET_IFNAME.to_string(), self.nccl_socket_ifname.clone()),
        ];
        vars.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }

    fn validate(&self) -> Result<()> {
        if self.omp_num_threads == 0 {
            return invalid("omp_num_threads must be at least 1");
        }
        if self.cuda_visible_devices.is_empty() {
            return invalid("cuda_visible_devices must list at least one device");
        }
        let mut seen = HashSet::new();
        for device in &self.cuda_visible_devices {
            if !seen.insert(device) {
                return invalid(format!("device {} listed twice in cuda_visible_devices", device));
            }
        }
        if self.nccl_timeout_secs == 0 {
            return invalid("nccl_timeout_secs must be greater than zero");
        }
        if self.nccl_socket_ifname.trim().is_empty() {
            return invalid("nccl_socket_ifname must not be empty");
        }
        for (name, value) in &self.extra {
            if name.is_empty() || name.contains('=') || name.contains('\0') {
                return invalid(format!("'{}' is not a valid environment variable name", name));
            }
            if FIXED_ENV_VARS.contains(&name.as_str()) {
                return invalid(format!(
                    "{} is managed by the [env] section and cannot be set through extra",
                    name
                ));
            }
            if value.contains('\0') {
                return invalid(format!("value of {} contains a NUL byte", name));
            }
        }
        Ok(())
    }
}

/// Executable and leading arguments, e.g. `python main.py`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Entrypoint {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for Entrypoint {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["main.py".to_string()],
        }
    }
}

/// Flags passed to the training program
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingArgs {
    pub data: PathBuf,
    pub workers: u32,
    pub epochs: u32,
    pub batch_size: u32,
    pub report_to: String,
    pub name: String,
    pub seed: u64,
    pub multiprocessing_distributed: bool,
    pub dist_url: String,
    pub world_size: u32,
    pub rank: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dist_backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wandb_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<PathBuf>,
    pub fake_data: bool,
    pub evaluate: bool,
    pub extra_args: Vec<String>,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            data: PathBuf::from("/data/imagenet"),
            workers: 16,
            epochs: 90,
            batch_size: 1024,
            report_to: "wandb".to_string(),
            name: "vit-s16-90ep".to_string(),
            seed: 0,
            multiprocessing_distributed: true,
            dist_url: "tcp://127.0.0.1:29500".to_string(),
            world_size: 1,
            rank: 0,
            dist_backend: None,
            logs: None,
            wandb_notes: None,
            resume: None,
            fake_data: false,
            evaluate: false,
            extra_args: Vec::new(),
        }
    }
}

impl TrainingArgs {
    /// Render the argument vector in the order the training program documents it.
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = vec![self.data.to_string_lossy().into_owned()];

        push_flag(&mut argv, "--workers", self.workers);
        push_flag(&mut argv, "--epochs", self.epochs);
        push_flag(&mut argv, "--batch-size", self.batch_size);
        push_flag(&mut argv, "--report-to", &self.report_to);
        push_flag(&mut argv, "--name", &self.name);
        push_flag(&mut argv, "--seed", self.seed);
        if self.multiprocessing_distributed {
            argv.push("--multiprocessing-distributed".to_string());
        }
        push_flag(&mut argv, "--dist-url", &self.dist_url);
        push_flag(&mut argv, "--world-size", self.world_size);
        push_flag(&mut argv, "--rank", self.rank);

        if let Some(ref backend) = self.dist_backend {
            push_flag(&mut argv, "--dist-backend", backend);
        }
        if let Some(ref logs) = self.logs {
            push_flag(&mut argv, "--logs", logs.display());
        }
        if let Some(ref notes) = self.wandb_notes {
            push_flag(&mut argv, "--wandb-notes", notes);
        }
        if let Some(ref resume) = self.resume {
            push_flag(&mut argv, "--resume", resume.display());
        }
        if self.fake_data {
            argv.push("--fake-data".to_string());
        }
        if self.evaluate {
            argv.push("--evaluate".to_string());
        }

        argv.extend(self.extra_args.iter().cloned());
        argv
    }

    fn validate(&self) -> Result<()> {
        if self.data.as_os_str().is_empty() {
            return invalid("dataset path must not be empty");
        }
        if self.name.trim().is_empty() {
            return invalid("run name must not be empty");
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.epochs == 0 {
            return invalid("epochs must be at least 1");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.world_size == 0 {
            return invalid("world_size must be at least 1");
        }
        if self.rank >= self.world_size {
            return invalid(format!(
                "rank {} is out of range for world_size {}",
                self.rank, self.world_size
            ));
        }
        Ok(())
    }
}

fn push_flag(argv: &mut Vec<String>, flag: &str, value: impl fmt::Display) {
    argv.push(flag.to_string());
    argv.push(value.to_string());
}

fn invalid<T>(msg: impl Into<String>) -> Result<T> {
    Err(LaunchError::InvalidPlan(msg.into()))
}

/// A complete description of one launch
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchPlan {
    pub entrypoint: Entrypoint,
    pub env: RuntimeEnv,
    pub training: TrainingArgs,
}

impl LaunchPlan {
    /// Arguments passed after the program name.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.entrypoint.args.clone();
        argv.extend(self.training.to_argv());
        argv
    }

    /// Program name followed by `argv()`.
    pub fn command_line(&self) -> Vec<String> {
        let mut line = vec![self.entrypoint.program.clone()];
        line.extend(self.argv());
        line
    }

    /// Render the plan as a single shell line with the environment prefixed.
    pub fn shell_line(&self) -> String {
        self.env
            .vars()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, shell_quote(&v)))
            .chain(self.command_line().iter().map(|arg| shell_quote(arg)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Reject plans the training program cannot run with, then log soft findings.
    pub fn validate(&self) -> Result<()> {
        if self.entrypoint.program.trim().is_empty() {
            return invalid("entrypoint program must not be empty");
        }
        self.env.validate()?;
        self.training.validate()?;

        for warning in self.warnings() {
            warn!(run_name = %self.training.name, "{}", warning);
        }
        Ok(())
    }

    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let training = &self.training;

        if !training.data.exists() {
            warnings.push(format!(
                "dataset path {} does not exist on this host",
                training.data.display()
            ));
        }
        if !training.report_to.is_empty()
            && !KNOWN_REPORT_BACKENDS.contains(&training.report_to.as_str())
        {
            warnings.push(format!(
                "report backend '{}' is not recognised by the training program",
                training.report_to
            ));
        }
        let known_scheme = ["tcp://", "env://", "file://"]
            .iter()
            .any(|scheme| training.dist_url.starts_with(scheme));
        if !known_scheme {
            warnings.push(format!(
                "dist_url '{}' does not use a tcp://, env:// or file:// scheme",
                training.dist_url
            ));
        }
        warnings
    }
}

/// Quote `arg` for display in a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:,=@+%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Outcome of a launch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LaunchStatus {
    Success,
    Failed,
    Signaled,
    SpawnFailed,
}

/// Complete launch record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRecord {
    pub id: Uuid,
    pub run_name: String,
    pub program: String,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub status: LaunchStatus,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LaunchRecord {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
