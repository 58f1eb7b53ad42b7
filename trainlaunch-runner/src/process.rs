// Child process setup and exit status mapping.
// Exit codes follow what a POSIX shell reports for its foreground job.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use trainlaunch_core::{LaunchPlan, LaunchStatus};

pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_NOT_EXECUTABLE: i32 = 126;
pub const EXIT_NOT_FOUND: i32 = 127;
const SIGNAL_EXIT_BASE: i32 = 128;

pub struct ProcessConfig {
    /// Resolved executable
    pub program: PathBuf,
    /// Name the child sees as argv[0], as written in the plan
    pub arg0: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_directory: Option<PathBuf>,
}

impl ProcessConfig {
    pub fn from_plan(plan: &LaunchPlan, program: PathBuf, working_directory: Option<PathBuf>) -> Self {
        Self {
            program,
            arg0: plan.entrypoint.program.clone(),
            args: plan.argv(),
            env: plan.env.vars(),
            working_directory,
        }
    }

    /// Build the child command. The parent environment is inherited and the
    /// plan's variables are layered on top; stdio is shared with the launcher.
    pub fn command(&self) -> Command {
        let mut command = std::process::Command::new(&self.program);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.arg0(&self.arg0);
        }
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(ref dir) = self.working_directory {
            command.current_dir(dir);
        }
        Command::from(command)
    }
}

/// Map a finished child's status to the launcher's own exit code.
pub fn exit_code_of(status: &ExitStatus) -> (LaunchStatus, i32) {
    if let Some(code) = status.code() {
        let launch_status = if code == 0 {
            LaunchStatus::Success
        } else {
            LaunchStatus::Failed
        };
        return (launch_status, code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (LaunchStatus::Signaled, SIGNAL_EXIT_BASE + signal);
        }
    }

    (LaunchStatus::Failed, EXIT_FAILURE)
}

pub fn spawn_failure_code(kind: io::ErrorKind) -> i32 {
    match kind {
        io::ErrorKind::NotFound => EXIT_NOT_FOUND,
        io::ErrorKind::PermissionDenied => EXIT_NOT_EXECUTABLE,
        _ => EXIT_FAILURE,
    }
}

/// Exit code for an entrypoint that could not be resolved: 126 when the named
/// file exists but is not runnable, 127 otherwise.
pub fn unresolved_code(program: &str, cwd: &Path) -> i32 {
    let has_separator = program.contains(std::path::MAIN_SEPARATOR) || program.contains('/');
    if has_separator && cwd.join(program).exists() {
        EXIT_NOT_EXECUTABLE
    } else {
        EXIT_NOT_FOUND
    }
}
