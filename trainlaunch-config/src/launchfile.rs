use std::fs;
use std::path::Path;
use tracing::debug;
use trainlaunch_core::{LaunchError, LaunchPlan, Result};

pub const DEFAULT_LAUNCHFILE: &str = "Launch.toml";

pub const LAUNCHFILE_TEMPLATE: &str = r#"# Launch.toml - trainlaunch plan

[entrypoint]
program = "python"
args = ["main.py"]

[env]
omp_num_threads = 8
cuda_visible_devices = [0, 1, 2, 3, 4, 5, 6, 7]
nccl_debug = "INFO"
nccl_timeout_secs = 3600
nccl_socket_ifname = "eth0"

# Any further variables for the child process
[env.extra]

[training]
data = "/data/imagenet"
workers = 16
epochs = 90
batch_size = 1024
report_to = "wandb"
name = "vit-s16-90ep"
seed = 0
multiprocessing_distributed = true
dist_url = "tcp://127.0.0.1:29500"
world_size = 1
rank = 0

# Optional:
# dist_backend = "nccl"
# logs = "./logs/"
# wandb_notes = ""
# resume = "logs/vit-s16-90ep/checkpoints/latest.pt"
# fake_data = false
# evaluate = false
# extra_args = ["--lr", "0.001"]
"#;

/// The plan the launcher runs when no Launchfile is given
pub fn default_plan() -> LaunchPlan {
    LaunchPlan::default()
}

/// Parse a Launchfile string into a LaunchPlan
pub fn parse_launchfile(input: &str) -> Result<LaunchPlan> {
    toml::from_str(input).map_err(|e| LaunchError::ParseError(e.to_string()))
}

pub fn load_launchfile<P: AsRef<Path>>(path: P) -> Result<LaunchPlan> {
    let path = path.as_ref();
    debug!(path = %path.display(), "Loading launchfile");

    let content = fs::read_to_string(path).map_err(|e| {
        LaunchError::ConfigError(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse_launchfile(&content)
}
