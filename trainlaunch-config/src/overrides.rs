use std::path::PathBuf;
use trainlaunch_core::{LaunchError, LaunchPlan, NcclDebug, Result};

/// Values given on the command line; each one replaces the plan's value when set.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub program: Option<String>,
    pub data: Option<PathBuf>,
    pub workers: Option<u32>,
    pub epochs: Option<u32>,
    pub batch_size: Option<u32>,
    pub report_to: Option<String>,
    pub name: Option<String>,
    pub seed: Option<u64>,
    pub dist_url: Option<String>,
    pub world_size: Option<u32>,
    pub rank: Option<u32>,
    pub devices: Option<Vec<u32>>,
    pub omp_threads: Option<u32>,
    pub nccl_debug: Option<NcclDebug>,
    pub nccl_timeout_secs: Option<u64>,
    pub nccl_ifname: Option<String>,
    pub env: Vec<(String, String)>,
    /// Appended after any extra_args from the Launchfile
    pub extra_args: Vec<String>,
}

impl Overrides {
    pub fn apply(&self, plan: &mut LaunchPlan) {
        let training = &mut plan.training;
        let env = &mut plan.env;

        if let Some(ref program) = self.program {
            plan.entrypoint.program = program.clone();
        }
        if let Some(ref data) = self.data {
            training.data = data.clone();
        }
        if let Some(workers) = self.workers {
            training.workers = workers;
        }
        if let Some(epochs) = self.epochs {
            training.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            training.batch_size = batch_size;
        }
        if let Some(ref report_to) = self.report_to {
            training.report_to = report_to.clone();
        }
        if let Some(ref name) = self.name {
            training.name = name.clone();
        }
        if let Some(seed) = self.seed {
            training.seed = seed;
        }
        if let Some(ref dist_url) = self.dist_url {
            training.dist_url = dist_url.clone();
        }
        if let Some(world_size) = self.world_size {
            training.world_size = world_size;
        }
        if let Some(rank) = self.rank {
            training.rank = rank;
        }
        training.extra_args.extend(self.extra_args.iter().cloned());

        if let Some(ref devices) = self.devices {
            env.cuda_visible_devices = devices.clone();
        }
        if let Some(threads) = self.omp_threads {
            env.omp_num_threads = threads;
        }
        if let Some(level) = self.nccl_debug {
            env.nccl_debug = level;
        }
        if let Some(timeout) = self.nccl_timeout_secs {
            env.nccl_timeout_secs = timeout;
        }
        if let Some(ref ifname) = self.nccl_ifname {
            env.nccl_socket_ifname = ifname.clone();
        }
        for (key, value) in &self.env {
            env.extra.insert(key.clone(), value.clone());
        }
    }
}

/// Parse `KEY=VALUE`. The value may itself contain `=`.
pub fn parse_env_assignment(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(LaunchError::ParseError(format!(
            "expected KEY=VALUE, got '{}'",
            s
        ))),
    }
}

/// Parse a device list such as `0,1,2,3`.
pub fn parse_device_list(s: &str) -> Result<Vec<u32>> {
    s.split(',')
        .map(|part| {
            let part = part.trim();
            part.parse::<u32>().map_err(|_| {
                LaunchError::ParseError(format!("'{}' is not a device index", part))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::default_plan;

    #[test]
    fn test_no_overrides_keeps_plan() {
        let mut plan = default_plan();
        Overrides::default().apply(&mut plan);
        assert_eq!(plan, default_plan());
    }

    #[test]
    fn test_overrides_replace_values() {
        let overrides = Overrides {
            data: Some(PathBuf::from("/scratch/imagenet")),
            epochs: Some(300),
            world_size: Some(4),
            rank: Some(3),
            devices: Some(vec![2, 3]),
            nccl_debug: Some(NcclDebug::Warn),
            env: vec![("WANDB_MODE".to_string(), "offline".to_string())],
            extra_args: vec!["--no-amp".to_string()],
            ..Default::default()
        };

        let mut plan = default_plan();
        overrides.apply(&mut plan);

        assert_eq!(plan.training.data, PathBuf::from("/scratch/imagenet"));
        assert_eq!(plan.training.epochs, 300);
        assert_eq!(plan.training.world_size, 4);
        assert_eq!(plan.training.rank, 3);
        assert_eq!(plan.training.batch_size, 1024);
        assert_eq!(plan.training.extra_args, vec!["--no-amp".to_string()]);
        assert_eq!(plan.env.cuda_visible_devices, vec![2, 3]);
        assert_eq!(plan.env.nccl_debug, NcclDebug::Warn);
        assert_eq!(
            plan.env.extra.get("WANDB_MODE").map(String::as_str),
            Some("offline")
        );
    }

    #[test]
    fn test_parse_env_assignment() {
        assert_eq!(
            parse_env_assignment("WANDB_MODE=offline").unwrap(),
            ("WANDB_MODE".to_string(), "offline".to_string())
        );
        assert_eq!(
            parse_env_assignment("OPTS=a=b").unwrap(),
            ("OPTS".to_string(), "a=b".to_string())
        );
        assert_eq!(
            parse_env_assignment("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
        assert!(parse_env_assignment("NOVALUE").is_err());
        assert!(parse_env_assignment("=value").is_err());
    }

    #[test]
    fn test_parse_device_list() {
        assert_eq!(parse_device_list("0,1, 2").unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_device_list("5").unwrap(), vec![5]);
        assert!(parse_device_list("0,,1").is_err());
        assert!(parse_device_list("gpu0").is_err());
    }
}
