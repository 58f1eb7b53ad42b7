use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use trainlaunch_config::{
    default_plan, load_launchfile, parse_device_list, parse_env_assignment, Overrides,
    DEFAULT_LAUNCHFILE, LAUNCHFILE_TEMPLATE,
};
use trainlaunch_core::{shell_quote, LaunchPlan, LaunchRecord, NcclDebug};
use trainlaunch_runner::LaunchExecutor;

/// Exit code for failures before anything is launched
const EXIT_CONFIG: i32 = 2;

#[derive(Parser)]
#[command(name = "trainlaunch")]
#[command(about = "Set up the training environment and launch the training program", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the training program and exit with its status
    Run {
        #[command(flatten)]
        plan: PlanArgs,

        /// Print the command instead of running it
        #[arg(long)]
        dry_run: bool,

        /// Write a JSON launch record here once the program exits
        #[arg(long)]
        record: Option<PathBuf>,
    },

    /// Show the environment and command line without launching
    Show {
        #[command(flatten)]
        plan: PlanArgs,

        /// Print the resolved plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate Launchfile template
    Init {
        /// Where to write the template
        #[arg(short, long, default_value = DEFAULT_LAUNCHFILE)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug, Default)]
struct PlanArgs {
    /// Launchfile to load (built-in defaults otherwise)
    #[arg(short, long)]
    launchfile: Option<PathBuf>,

    /// Training entrypoint program
    #[arg(long)]
    program: Option<String>,

    /// Dataset path
    #[arg(long)]
    data: Option<PathBuf>,

    /// Data loading workers
    #[arg(short = 'j', long)]
    workers: Option<u32>,

    #[arg(long)]
    epochs: Option<u32>,

    #[arg(short, long)]
    batch_size: Option<u32>,

    /// Experiment tracking backend
    #[arg(long)]
    report_to: Option<String>,

    /// Run name
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    seed: Option<u64>,

    /// Coordination URL, e.g. tcp://10.0.0.1:29500
    #[arg(long)]
    dist_url: Option<String>,

    /// Number of nodes
    #[arg(long)]
    world_size: Option<u32>,

    /// Index of this node
    #[arg(long)]
    rank: Option<u32>,

    /// Visible accelerator devices, e.g. 0,1,2,3
    #[arg(long)]
    devices: Option<String>,

    /// OMP_NUM_THREADS
    #[arg(long)]
    omp_threads: Option<u32>,

    /// NCCL_DEBUG level (VERSION, WARN, INFO, TRACE)
    #[arg(long)]
    nccl_debug: Option<NcclDebug>,

    /// NCCL_TIMEOUT in seconds
    #[arg(long)]
    nccl_timeout: Option<u64>,

    /// NCCL_SOCKET_IFNAME
    #[arg(long)]
    nccl_ifname: Option<String>,

    /// Extra environment variable for the child (KEY=VALUE, repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Working directory for the training program
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Further arguments passed to the training program verbatim
    #[arg(last = true)]
    extra_args: Vec<String>,
}

impl PlanArgs {
    fn overrides(&self) -> anyhow::Result<Overrides> {
        let devices = match self.devices {
            Some(ref devices) => Some(parse_device_list(devices)?),
            None => None,
        };
        let env = self
            .env
            .iter()
            .map(|assignment| parse_env_assignment(assignment))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Overrides {
            program: self.program.clone(),
            data: self.data.clone(),
            workers: self.workers,
            epochs: self.epochs,
            batch_size: self.batch_size,
            report_to: self.report_to.clone(),
            name: self.name.clone(),
            seed: self.seed,
            dist_url: self.dist_url.clone(),
            world_size: self.world_size,
            rank: self.rank,
            devices,
            omp_threads: self.omp_threads,
            nccl_debug: self.nccl_debug,
            nccl_timeout_secs: self.nccl_timeout,
            nccl_ifname: self.nccl_ifname.clone(),
            env,
            extra_args: self.extra_args.clone(),
        })
    }

    fn resolve(&self) -> anyhow::Result<LaunchPlan> {
        let mut plan = match self.launchfile {
            Some(ref path) => load_launchfile(path)
                .with_context(|| format!("Failed to load Launchfile {}", path.display()))?,
            None => default_plan(),
        };
        self.overrides()?.apply(&mut plan);
        Ok(plan)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { plan, dry_run, record } => {
            let launch_plan = resolve_or_exit(&plan);
            if dry_run {
                match dry_run_line(&launch_plan) {
                    Ok(line) => println!("{}", line),
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        process::exit(EXIT_CONFIG);
                    }
                }
                return Ok(());
            }

            let mut executor = LaunchExecutor::new();
            if let Some(ref dir) = plan.work_dir {
                executor = executor.with_work_dir(dir);
            }

            let launch_record = match executor.execute(&launch_plan).await {
                Ok(launch_record) => launch_record,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    process::exit(EXIT_CONFIG);
                }
            };

            if let Some(ref path) = record {
                if let Err(e) = write_record(path, &launch_record) {
                    eprintln!("Warning: {:#}", e);
                }
            }
            process::exit(launch_record.exit_code);
        }
        Commands::Show { plan, json } => {
            let launch_plan = resolve_or_exit(&plan);
            if json {
                println!("{}", serde_json::to_string_pretty(&launch_plan)?);
            } else {
                print!("{}", render_plan(&launch_plan));
            }
        }
        Commands::Init { path, force } => {
            if let Err(e) = generate_launchfile_template(&path, force) {
                eprintln!("Error: {:#}", e);
                process::exit(1);
            }
            println!("✓ Created Launchfile template at {}", path.display());
        }
    }

    Ok(())
}

fn resolve_or_exit(args: &PlanArgs) -> LaunchPlan {
    match args.resolve() {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(EXIT_CONFIG);
        }
    }
}

/// Validated plan as a single shell line; nothing is launched.
fn dry_run_line(plan: &LaunchPlan) -> trainlaunch_core::Result<String> {
    plan.validate()?;
    Ok(plan.shell_line())
}

fn render_plan(plan: &LaunchPlan) -> String {
    let mut out = String::from("Environment:\n");
    for (name, value) in plan.env.vars() {
        out.push_str(&format!("  {}={}\n", name, shell_quote(&value)));
    }

    let command = plan
        .command_line()
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    out.push_str(&format!("\nCommand:\n  {}\n", command));

    let warnings = plan.warnings();
    if !warnings.is_empty() {
        out.push_str("\nWarnings:\n");
        for warning in warnings {
            out.push_str(&format!("  {}\n", warning));
        }
    }
    out
}

fn write_record(path: &Path, record: &LaunchRecord) -> anyhow::Result<()> {
    let json = record.to_json()?;
    fs::write(path, json)
        .with_context(|| format!("Failed to write launch record to {}", path.display()))?;
    Ok(())
}

fn generate_launchfile_template(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; use --force to overwrite it or pass a different --path",
            path.display()
        );
    }

    fs::write(path, LAUNCHFILE_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trainlaunch_core::LaunchStatus;

    fn plan_args(argv: &[&str]) -> PlanArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Commands::Run { plan, .. } | Commands::Show { plan, .. } => plan,
            Commands::Init { .. } => panic!("expected a plan command"),
        }
    }

    #[test]
    fn test_run_without_arguments_uses_default_plan() {
        let plan = plan_args(&["trainlaunch", "run"]).resolve().unwrap();
        assert_eq!(plan, default_plan());
    }

    #[test]
    fn test_overrides_from_command_line() {
        let plan = plan_args(&[
            "trainlaunch",
            "show",
            "--epochs",
            "300",
            "-b",
            "512",
            "--devices",
            "0,1",
            "--nccl-debug",
            "warn",
            "--env",
            "WANDB_MODE=offline",
            "--",
            "--lr",
            "0.003",
        ])
        .resolve()
        .unwrap();

        assert_eq!(plan.training.epochs, 300);
        assert_eq!(plan.training.batch_size, 512);
        assert_eq!(plan.env.cuda_visible_devices, vec![0, 1]);
        assert_eq!(plan.env.nccl_debug, NcclDebug::Warn);
        assert_eq!(
            plan.env.extra.get("WANDB_MODE").map(String::as_str),
            Some("offline")
        );
        assert_eq!(
            plan.training.extra_args,
            vec!["--lr".to_string(), "0.003".to_string()]
        );
    }

    #[test]
    fn test_bad_env_assignment_is_rejected() {
        let args = plan_args(&["trainlaunch", "run", "--env", "NOVALUE"]);
        assert!(args.resolve().is_err());
    }

    #[test]
    fn test_missing_launchfile_is_rejected() {
        let args = plan_args(&["trainlaunch", "run", "-l", "/nonexistent/Launch.toml"]);
        assert!(args.resolve().is_err());
    }

    fn scratch_path(suffix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("trainlaunch-{}.{}", uuid::Uuid::new_v4(), suffix))
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let path = scratch_path("toml");
        fs::write(&path, "# mine\n").unwrap();

        let result = generate_launchfile_template(&path, false);

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "# mine\n");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_init_force_overwrites() {
        let path = scratch_path("toml");
        fs::write(&path, "# mine\n").unwrap();

        generate_launchfile_template(&path, true).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), LAUNCHFILE_TEMPLATE);
        assert_eq!(load_launchfile(&path).unwrap(), default_plan());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_init_writes_new_file() {
        let path = scratch_path("toml");

        generate_launchfile_template(&path, false).unwrap();

        assert!(path.exists());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_record_written_as_json() {
        let path = scratch_path("json");
        let started_at = chrono::Utc::now();
        let record = LaunchRecord {
            id: uuid::Uuid::new_v4(),
            run_name: "vit-s16-90ep".to_string(),
            program: "python".to_string(),
            argv: default_plan().argv(),
            env: default_plan().env.vars(),
            status: LaunchStatus::Failed,
            exit_code: 3,
            duration_ms: 42,
            started_at,
            completed_at: Some(started_at),
        };

        write_record(&path, &record).unwrap();

        let loaded: LaunchRecord =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.status, LaunchStatus::Failed);
        assert_eq!(loaded.exit_code, 3);
        assert_eq!(loaded.argv, record.argv);
        assert_eq!(loaded.env, record.env);
        assert_eq!(loaded.started_at, started_at);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_dry_run_line_matches_plan() {
        let mut plan = default_plan();
        plan.training.data = std::env::temp_dir();
        assert_eq!(dry_run_line(&plan).unwrap(), plan.shell_line());
    }

    #[test]
    fn test_dry_run_rejects_invalid_plan() {
        let mut plan = default_plan();
        plan.training.rank = 1;
        assert!(dry_run_line(&plan).is_err());
    }

    #[test]
    fn test_show_quotes_arguments() {
        let plan = plan_args(&["trainlaunch", "show", "--name", "my run"])
            .resolve()
            .unwrap();

        let rendered = render_plan(&plan);

        assert!(rendered.contains("--name 'my run' --seed"));
        assert!(rendered.contains("  NCCL_DEBUG=INFO\n"));
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
