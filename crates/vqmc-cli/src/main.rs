use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use vqmc_core::Configuration;
use vqmc_runner::{Backend, BackendRequest, Dispatcher, RunRequest};

#[derive(Parser)]
#[command(name = "vqmc", version, about = "Dispatch VQMC training runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Auto,
    Local,
    #[value(name = "local_background")]
    LocalBackground,
    Vsc3,
    Vsc4,
    Dgx,
}

impl From<BackendArg> for BackendRequest {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Auto => BackendRequest::Auto,
            BackendArg::Local => BackendRequest::Named(Backend::Local),
            BackendArg::LocalBackground => BackendRequest::Named(Backend::LocalBackground),
            BackendArg::Vsc3 => BackendRequest::Named(Backend::Vsc3),
            BackendArg::Vsc4 => BackendRequest::Named(Backend::Vsc4),
            BackendArg::Dgx => BackendRequest::Named(Backend::Dgx),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on the configured backend.
    Dispatch {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        workdir: PathBuf,
        /// Overrides `dispatch.system` from the config.
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
        /// Directory exported as PYTHONPATH on the DGX.
        #[arg(long)]
        source_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
    /// Print the job script a cluster backend would submit.
    Render {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        workdir: PathBuf,
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
        #[arg(long)]
        source_dir: Option<PathBuf>,
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
    ResolveBackend {
        #[arg(long, value_enum, default_value_t = BackendArg::Auto)]
        backend: BackendArg,
        #[arg(long)]
        json: bool,
    },
    SetupExperiment {
        dir: PathBuf,
        /// Deletes an existing directory first. Irreversible.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
    SetupJob {
        parent: PathBuf,
        #[arg(long, conflicts_with = "name", required_unless_present = "name")]
        index: Option<usize>,
        #[arg(long)]
        name: Option<String>,
        /// Snapshot this config into the job directory.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    FindRuns {
        root: PathBuf,
        #[arg(long)]
        include_checkpoints: bool,
        #[arg(long)]
        json: bool,
    },
    ParseDuration {
        text: String,
        #[arg(long)]
        json: bool,
    },
    ExperimentName {
        #[arg(long, default_value = "")]
        basename: String,
        #[arg(long)]
        shorthand: bool,
        #[arg(long = "param")]
        params: Vec<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Dispatch {
            config,
            workdir,
            backend,
            source_dir,
            json,
            cmd,
        } => {
            let request = build_request(cmd, workdir, config.as_deref(), backend, source_dir)?;
            let resolved = Dispatcher::new().dispatch(&request)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "dispatch",
                    "backend": resolved.as_str(),
                    "workdir": request.working_directory.display().to_string(),
                    "job_script": resolved.is_cluster().then(|| {
                        request
                            .working_directory
                            .join(vqmc_runner::JOB_SCRIPT_FILE)
                            .display()
                            .to_string()
                    }),
                })));
            }
            println!("backend: {}", resolved);
        }
        Commands::Render {
            config,
            workdir,
            backend,
            source_dir,
            cmd,
        } => {
            let request = build_request(cmd, workdir, config.as_deref(), backend, source_dir)?;
            let resolved = Dispatcher::new().resolve(request.backend)?;
            let script = vqmc_runner::render_job_script(resolved, &request)?.ok_or_else(|| {
                anyhow!("backend {} runs without a job script", resolved)
            })?;
            println!("{}", script.text());
        }
        Commands::ResolveBackend { backend, json } => {
            let resolved = Dispatcher::new().resolve(backend.into())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "resolve-backend",
                    "requested": backend
                        .to_possible_value()
                        .map(|v| v.get_name().to_string()),
                    "backend": resolved.as_str(),
                })));
            }
            println!("{}", resolved);
        }
        Commands::SetupExperiment { dir, force, json } => {
            let dir = vqmc_core::create_experiment_directory(&dir, force)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "setup-experiment",
                    "dir": dir.display().to_string(),
                    "forced": force,
                })));
            }
            println!("created: {}", dir.display());
        }
        Commands::SetupJob {
            parent,
            index,
            name,
            config,
            json,
        } => {
            let name = match (index, name) {
                (Some(i), _) => vqmc_core::job_index_name(i),
                (None, Some(n)) => n,
                (None, None) => return Err(anyhow!("either --index or --name is required")),
            };
            let job_dir = vqmc_core::create_job_directory(&parent, &name)?;
            let snapshot = match config {
                Some(path) => {
                    let cfg = Configuration::load(&path)?;
                    Some(vqmc_core::dump_config(
                        &job_dir,
                        &cfg,
                        vqmc_core::CONFIG_FILE,
                    )?)
                }
                None => None,
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "setup-job",
                    "job_dir": job_dir.display().to_string(),
                    "config_snapshot": snapshot.map(|p| p.display().to_string()),
                })));
            }
            println!("job_dir: {}", job_dir.display());
            if let Some(p) = snapshot {
                println!("config_snapshot: {}", p.display());
            }
        }
        Commands::FindRuns {
            root,
            include_checkpoints,
            json,
        } => {
            let runs = vqmc_core::find_runs(&root, include_checkpoints)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "find-runs",
                    "root": root.display().to_string(),
                    "runs": runs.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                })));
            }
            for run in runs {
                println!("{}", run.display());
            }
        }
        Commands::ParseDuration { text, json } => {
            let minutes = vqmc_core::parse_duration(&text)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "parse-duration",
                    "text": text,
                    "minutes": minutes,
                })));
            }
            println!("{}", minutes);
        }
        Commands::ExperimentName {
            basename,
            shorthand,
            params,
            json,
        } => {
            let pairs = parse_params(&params)?;
            let name = vqmc_core::build_experiment_name(&pairs, shorthand, &basename);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "experiment-name",
                    "name": name,
                })));
            }
            println!("{}", name);
        }
    }
    Ok(None)
}

fn build_request(
    cmd: Vec<String>,
    workdir: PathBuf,
    config: Option<&Path>,
    backend: Option<BackendArg>,
    source_dir: Option<PathBuf>,
) -> Result<RunRequest> {
    let cfg = match config {
        Some(path) => Configuration::load(path)?,
        None => Configuration::default(),
    };
    let mut request = RunRequest::from_config(cmd, workdir, &cfg)?;
    if let Some(backend) = backend {
        request.backend = backend.into();
    }
    if let Some(dir) = source_dir {
        request = request.with_source_dir(dir);
    }
    Ok(request)
}

fn parse_params(values: &[String]) -> Result<Vec<(String, String)>> {
    values
        .iter()
        .map(|raw| {
            let (key, value) = raw
                .split_once('=')
                .ok_or_else(|| anyhow!("invalid --param '{}': expected k=v", raw))?;
            if key.trim().is_empty() {
                return Err(anyhow!("invalid --param '{}': key cannot be empty", raw));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Dispatch { json, .. }
        | Commands::ResolveBackend { json, .. }
        | Commands::SetupExperiment { json, .. }
        | Commands::SetupJob { json, .. }
        | Commands::FindRuns { json, .. }
        | Commands::ParseDuration { json, .. }
        | Commands::ExperimentName { json, .. } => *json,
        Commands::Render { .. } => false,
    }
}
