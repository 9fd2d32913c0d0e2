//! Entry point that hands a command to the selected backend.
//!
//! Every backend maps to exactly one handler through an exhaustive match;
//! adding a backend without a handler does not compile.

use crate::backend::{resolve_backend, Backend, BackendRequest, EnvironmentProbe, HostProbe};
use crate::pathmap::{map_shared_path, rewrite_shared_paths, NFS_PREFIX};
use crate::template::{
    shell_join, DgxScript, JobScript, Vsc3Script, Vsc4Script, GPU_OUTPUT_FILE, JOB_SCRIPT_FILE,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};
use vqmc_core::{parse_duration, Configuration, Error, Result};

pub const DEFAULT_QUEUE: &str = "default";
pub const SUBMIT_PROGRAM: &str = "sbatch";

/// One command to run in one working directory.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub command: Vec<String>,
    pub working_directory: PathBuf,
    pub backend: BackendRequest,
    pub time_budget: String,
    /// Scheduler queue, or `default` for the backend's own default.
    pub queue: String,
    /// Conda environment activated by GPU job scripts.
    pub environment_name: String,
    pub job_name: String,
    /// Code directory exported as `PYTHONPATH` on the DGX.
    pub source_dir: Option<PathBuf>,
}

impl RunRequest {
    pub fn from_config(
        command: Vec<String>,
        working_directory: PathBuf,
        config: &Configuration,
    ) -> Result<Self> {
        Ok(Self {
            command,
            working_directory,
            backend: config.dispatch.system.parse()?,
            time_budget: config.dispatch.time.clone(),
            queue: script_field("dispatch.queue", &config.dispatch.queue)?,
            environment_name: script_field("dispatch.conda_env", &config.dispatch.conda_env)?,
            job_name: script_field("experiment_name", &config.experiment_name)?,
            source_dir: None,
        })
    }

    pub fn with_source_dir(mut self, source_dir: PathBuf) -> Self {
        self.source_dir = Some(source_dir);
        self
    }

    fn queue_or(&self, default: &str) -> Result<String> {
        if self.queue == DEFAULT_QUEUE {
            Ok(default.to_string())
        } else {
            script_field("queue", &self.queue)
        }
    }

    /// Wall-clock budget in minutes. Schedulers reject a zero limit, so it
    /// is refused here before anything touches the disk.
    fn minutes(&self) -> Result<u64> {
        let minutes = parse_duration(&self.time_budget)?;
        if minutes == 0 {
            return Err(Error::InvalidDuration {
                text: self.time_budget.clone(),
            });
        }
        Ok(minutes)
    }
}

/// Values written verbatim into `#SBATCH` and `conda activate` lines must
/// be a single non-empty word.
fn script_field(field: &'static str, value: &str) -> Result<String> {
    if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidConfig {
            field,
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

/// Runs a request on one concrete backend.
pub trait DispatchHandler {
    fn dispatch(&self, request: &RunRequest) -> Result<()>;
}

/// Builds the job script of one slurm cluster.
trait ScriptBuilder {
    fn build_script(&self, request: &RunRequest) -> Result<JobScript>;
}

struct LocalHandler;
struct LocalBackgroundHandler;

/// Writes `job.sh` and hands it to `submit_program` in the working directory.
struct SlurmHandler<'a, S> {
    builder: S,
    submit_program: &'a str,
}

struct Vsc3Jobs;
struct Vsc4Jobs;
struct DgxJobs;

/// Handler for `backend`. Only cluster handlers use `submit_program`.
pub fn handler_for<'a>(
    backend: Backend,
    submit_program: &'a str,
) -> Box<dyn DispatchHandler + 'a> {
    match backend {
        Backend::Local => Box::new(LocalHandler),
        Backend::LocalBackground => Box::new(LocalBackgroundHandler),
        Backend::Vsc3 => Box::new(SlurmHandler {
            builder: Vsc3Jobs,
            submit_program,
        }),
        Backend::Vsc4 => Box::new(SlurmHandler {
            builder: Vsc4Jobs,
            submit_program,
        }),
        Backend::Dgx => Box::new(SlurmHandler {
            builder: DgxJobs,
            submit_program,
        }),
    }
}

fn script_builder_for(backend: Backend) -> Option<&'static dyn ScriptBuilder> {
    match backend {
        Backend::Local | Backend::LocalBackground => None,
        Backend::Vsc3 => Some(&Vsc3Jobs),
        Backend::Vsc4 => Some(&Vsc4Jobs),
        Backend::Dgx => Some(&DgxJobs),
    }
}

/// Renders the job script `backend` would submit for `request` without
/// writing or submitting anything. Local backends have no script.
pub fn render_job_script(backend: Backend, request: &RunRequest) -> Result<Option<JobScript>> {
    script_builder_for(backend)
        .map(|builder| builder.build_script(request))
        .transpose()
}

fn command_for(tokens: &[String], working_directory: &Path) -> Command {
    let mut cmd = Command::new(&tokens[0]);
    cmd.args(&tokens[1..]);
    cmd.current_dir(working_directory);
    cmd
}

impl DispatchHandler for LocalHandler {
    fn dispatch(&self, request: &RunRequest) -> Result<()> {
        let status = command_for(&request.command, &request.working_directory).status()?;
        debug!(%status, "local command finished");
        Ok(())
    }
}

impl DispatchHandler for LocalBackgroundHandler {
    fn dispatch(&self, request: &RunRequest) -> Result<()> {
        info!(
            "Dispatching to local_background: {}",
            shell_join(&request.command)
        );
        let out = File::create(request.working_directory.join(GPU_OUTPUT_FILE))?;
        let err = out.try_clone()?;
        let mut cmd = command_for(&request.command, &request.working_directory);
        cmd.stdin(Stdio::null()).stdout(out).stderr(err);
        // New session: no controlling terminal, so the job survives the
        // dispatcher's terminal going away.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // SAFETY: setsid is async-signal-safe and touches no parent state.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        let child = cmd.spawn()?;
        debug!(pid = child.id(), "detached job started");
        Ok(())
    }
}

impl<S: ScriptBuilder> DispatchHandler for SlurmHandler<'_, S> {
    fn dispatch(&self, request: &RunRequest) -> Result<()> {
        let script = self.builder.build_script(request)?;
        let path = script.persist(&request.working_directory)?;
        debug!(path = %path.display(), "wrote job script");
        let status = Command::new(self.submit_program)
            .arg(JOB_SCRIPT_FILE)
            .current_dir(&request.working_directory)
            .status()?;
        debug!(%status, program = self.submit_program, "job submission finished");
        Ok(())
    }
}

impl ScriptBuilder for Vsc3Jobs {
    fn build_script(&self, request: &RunRequest) -> Result<JobScript> {
        Ok(JobScript::render(&Vsc3Script {
            job_name: script_field("job_name", &request.job_name)?,
            queue: request.queue_or("gpu_rtx2080ti")?,
            minutes: request.minutes()?,
            conda_env: script_field("environment_name", &request.environment_name)?,
            command: shell_join(&request.command),
        }))
    }
}

impl ScriptBuilder for Vsc4Jobs {
    fn build_script(&self, request: &RunRequest) -> Result<JobScript> {
        Ok(JobScript::render(&Vsc4Script {
            job_name: script_field("job_name", &request.job_name)?,
            queue: request.queue_or("mem_0096")?,
            minutes: request.minutes()?,
            command: shell_join(&request.command),
        }))
    }
}

impl ScriptBuilder for DgxJobs {
    fn build_script(&self, request: &RunRequest) -> Result<JobScript> {
        let minutes = request.minutes()?;
        let command = rewrite_shared_paths(&request.command, NFS_PREFIX);
        Ok(JobScript::render(&DgxScript {
            job_name: script_field("job_name", &request.job_name)?,
            job_dir: map_shared_path(&request.working_directory),
            minutes,
            conda_env: script_field("environment_name", &request.environment_name)?,
            python_path: request.source_dir.as_deref().map(map_shared_path),
            command: shell_join(&command),
        }))
    }
}

/// Dispatches requests using an environment probe for `auto` selection.
///
/// Holds no state that changes between calls.
#[derive(Debug, Clone)]
pub struct Dispatcher<P = HostProbe> {
    probe: P,
    submit_program: String,
}

impl Dispatcher<HostProbe> {
    pub fn new() -> Self {
        Self::with_probe(HostProbe)
    }
}

impl Default for Dispatcher<HostProbe> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: EnvironmentProbe> Dispatcher<P> {
    pub fn with_probe(probe: P) -> Self {
        Self {
            probe,
            submit_program: SUBMIT_PROGRAM.to_string(),
        }
    }

    /// Replaces `sbatch` as the program that receives `job.sh`.
    pub fn submit_program(mut self, program: impl Into<String>) -> Self {
        self.submit_program = program.into();
        self
    }

    pub fn resolve(&self, requested: BackendRequest) -> Result<Backend> {
        resolve_backend(requested, &self.probe)
    }

    /// Validates `request`, resolves its backend and hands it over.
    ///
    /// Blocks for `local` and for cluster submission; returns right after
    /// spawning for `local_background`. Exit codes of the launched process
    /// are not inspected.
    pub fn dispatch(&self, request: &RunRequest) -> Result<Backend> {
        if request.command.is_empty() {
            return Err(Error::EmptyCommand);
        }
        if !request.working_directory.is_dir() {
            return Err(Error::MissingWorkingDirectory {
                path: request.working_directory.clone(),
            });
        }
        let backend = self.resolve(request.backend)?;
        info!(
            "Dispatching command {} to: {}",
            shell_join(&request.command),
            backend
        );
        handler_for(backend, &self.submit_program).dispatch(request)?;
        Ok(backend)
    }
}

/// Dispatches `request` with the host probe and `sbatch`.
pub fn dispatch(request: &RunRequest) -> Result<Backend> {
    Dispatcher::new().dispatch(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FixedProbe;
    use chrono::Utc;
    use std::fs;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "vqmc_dispatch_{}_test_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn request(command: &[&str], dir: &Path, backend: BackendRequest) -> RunRequest {
        RunRequest {
            command: command.iter().map(|s| s.to_string()).collect(),
            working_directory: dir.to_path_buf(),
            backend,
            time_budget: "2h".to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            environment_name: "jax".to_string(),
            job_name: "h2".to_string(),
            source_dir: None,
        }
    }

    fn dispatcher() -> Dispatcher<FixedProbe> {
        Dispatcher::with_probe(FixedProbe::default()).submit_program("true")
    }

    #[test]
    fn request_from_config_reads_dispatch_section() {
        let cfg = Configuration::from_yaml_str(
            "experiment_name: lih\ndispatch:\n  system: VSC3\n  time: 3h\n  queue: gpu_a40dual\n  conda_env: dw\n",
        )
        .expect("config");
        let req = RunRequest::from_config(vec!["python".to_string()], PathBuf::from("/tmp"), &cfg)
            .expect("request");
        assert_eq!(req.backend, BackendRequest::Named(Backend::Vsc3));
        assert_eq!(req.time_budget, "3h");
        assert_eq!(req.queue, "gpu_a40dual");
        assert_eq!(req.environment_name, "dw");
        assert_eq!(req.job_name, "lih");
    }

    #[test]
    fn request_from_config_rejects_unknown_system() {
        let cfg =
            Configuration::from_yaml_str("dispatch:\n  system: vsc9\n").expect("config");
        let err = RunRequest::from_config(vec!["python".to_string()], PathBuf::from("/tmp"), &cfg)
            .expect_err("unknown backend");
        assert!(matches!(err, Error::UnknownBackend { .. }));
    }

    #[test]
    fn request_from_config_rejects_values_that_break_directives() {
        for yaml in [
            "experiment_name: \"h2\\n#SBATCH --qos evil\"\n",
            "dispatch:\n  queue: \"gpu a40\"\n",
            "dispatch:\n  conda_env: \"\"\n",
        ] {
            let cfg = Configuration::from_yaml_str(yaml).expect("config");
            let err =
                RunRequest::from_config(vec!["python".to_string()], PathBuf::from("/tmp"), &cfg)
                    .expect_err("must reject");
            assert!(matches!(err, Error::InvalidConfig { .. }), "{}", yaml);
        }
    }

    #[test]
    fn cluster_dispatch_rejects_multiline_job_name_before_writing() {
        let dir = temp_dir("bad_job_name");
        let mut req = request(&["python"], &dir, BackendRequest::Named(Backend::Vsc4));
        req.job_name = "h2\n#SBATCH --qos evil".to_string();
        let err = dispatcher().dispatch(&req).expect_err("must reject");
        assert!(matches!(
            err,
            Error::InvalidConfig {
                field: "job_name",
                ..
            }
        ));
        assert!(!dir.join(JOB_SCRIPT_FILE).exists());

        let mut req = request(&["python"], &dir, BackendRequest::Named(Backend::Vsc3));
        req.environment_name = "jax && rm".to_string();
        assert!(matches!(
            render_job_script(Backend::Vsc3, &req),
            Err(Error::InvalidConfig { .. })
        ));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn local_handlers_ignore_the_submit_program() {
        let dir = temp_dir("local_submit");
        let req = request(&["true"], &dir, BackendRequest::Named(Backend::Local));
        handler_for(Backend::Local, "/nonexistent/sbatch")
            .dispatch(&req)
            .expect("local dispatch");
        assert!(!dir.join(JOB_SCRIPT_FILE).exists());

        let req = request(&["python"], &dir, BackendRequest::Named(Backend::Vsc4));
        let err = handler_for(Backend::Vsc4, "/nonexistent/sbatch")
            .dispatch(&req)
            .expect_err("missing submit program");
        assert!(matches!(err, Error::Io(_)));
        assert!(dir.join(JOB_SCRIPT_FILE).exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn default_queues_are_substituted_per_backend() {
        let dir = temp_dir("queues");
        let req = request(&["python", "run.py"], &dir, BackendRequest::Auto);
        let vsc3 = render_job_script(Backend::Vsc3, &req).expect("render").expect("script");
        assert!(vsc3.text().contains("#SBATCH --partition gpu_rtx2080ti\n"));
        let vsc4 = render_job_script(Backend::Vsc4, &req).expect("render").expect("script");
        assert!(vsc4.text().contains("#SBATCH --qos mem_0096\n"));
        assert!(vsc4.text().contains("#SBATCH --time 120\n"));

        let custom = RunRequest {
            queue: "mem_0384".to_string(),
            ..req.clone()
        };
        let vsc4 = render_job_script(Backend::Vsc4, &custom).expect("render").expect("script");
        assert!(vsc4.text().contains("#SBATCH --partition mem_0384\n"));

        assert!(render_job_script(Backend::Local, &req).expect("render").is_none());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn rendering_is_deterministic() {
        let dir = temp_dir("deterministic");
        let req = request(&["python", "run.py"], &dir, BackendRequest::Auto);
        for backend in [Backend::Vsc3, Backend::Vsc4, Backend::Dgx] {
            let a = render_job_script(backend, &req).expect("render");
            let b = render_job_script(backend, &req).expect("render");
            assert_eq!(a, b);
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn dgx_script_uses_mount_paths() {
        let dir = temp_dir("dgx");
        let cfg = dir.join("config.yml");
        fs::write(&cfg, "experiment_name: h2\n").expect("config");
        let cfg_str = cfg.to_string_lossy().to_string();
        let req = request(&["python", "-m", "deeperwin", &cfg_str], &dir, BackendRequest::Auto);

        let script = render_job_script(Backend::Dgx, &req).expect("render").expect("script");
        let last = script.text().lines().last().expect("command line");
        assert_eq!(last, format!("python -m deeperwin /nfs{}", cfg_str));
        let chdir = format!("#SBATCH --chdir {}\n", map_shared_path(&dir).display());
        assert!(script.text().contains(&chdir));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn zero_minute_budget_is_rejected_before_writing() {
        let dir = temp_dir("zero_budget");
        let mut req = request(&["python"], &dir, BackendRequest::Named(Backend::Vsc3));
        req.time_budget = "30s".to_string();
        let err = dispatcher().dispatch(&req).expect_err("zero budget");
        assert!(matches!(err, Error::InvalidDuration { .. }));
        assert!(!dir.join(JOB_SCRIPT_FILE).exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn empty_command_and_missing_directory_are_rejected() {
        let dir = temp_dir("invalid");
        let req = request(&[], &dir, BackendRequest::Named(Backend::Local));
        assert!(matches!(
            dispatcher().dispatch(&req),
            Err(Error::EmptyCommand)
        ));

        let req = request(&["true"], &dir.join("missing"), BackendRequest::Named(Backend::Local));
        assert!(matches!(
            dispatcher().dispatch(&req),
            Err(Error::MissingWorkingDirectory { .. })
        ));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unknown_override_fails_without_side_effects() {
        let dir = temp_dir("unknown_override");
        let d = Dispatcher::with_probe(FixedProbe {
            system_override: Some("cray".to_string()),
            ..Default::default()
        })
        .submit_program("true");
        let req = request(&["true"], &dir, BackendRequest::Auto);
        assert!(matches!(d.dispatch(&req), Err(Error::UnknownBackend { .. })));
        assert_eq!(fs::read_dir(&dir).expect("read").count(), 0);
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn local_backend_blocks_until_the_command_finishes() {
        let dir = temp_dir("local");
        let req = request(
            &["sh", "-c", "sleep 1 && echo done > marker.txt"],
            &dir,
            BackendRequest::Auto,
        );
        let backend = dispatcher().dispatch(&req).expect("dispatch");
        assert_eq!(backend, Backend::Local);
        assert_eq!(
            fs::read_to_string(dir.join("marker.txt")).expect("marker"),
            "done\n"
        );
        assert!(!dir.join(JOB_SCRIPT_FILE).exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn local_background_redirects_output_and_returns() {
        let dir = temp_dir("background");
        let req = request(
            &["sh", "-c", "echo started"],
            &dir,
            BackendRequest::Named(Backend::LocalBackground),
        );
        let backend = dispatcher().dispatch(&req).expect("dispatch");
        assert_eq!(backend, Backend::LocalBackground);
        assert!(dir.join(GPU_OUTPUT_FILE).exists());
        assert!(!dir.join(JOB_SCRIPT_FILE).exists());

        let mut output = String::new();
        for _ in 0..50 {
            output = fs::read_to_string(dir.join(GPU_OUTPUT_FILE)).expect("read output");
            if !output.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        assert_eq!(output, "started\n");
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn local_background_starts_a_new_session() {
        let dir = temp_dir("session");
        let req = request(
            &["cat", "/proc/self/stat"],
            &dir,
            BackendRequest::Named(Backend::LocalBackground),
        );
        dispatcher().dispatch(&req).expect("dispatch");

        let mut stat = String::new();
        for _ in 0..50 {
            stat = fs::read_to_string(dir.join(GPU_OUTPUT_FILE)).expect("read output");
            if stat.ends_with('\n') {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        // Fields after the parenthesised command name: state ppid pgrp session.
        let after_comm = stat.rsplit_once(')').expect("stat line").1;
        let child_sid: i32 = after_comm
            .split_whitespace()
            .nth(3)
            .expect("session field")
            .parse()
            .expect("session id");
        let parent_sid = unsafe { libc::getsid(0) };
        assert_ne!(child_sid, parent_sid);
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn cluster_backend_writes_and_submits_job_script() {
        let dir = temp_dir("submit");
        let probe = FixedProbe {
            system_override: Some("vsc4".to_string()),
            ..Default::default()
        };
        // `sh job.sh` stands in for sbatch: the script's last line runs in
        // the working directory.
        let d = Dispatcher::with_probe(probe).submit_program("sh");
        let req = request(&["touch", "submitted.txt"], &dir, BackendRequest::Auto);
        let backend = d.dispatch(&req).expect("dispatch");
        assert_eq!(backend, Backend::Vsc4);

        let script = fs::read_to_string(dir.join(JOB_SCRIPT_FILE)).expect("job.sh");
        assert!(script.starts_with("#!/bin/bash\n#SBATCH -J h2\n"));
        assert!(script.ends_with("\ntouch submitted.txt"));
        assert!(dir.join("submitted.txt").exists());
        let _ = fs::remove_dir_all(dir);
    }
}
