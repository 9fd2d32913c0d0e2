//! Slurm job scripts, one named variant per cluster.
//!
//! Each variant owns its cluster's quirks (modules, conda setup, path
//! remapping) instead of sharing one template full of conditionals. All
//! variants end with a single line: the command to run.

use std::fs;
use std::path::{Path, PathBuf};
use vqmc_core::Result;

/// File name of the persisted job script inside the working directory.
pub const JOB_SCRIPT_FILE: &str = "job.sh";
pub const GPU_OUTPUT_FILE: &str = "GPU.out";
pub const CPU_OUTPUT_FILE: &str = "CPU.out";

/// Partition on VSC3 whose nodes must not be requested with `-N 1`.
const VSC3_DUAL_GPU_QUEUE: &str = "gpu_a40dual";
const VSC3_CUDA_MODULE: &str = "cuda/11.2.2";
const VSC3_CONDA_PROFILE: &str =
    "/opt/sw/x86_64/glibc-2.17/ivybridge-ep/anaconda3/5.3.0/etc/profile.d/conda.sh";
const DGX_CONDA_PROFILE: &str = "/opt/anaconda3/etc/profile.d/conda.sh";

pub trait JobTemplate {
    fn render(&self) -> String;
    /// Name of the file the scheduler redirects job output to.
    fn output_file(&self) -> &'static str;
}

/// CPU partitions on VSC4.
#[derive(Debug, Clone, PartialEq)]
pub struct Vsc4Script {
    pub job_name: String,
    pub queue: String,
    pub minutes: u64,
    pub command: String,
}

impl JobTemplate for Vsc4Script {
    fn render(&self) -> String {
        let lines = vec![
            "#!/bin/bash".to_string(),
            format!("#SBATCH -J {}", self.job_name),
            "#SBATCH -N 1".to_string(),
            format!("#SBATCH --partition {}", self.queue),
            format!("#SBATCH --qos {}", self.queue),
            format!("#SBATCH --output {}", self.output_file()),
            format!("#SBATCH --time {}", self.minutes),
            "module purge".to_string(),
            self.command.clone(),
        ];
        lines.join("\n")
    }

    fn output_file(&self) -> &'static str {
        CPU_OUTPUT_FILE
    }
}

/// GPU partitions on VSC3.
#[derive(Debug, Clone, PartialEq)]
pub struct Vsc3Script {
    pub job_name: String,
    pub queue: String,
    pub minutes: u64,
    pub conda_env: String,
    pub command: String,
}

impl JobTemplate for Vsc3Script {
    fn render(&self) -> String {
        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!("#SBATCH -J {}", self.job_name),
        ];
        if self.queue != VSC3_DUAL_GPU_QUEUE {
            lines.push("#SBATCH -N 1".to_string());
        }
        lines.extend([
            format!("#SBATCH --partition {}", self.queue),
            format!("#SBATCH --qos {}", self.queue),
            format!("#SBATCH --output {}", self.output_file()),
            format!("#SBATCH --time {}", self.minutes),
            "#SBATCH --gres=gpu:1".to_string(),
            String::new(),
            "module purge".to_string(),
            format!("module load {}", VSC3_CUDA_MODULE),
            format!("source {}", VSC3_CONDA_PROFILE),
            format!("conda activate {}", self.conda_env),
            "export WANDB_DIR=\"${HOME}/tmp\"".to_string(),
            self.command.clone(),
        ]);
        lines.join("\n")
    }

    fn output_file(&self) -> &'static str {
        GPU_OUTPUT_FILE
    }
}

/// The DGX GPU server. Jobs see the submitting host's `/home` under the
/// NFS mount, so the job directory and `PYTHONPATH` arrive pre-mapped.
#[derive(Debug, Clone, PartialEq)]
pub struct DgxScript {
    pub job_name: String,
    pub job_dir: PathBuf,
    pub minutes: u64,
    pub conda_env: String,
    pub python_path: Option<PathBuf>,
    pub command: String,
}

impl JobTemplate for DgxScript {
    fn render(&self) -> String {
        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!("#SBATCH -J {}", self.job_name),
            "#SBATCH -N 1".to_string(),
            format!("#SBATCH --output {}", self.output_file()),
            format!("#SBATCH --time {}", self.minutes),
            "#SBATCH --gres=gpu:1".to_string(),
            format!("#SBATCH --chdir {}", self.job_dir.display()),
            String::new(),
            "export CONDA_ENVS_PATH=\"/nfs$HOME/.conda/envs:$CONDA_ENVS_PATH\"".to_string(),
            format!("source {}", DGX_CONDA_PROFILE),
            format!("conda activate {}", self.conda_env),
        ];
        if let Some(path) = &self.python_path {
            lines.push(format!("export PYTHONPATH=\"{}\"", path.display()));
        }
        lines.extend([
            "export WANDB_API_KEY=$(grep -Po \"(?<=password ).*\" /nfs$HOME/.netrc)".to_string(),
            "export CUDA_VISIBLE_DEVICES=\"0\"".to_string(),
            "export WANDB_DIR=\"/nfs${HOME}/tmp\"".to_string(),
            "export XLA_FLAGS=--xla_gpu_force_compilation_parallelism=1".to_string(),
            self.command.clone(),
        ]);
        lines.join("\n")
    }

    fn output_file(&self) -> &'static str {
        GPU_OUTPUT_FILE
    }
}

/// A rendered job script. Written once at submission and never changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobScript {
    text: String,
}

impl JobScript {
    pub fn render(template: &dyn JobTemplate) -> Self {
        Self {
            text: template.render(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Writes the script to `dir/job.sh`.
    pub fn persist(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(JOB_SCRIPT_FILE);
        fs::write(&path, &self.text)?;
        Ok(path)
    }
}

/// Joins command tokens into one shell line, quoting only tokens that need it.
pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
