//! Backend selection, job-script rendering and submission for VQMC runs.

pub mod backend;
pub mod dispatch;
pub mod pathmap;
pub mod template;

pub use backend::{resolve_backend, Backend, BackendRequest, EnvironmentProbe, HostProbe};
pub use dispatch::{dispatch, handler_for, render_job_script, DispatchHandler, Dispatcher, RunRequest};
pub use pathmap::{map_shared_path, rewrite_shared_paths, NFS_PREFIX};
pub use template::{
    shell_join, DgxScript, JobScript, JobTemplate, Vsc3Script, Vsc4Script, CPU_OUTPUT_FILE,
    GPU_OUTPUT_FILE, JOB_SCRIPT_FILE,
};
