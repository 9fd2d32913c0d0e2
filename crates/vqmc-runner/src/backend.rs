use std::fmt;
use std::fs;
use std::str::FromStr;
use tracing::debug;
use vqmc_core::{Error, Result};

/// Host name of the shared GPU server where jobs run detached.
pub const GPU_SERVER_HOSTNAME: &str = "gpu1-mat";
pub const SLURM_CONFIG_PATH: &str = "/etc/slurm/slurm.conf";
/// Marker in the slurm config identifying the DGX cluster.
pub const DGX_SLURM_DOMAIN: &str = "slurm.vda.univie.ac.at";
/// Names a backend directly, overriding auto-detection.
pub const HPC_SYSTEM_ENV: &str = "HPC_SYSTEM";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Local,
    LocalBackground,
    Vsc3,
    Vsc4,
    Dgx,
}

impl Backend {
    pub const ALL: [Backend; 5] = [
        Backend::Local,
        Backend::LocalBackground,
        Backend::Vsc3,
        Backend::Vsc4,
        Backend::Dgx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Local => "local",
            Backend::LocalBackground => "local_background",
            Backend::Vsc3 => "vsc3",
            Backend::Vsc4 => "vsc4",
            Backend::Dgx => "dgx",
        }
    }

    /// Whether dispatching goes through a generated job script and `sbatch`.
    pub fn is_cluster(&self) -> bool {
        matches!(self, Backend::Vsc3 | Backend::Vsc4 | Backend::Dgx)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_lowercase();
        Backend::ALL
            .into_iter()
            .find(|b| b.as_str() == lowered)
            .ok_or_else(|| Error::UnknownBackend {
                name: s.to_string(),
            })
    }
}

/// What the caller asked for: a concrete backend or auto-detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendRequest {
    Auto,
    Named(Backend),
}

impl FromStr for BackendRequest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(BackendRequest::Auto)
        } else {
            s.parse().map(BackendRequest::Named)
        }
    }
}

/// The host signals auto-detection looks at.
pub trait EnvironmentProbe {
    fn hostname(&self) -> Option<String>;
    /// Contents of the slurm configuration file, if readable.
    fn scheduler_config(&self) -> Option<String>;
    /// Value of the backend override variable, if set.
    fn system_override(&self) -> Option<String>;
}

/// Probes the machine the process runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProbe;

impl EnvironmentProbe for HostProbe {
    fn hostname(&self) -> Option<String> {
        ["/proc/sys/kernel/hostname", "/etc/hostname"]
            .iter()
            .find_map(|p| fs::read_to_string(p).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn scheduler_config(&self) -> Option<String> {
        fs::read_to_string(SLURM_CONFIG_PATH).ok()
    }

    fn system_override(&self) -> Option<String> {
        std::env::var(HPC_SYSTEM_ENV).ok()
    }
}

/// Maps a request onto a concrete backend.
///
/// For `Auto` the checks run in a fixed order: local by default, the GPU
/// server host runs detached, a DGX slurm config selects `dgx`, and the
/// override variable beats all of them.
pub fn resolve_backend(requested: BackendRequest, probe: &dyn EnvironmentProbe) -> Result<Backend> {
    if let BackendRequest::Named(backend) = requested {
        return Ok(backend);
    }

    let mut backend = Backend::Local;
    let hostname = probe.hostname();
    debug!(hostname = ?hostname, "probing host for dispatch backend");
    if hostname.as_deref() == Some(GPU_SERVER_HOSTNAME) {
        backend = Backend::LocalBackground;
    } else if probe
        .scheduler_config()
        .is_some_and(|conf| conf.contains(DGX_SLURM_DOMAIN))
    {
        backend = Backend::Dgx;
    }
    if let Some(system) = probe.system_override() {
        debug!(system = %system, "{} overrides auto-detection", HPC_SYSTEM_ENV);
        backend = system.to_lowercase().parse()?;
    }
    Ok(backend)
}
