//! Shared pieces of the VQMC dispatch layer: errors, duration parsing,
//! configuration and the experiment directory layout.

pub mod config;
pub mod duration;
pub mod error;
pub mod naming;
pub mod rundir;

pub use config::{dump_config, Configuration, DispatchConfig, CONFIG_FILE, FULL_CONFIG_FILE};
pub use duration::parse_duration;
pub use error::{Error, Result};
pub use naming::{build_experiment_name, shorten_parameter_name};
pub use rundir::{
    contains_run, create_experiment_directory, create_job_directory, find_runs, is_checkpoint,
    job_index_name, RESULTS_FILE,
};
