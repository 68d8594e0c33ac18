mod args;
mod config;

pub use args::Args;
pub use config::{
    AppCmd, AppSpec, ClosSpec, CmdOptions, Config, PerfMode, PolicySpec, TaskCommon, TaskSpec,
    VmSpec,
};
