use clap::{Parser, Subcommand};
use utils::version;

use crate::config::controller::ControllerArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the GPU capacity provisioning controller
    Controller(Box<ControllerArgs>),
    /// Print the GpuWorkload CustomResourceDefinition as YAML
    Crd,
}
