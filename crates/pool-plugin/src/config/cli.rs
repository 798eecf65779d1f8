use clap::Parser;
use clap::Subcommand;

use crate::config::run::RunArgs;
use crate::config::run::SampleCapacityArgs;

#[derive(Parser)]
#[command(about, long_about, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device plugin and register it with the kubelet
    Run(Box<RunArgs>),
    /// Print one sampled pool capacity in bytes
    #[command(name = "sample-capacity")]
    SampleCapacity(SampleCapacityArgs),
}
