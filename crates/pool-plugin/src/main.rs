use anyhow::Result;
use clap::Parser;
use pool_plugin::app::ApplicationBuilder;
use pool_plugin::config::validate_capacity;
use pool_plugin::config::Cli;
use pool_plugin::config::Commands;
use pool_plugin::config::RunArgs;
use pool_plugin::config::SampleCapacityArgs;
use pool_plugin::core::RandomCapacitySampler;
use utils::logging::LogFormat;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(run_args) => run_plugin(*run_args).await,
        Commands::SampleCapacity(sample_args) => sample_capacity(&sample_args),
    }
}

async fn run_plugin(run_args: RunArgs) -> Result<()> {
    utils::logging::init(run_args.log_format);

    tracing::info!(
        "Starting pool device plugin {}",
        env!("CARGO_PKG_VERSION")
    );

    let app = ApplicationBuilder::new(run_args).build()?;

    let result = app.run().await;
    app.shutdown().await?;

    result
}

/// Prints one sampled pool capacity in bytes, and the unit count when asked.
fn sample_capacity(sample_args: &SampleCapacityArgs) -> Result<()> {
    utils::logging::init(LogFormat::Text);

    validate_capacity(&sample_args.capacity, u64::MAX)?;
    let sampler = RandomCapacitySampler::new(
        sample_args.capacity.range(),
        sample_args.capacity.unit_size_bytes,
    );

    let bytes = sampler.sample_bytes();
    println!("{bytes}");
    if sample_args.units {
        println!("{}", sampler.units_for(bytes));
    }
    Ok(())
}
