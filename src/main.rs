use anyhow::Context;
use llmrunner::cli::output::{style, CROSS};
use llmrunner::cli::Cli;
use llmrunner::core::context::EnvSnapshot;
use llmrunner::execution::{PipelineRunner, RunOptions, ShellRunner};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    let root_dir = std::env::current_dir().context("Failed to resolve working directory")?;
    let runner = PipelineRunner::new(root_dir, EnvSnapshot::from_process_env(), ShellRunner);
    let opts = RunOptions {
        config_path: cli.config,
        prepare_only: cli.prepare_only,
    };

    if let Err(err) = runner.run(&opts).await {
        eprintln!("{}{}", CROSS, style(&err).red());
        std::process::exit(err.exit_code());
    }
    Ok(())
}
