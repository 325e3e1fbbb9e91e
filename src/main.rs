use anyhow::Result;
use clap::Parser;
use meshbus::cli::{self, Cli, Command};
use meshbus::core::runtime::Runtime;
use meshbus::core::time::SystemClock;
use meshbus::queue::memory::MemoryQueueDriver;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let config = args.load_config()?;
    cli::init_tracing(&config.telemetry.log_filter);

    match args.command.unwrap_or(Command::Start) {
        Command::CheckConfig => {
            config.validate()?;
            println!("configuration ok");
            Ok(())
        }
        Command::Start => {
            let runtime = Runtime::new(config, SystemClock, Arc::new(MemoryQueueDriver::new()));
            runtime.run_until_signal().await
        }
    }
}
