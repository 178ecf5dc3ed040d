//! Metrics agent entry point.

use clap::Parser;
use monitor_lib::cli::{self, AgentCli};
use monitor_lib::core::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = AgentCli::parse();
    cli::execute_agent(cli).await
}
