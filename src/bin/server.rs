//! Metrics collector entry point.

use clap::Parser;
use monitor_lib::cli::{self, ServerCli};
use monitor_lib::core::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ServerCli::parse();
    cli::execute_server(cli).await
}
