use clap::Parser;
use courierq::JobRegistry;
use courierq::cli::{self, Cli};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    cli::run(Cli::parse(), JobRegistry::new()).await
}
