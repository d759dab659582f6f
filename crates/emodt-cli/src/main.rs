use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = emodt_cli::Cli::parse();
    emodt_cli::run_cli(cli)
}
