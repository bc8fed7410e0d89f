use clap::Parser;
use reposentry::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    color_eyre::install().ok();
    let cli = Cli::parse();
    cli::run(cli).await
}
