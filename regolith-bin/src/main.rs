use clap::Parser;
use regolith_bin::run;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Proxy configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Permission policy file, overriding `permissions` in the config
    #[arg(short, long)]
    permissions: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    run(&args.config, args.permissions.as_deref()).await
}
