#[cfg(feature = "cli")]
use mcp_gateway::{config::Config, run_server};

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    run_server(cfg).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
