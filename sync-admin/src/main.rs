use anyhow::Result;
use clap::Parser;
use medicamenta_logging::LoggerConfig;
use sync_admin::{run, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Quiet by default so command output stays parseable
    let logging = LoggerConfig {
        level: "warn".to_string(),
        ..LoggerConfig::default()
    }
    .verbose(cli.verbose);
    if let Err(err) = medicamenta_logging::init(&logging) {
        eprintln!("Logging disabled: {err}");
    }

    let output = run(&cli).await?;
    print!("{output}");
    Ok(())
}
