use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "health-cli")]
#[command(about = "Query the health endpoints of a running resilient-sync", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:9091")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Liveness: is the process responsive
    Live,
    /// Readiness: are all mandatory dependencies reachable
    Ready,
    /// Full component report with score
    Status,
    /// Counters and gauges
    Metrics {
        /// Print Prometheus text instead of JSON
        #[arg(long)]
        prometheus: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let path = match cli.command {
        Commands::Live => "/health/live",
        Commands::Ready => "/health/ready",
        Commands::Status => "/health",
        Commands::Metrics { prometheus: true } => {
            let res = client.get(format!("{}/metrics", base)).send().await?;
            let ok = res.status().is_success();
            print!("{}", res.text().await?);
            return Ok(ok);
        }
        Commands::Metrics { prometheus: false } => "/metrics.json",
    };

    let res = client.get(format!("{}{}", base, path)).send().await?;
    print_response(res).await
}

/// Print the JSON body. A 503 still carries a report worth showing.
async fn print_response(res: reqwest::Response) -> Result<bool, Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", text),
    }
    if !status.is_success() {
        eprintln!("Health endpoint returned status {}", status);
    }
    Ok(status.is_success())
}
