use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "proxy-cli")]
#[command(about = "Management CLI for lb-proxy", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long)]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check proxy status
    Status,
    /// List backend groups, target availability and pool statistics
    Targets,
    /// Add a target to a backend group
    Add {
        group: String,
        uri: String,
        /// Route id used in sticky session ids
        #[arg(long)]
        route: Option<String>,
        #[arg(long)]
        domain: Option<String>,
    },
    /// Remove a target and close its connections
    Remove { group: String, uri: String },
    /// Stop sending new (non-sticky) traffic to a target
    Drain { group: String, uri: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );
    let client = reqwest::Client::builder().default_headers(headers).build()?;
    let targets = format!("{}/admin/targets", cli.url);

    let res = match cli.command {
        Commands::Status => client.get(format!("{}/admin/status", cli.url)).send().await?,
        Commands::Targets => client.get(&targets).send().await?,
        Commands::Add {
            group,
            uri,
            route,
            domain,
        } => {
            client
                .post(&targets)
                .json(&json!({ "group": group, "uri": uri, "route": route, "domain": domain }))
                .send()
                .await?
        }
        Commands::Remove { group, uri } => {
            client
                .delete(&targets)
                .query(&[("group", group), ("uri", uri)])
                .send()
                .await?
        }
        Commands::Drain { group, uri } => {
            client
                .post(format!("{targets}/drain"))
                .json(&json!({ "group": group, "uri": uri }))
                .send()
                .await?
        }
    };

    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }
    if status == reqwest::StatusCode::NO_CONTENT {
        println!("OK");
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
