//! Command-line interface for minesploit.
//!
//! Queries a running pool or relay through its HTTP API.

use std::env;

use anyhow::Result;

use minesploit::api_client;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: minesploit-cli <command> [args]");
        eprintln!();
        eprintln!("Commands:");
        eprintln!("  stats           Show connection and share counters");
        eprintln!("  api <endpoint>  Raw API call (e.g. \"api health\")");
        eprintln!();
        eprintln!("Environment:");
        eprintln!("  MINESPLOIT_API_URL    API base URL (default: http://127.0.0.1:7783)");
        std::process::exit(1);
    }

    let command = &args[1];

    match command.as_str() {
        "stats" => cmd_stats().await?,
        "api" => {
            let endpoint = args.get(2).map_or("", String::as_str);
            cmd_api(endpoint).await?;
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            eprintln!("Run without arguments to see usage.");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Build an API client, honoring MINESPLOIT_API_URL if set.
fn make_client() -> api_client::Client {
    match env::var("MINESPLOIT_API_URL") {
        Ok(url) => api_client::Client::with_base_url(url),
        Err(_) => api_client::Client::new(),
    }
}

/// Make a raw API call and pretty-print the JSON response.
async fn cmd_api(endpoint: &str) -> Result<()> {
    let client = make_client();
    let body = client.get_raw(endpoint).await?;

    // Pretty-print JSON; anything else as is
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", body),
    }

    Ok(())
}

/// Print the current counters.
async fn cmd_stats() -> Result<()> {
    let client = make_client();
    let stats = client.get_stats().await?;

    println!("Connections:    {}", stats.active_connections);
    println!("Subscribed:     {}", stats.subscriptions);
    println!("Authorized:     {}", stats.authorizations);
    println!("Shares:         {}", stats.shares_submitted);
    println!("Shares stolen:  {}", stats.shares_stolen);
    println!("Undecodable:    {}", stats.undecodable_frames);

    Ok(())
}
