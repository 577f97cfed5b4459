mod config;
mod error;
mod pipeline;
mod protocol;
mod search;
mod server;
mod sse;
mod toolcall;
mod tools;

use clap::{Parser, Subcommand};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use config::ApiConfig;
use error::Result;
use pipeline::{Pipeline, PipelineRequest};
use protocol::RelayEvent;
use search::BraveSearch;

#[derive(Parser)]
#[command(name = "zera", about = "Web search planned and answered by a language model")]
struct Cli {
    /// OpenRouter API key.
    #[arg(long, env = "OR_KEY", hide_env_values = true)]
    api_key: String,

    /// Model identifier sent with every request.
    #[arg(long, env = "ZERA_MODEL", default_value = config::DEFAULT_MODEL)]
    model: String,

    /// Chat-completions endpoint.
    #[arg(long, env = "ZERA_BASE_URL", default_value = config::DEFAULT_BASE_URL)]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server.
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        listen: String,
    },
    /// Ask questions interactively on stdin/stdout.
    Ask,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("zera=info")),
        )
        .init();

    let cli = Cli::parse();
    let api_config = ApiConfig::new(cli.api_key)
        .with_model(cli.model)
        .with_base_url(cli.base_url);

    let client = reqwest::Client::new();
    let search = Arc::new(BraveSearch::new(client.clone()));
    let pipeline = Pipeline::new(client, api_config.clone(), search);

    match cli.command {
        Command::Serve { listen } => server::run(server::ServerConfig { listen }, pipeline).await,
        Command::Ask => ask(api_config, pipeline).await,
    }
}

async fn ask(config: ApiConfig, pipeline: Pipeline) -> Result<()> {
    println!("\n=== Welcome to the AI Assistant ===");
    println!("\nbaseURL: {}", config.base_url);
    println!("model: {}", config.model);
    println!("\nType your questions and press Enter. Type 'exit' to quit.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\nAsk anything: ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if query.eq_ignore_ascii_case("exit") {
            println!("\nGoodbye!\n");
            break;
        }

        println!("\nAI Response:\n");
        let request = PipelineRequest::new(query);
        let mut run = std::pin::pin!(pipeline.run(&request, print_event));
        let result = tokio::select! {
            result = &mut run => result,
            _ = tokio::signal::ctrl_c() => {
                request.cancel.cancel();
                run.await
            }
        };

        match result {
            Ok(_) => println!("\n\n{}\n", "─".repeat(80)),
            Err(err) if err.is_cancelled() => println!("\nRequest cancelled."),
            Err(err) => eprintln!("\nError: {err}"),
        }
    }

    Ok(())
}

fn print_event(event: RelayEvent) -> std::future::Ready<()> {
    match event {
        RelayEvent::Content { content } => {
            print!("{content}");
            let _ = std::io::stdout().flush();
        }
        RelayEvent::SearchResults { results } => {
            println!("\nSearching the web for more information...\n");
            for result in &results {
                println!("  {} <{}>", result.title, result.url);
            }
            println!();
        }
        RelayEvent::RelatedSearches { .. } => {}
    }
    std::future::ready(())
}
