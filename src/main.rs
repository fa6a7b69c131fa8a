use clap::Parser;
use llm_gateway::{build_router, config_search_paths, AppState, Gateway, GatewayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "llm-gateway",
    about = "LLM gateway: OpenAI, Anthropic or unified requests, routed through gates to any provider",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,

    /// Print the model catalog and exit
    #[arg(long)]
    list_models: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;

    if cli.list_models {
        for model in config.catalog().models() {
            println!(
                "{:<12} {:<32} in ${:>7.3}/M  out ${:>7.3}/M",
                model.provider.as_str(),
                model.id,
                model.input_per_million,
                model.output_per_million
            );
        }
        return Ok(());
    }

    if let Some(port) = cli.port {
        config.port = port;
    }

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()?;

    let (gateway, _ledger) = Gateway::from_config(&config, client)?;

    info!("llm-gateway v{}", env!("CARGO_PKG_VERSION"));
    for (kind, url) in config.base_urls() {
        info!("  {:<10} {}", kind.as_str(), url);
    }
    info!("  Gates:     {}", config.gates.len());
    info!("  Models:    {}", gateway.catalog().models().len());
    info!(
        "  Cache:     {}",
        if config.cache.enabled {
            format!("{}s TTL, {} entries", config.cache.ttl_secs, config.cache.max_entries)
        } else {
            "disabled".to_string()
        }
    );
    if let Some(path) = &config.usage.log_file {
        info!("  Usage log: {}", path.display());
    }

    let state = Arc::new(AppState {
        gateway,
        default_owner: config.default_owner.clone(),
    });

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
