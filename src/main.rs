use std::{net::SocketAddr, path::Path, sync::Arc};

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    middleware,
    response::Response,
    routing::any,
    Router,
};
use clap::Parser;
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use portico::{
    adapters::{
        correlation_middleware, request_timing_middleware, FileConfigProvider, HealthMonitor,
        HttpClientAdapter, ProxyHandler,
    },
    config::{models::GatewayConfig, GatewayConfigValidator},
    core::{AdmissionController, HealthRegistry, LoadBalancer, RouteTable},
    metrics,
    ports::{config_provider::ConfigProvider, http_client::HttpClient},
    tracing_setup,
    utils::GracefulShutdown,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::CompressionLayer;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "gateway.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "gateway.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "gateway.toml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "gateway.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    match command {
        "validate" => return validate_config_command(&config_path).await,
        "init" => return init_config_command(&config_path).await,
        "serve" => {}
        _ => unreachable!(),
    }

    tracing_setup::init_tracing().map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    tracing::info!("Loading initial configuration from {config_path}");

    let config_provider: Arc<dyn ConfigProvider> = Arc::new(
        FileConfigProvider::new(&config_path).context("Failed to create config provider")?,
    );

    let initial_config: GatewayConfig = config_provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;

    GatewayConfigValidator::validate(&initial_config)
        .map_err(|e| eyre!("Invalid configuration: {e}"))?;

    let config_holder = Arc::new(ArcSwap::from_pointee(initial_config));
    let config = config_holder.load_full();

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);

    let registry = Arc::new(HealthRegistry::new(
        config.gateway.circuit_breaker.clone(),
        config.gateway.enable_circuit_breaker,
    ));
    let load_balancer = Arc::new(LoadBalancer::new(registry.clone()));
    let health_monitor = Arc::new(HealthMonitor::new(
        registry,
        http_client.clone(),
        config.monitor.clone(),
    ));
    let admission = Arc::new(
        AdmissionController::new(&config.gateway.rate_limit)
            .map_err(|e| eyre!("Invalid rate limit options: {e}"))?,
    );

    let routes = config
        .build_routes()
        .map_err(|e| eyre!("Invalid route configuration: {e}"))?;
    let route_table = Arc::new(
        RouteTable::new(config_provider.clone(), routes)
            .map_err(|e| eyre!("Failed to build route table: {e}"))?,
    );

    for route in route_table.get_all() {
        tracing::info!(
            route_id = route.route_id(),
            prefix = route.route_prefix(),
            destinations = route.destinations().len(),
            priority = route.priority(),
            "Configured route"
        );
    }

    let graceful_shutdown = Arc::new(GracefulShutdown::new());

    // Signal handler
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    // Health monitor loop
    {
        let monitor = health_monitor.clone();
        let table = route_table.clone();
        let token = graceful_shutdown.token();
        tokio::spawn(async move {
            monitor.run(table, token).await;
        });
    }

    // Config watcher: the file provider coalesces filesystem event bursts,
    // so each received signal means "validate and apply once".
    {
        let config_holder = config_holder.clone();
        let route_table = route_table.clone();
        let config_provider = config_provider.clone();
        let config_path = config_path.clone();
        let mut notify_rx = config_provider.watch();

        tokio::spawn(async move {
            tracing::info!("Config watcher task started.");
            while notify_rx.recv().await.is_some() {
                tracing::info!("Attempting to reload configuration from {}", config_path);

                match config_provider.load_config().await {
                    Ok(new_config) => {
                        if let Err(e) = GatewayConfigValidator::validate(&new_config) {
                            tracing::error!(
                                "Reloaded configuration is invalid: {}. Keeping old configuration.",
                                e
                            );
                            continue;
                        }
                        match route_table.reload().await {
                            Ok(count) => {
                                config_holder.store(Arc::new(new_config));
                                tracing::info!(routes = count, "Configuration reloaded.");
                            }
                            Err(e) => {
                                tracing::error!(
                                    "Route table reload failed: {}. Keeping old table.",
                                    e
                                );
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            "Failed to reload configuration: {}. Keeping old configuration.",
                            e
                        );
                    }
                }
            }
            tracing::info!("Config watcher task is shutting down.");
        });
    }

    let proxy_handler = Arc::new(ProxyHandler::new(
        route_table,
        load_balancer,
        health_monitor,
        admission,
        http_client,
        config_holder.clone(),
    ));

    let make_request_route = |handler: Arc<ProxyHandler>| {
        any(
            move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
                let handler = handler.clone();
                async move {
                    match handler.handle_request(req, Some(client_addr)).await {
                        Ok(response) => Ok::<Response<Body>, std::convert::Infallible>(response),
                        Err(e) => {
                            tracing::error!("Request handling error: {:?}", e);
                            let error_response = Response::builder()
                                .status(500)
                                .body(Body::from("Internal Server Error"))
                                .unwrap_or_else(|_| {
                                    Response::new(Body::from("Internal Server Error"))
                                });
                            Ok(error_response)
                        }
                    }
                }
            },
        )
    };

    let app = Router::new()
        .route("/{*path}", make_request_route(proxy_handler.clone()))
        .route("/", make_request_route(proxy_handler.clone()))
        .layer(middleware::from_fn(correlation_middleware))
        .layer(middleware::from_fn(request_timing_middleware))
        .layer(CompressionLayer::new())
        .layer(ConcurrencyLimitLayer::new(
            config.gateway.max_concurrent_requests,
        ));

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!("Portico gateway starting on {}", addr);
    println!(
        "Portico gateway listening on {} ({} routes, rate limiting: {}, monitor: {})",
        addr,
        config.routes.len(),
        config.gateway.enable_rate_limiting,
        config.monitor.enabled,
    );

    let server_result = tokio::select! {
        result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        ) => {
            result.context("Server error")
        },
        shutdown_reason = graceful_shutdown.wait_for_shutdown_signal() => {
            tracing::info!("Shutdown signal received: {:?}", shutdown_reason);
            Ok(())
        }
    };

    server_result?;

    tracing_setup::shutdown_tracing();

    Ok(())
}

/// Validate configuration file and exit.
async fn validate_config_command(config_path: &str) -> Result<()> {
    use portico::config::loader::load_config;

    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path) {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration validation: OK");
            println!();
            println!("Configuration summary:");
            println!("   Listen address: {}", config.listen_addr);
            println!("   Routes: {}", config.routes.len());
            println!(
                "   Rate limiting: {} ({} permits / {}s)",
                config.gateway.enable_rate_limiting,
                config.gateway.rate_limit.permits,
                config.gateway.rate_limit.window_seconds
            );
            println!("   Health monitor: {}", config.monitor.enabled);
            println!();
            println!("Configuration is valid and ready to use.");
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("Common fixes:");
            println!("   - Ensure destinations start with http:// or https://");
            println!("   - Ensure route prefixes start with '/'");
            println!("   - Verify listen address format (e.g., '127.0.0.1:8080')");
            println!("   - Keep timeout_seconds within 1..=300");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file.
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("Error: configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Portico gateway configuration

# The address to listen on
listen_addr = "127.0.0.1:8080"

[gateway]
enable_rate_limiting = true
enable_circuit_breaker = true
enable_load_balancing = true
enable_authentication_forwarding = true
default_timeout_seconds = 30
max_concurrent_requests = 100

[gateway.rate_limit]
permits = 100
window_seconds = 60
queue_length = 10

[monitor]
enabled = true
interval_secs = 10
probe_timeout_secs = 5

# Example route: load-balanced proxy to two upstreams
[[routes]]
route_id = "api"
route_prefix = "/api"
destinations = ["http://localhost:3001", "http://localhost:3002"]
priority = 0

[routes.policy]
load_balancing = "round_robin"
timeout_seconds = 30
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("Created default configuration at: {config_path}");
    println!("   Run 'portico serve --config {config_path}' to start the gateway");
    Ok(())
}
