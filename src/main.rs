use clap::{Parser, Subcommand};
use log::info;
use portico::config::RoutesConfig;
use portico::error::ConfigError;
use portico::Gateway;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "portico")]
#[command(about = "Backend routing registry and origin connection policy layer for HTTP proxies")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the routing table a configuration file produces
    Routes {
        /// Path to route configuration file
        #[arg(short, long, default_value = "config/routes.toml")]
        config: PathBuf,
        /// Optional request path to resolve against the table
        #[arg(short, long)]
        path: Option<String>,
    },
    /// Generate an example route configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate a route configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Routes { config, path } => {
            show_routes(config, path)?;
        }
        Commands::Config { output } => {
            generate_config(output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

fn show_routes(
    config_path: PathBuf,
    resolve_path: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = RoutesConfig::load_from_file(&config_path)
        .map_err(|e| format!("Failed to load config from {:?}: {}", config_path, e))?;

    init_logging(&config)?;
    info!("Configuration loaded from: {:?}", config_path);

    let gateway = Gateway::from_config(config)
        .map_err(|e| format!("Failed to build routing table: {}", e))?;
    let table = gateway.registry().snapshot();

    println!("Routing table ({} routes):", table.len());
    let mut routes: Vec<_> = table.iter().collect();
    routes.sort_by_key(|(prefix, _)| prefix.len());
    for (prefix, backend) in routes.into_iter().rev() {
        println!(
            "  {} -> {} ({} origins{})",
            prefix,
            backend.app_id,
            backend.origins.len(),
            if backend.is_secure() { ", TLS" } else { "" }
        );
        for origin in backend.origins.iter() {
            println!("      {}", origin);
        }
    }

    if let Some(path) = resolve_path {
        match gateway.router().resolve(&path) {
            Ok(backend) => println!("\n{} resolves to application '{}'", path, backend.app_id),
            Err(e) => println!("\n{} does not resolve: {}", path, e),
        }
    }

    Ok(())
}

fn generate_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Generating example route configuration: {:?}", output);

    RoutesConfig::create_example_config(&output)
        .map_err(|e| format!("Failed to generate config: {}", e))?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  portico routes --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration file: {:?}", config_path);

    match RoutesConfig::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Routes: {}", config.routes.len());
            for route in &config.routes {
                println!(
                    "    {} -> {} ({} origins, sticky: {}, health check: {})",
                    route.path_prefix,
                    route.app_id,
                    route.origins.len(),
                    route.sticky_session.enabled,
                    route.health_check.is_some()
                );
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(Box::new(e));
        }
    }

    Ok(())
}

fn show_version() {
    println!("portico v{}", env!("CARGO_PKG_VERSION"));
    println!("Backend routing registry and origin connection policy layer");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Atomic routing-table updates with wait-free readers");
    println!("  • Longest-matching-prefix request routing");
    println!("  • Round-robin and sticky-session origin selection");
    println!("  • Per-origin connection pool caps");
    println!("  • Deterministic TLS protocol negotiation towards origins");
    println!("  • Active origin health checking");
}

fn init_logging(config: &RoutesConfig) -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG takes precedence over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
