use anyhow::bail;
use clap::Parser;
use log::info;
use mirrorgate::config::{Config, SslConfig};
use mirrorgate::logging;
use mirrorgate::proxy::MirrorServer;
use std::path::Path;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "A mirroring reverse proxy that serves a remote site behind a controlled host"
)]
struct Args {
    #[clap(short, long, value_name = "URL", help = "Upstream origin to mirror (e.g., https://example.com)")]
    target: Option<String>,

    #[clap(long, value_name = "HOST", help = "Externally visible proxy hostname used in rewritten links")]
    host: Option<String>,

    #[clap(short, long, value_name = "PORT", help = "Externally visible proxy port, also the listen port")]
    port: Option<u16>,

    #[clap(long, value_name = "FILE", help = "Private key file for the proxy's own TLS listener")]
    ssl_key: Option<String>,

    #[clap(long, value_name = "FILE", help = "Certificate file for the proxy's own TLS listener")]
    ssl_cert: Option<String>,

    #[clap(long, value_name = "UA", help = "Override the outbound User-Agent toward the upstream")]
    user_agent: Option<String>,

    #[clap(long, value_name = "HOST", help = "Override the Host header sent upstream")]
    host_header: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Upstream request timeout in seconds")]
    upstream_timeout: Option<u64>,

    #[clap(short, long, value_name = "FILE", help = "JSON configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level (trace, debug, info, warn, error)")]
    log_level: Option<String>,

    #[clap(long, help = "Emit JSON-formatted logs")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logging::init(args.log_level.as_deref().unwrap_or("info"), args.log_json);

    let config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            bail!("Configuration file not found: {}", config_file);
        }
        Config::from_file(config_file)?
    } else {
        create_config_from_args(&args)?
    };

    info!("Starting mirror proxy...");
    let server = MirrorServer::init(config, Vec::new(), None, None)?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.listen().await {
            eprintln!("Server error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        result = server_handle => {
            if let Err(e) = result {
                eprintln!("Server task error: {}", e);
            }
        }
    }

    Ok(())
}

fn create_config_from_args(args: &Args) -> anyhow::Result<Config> {
    let Some(target) = args.target.clone() else {
        bail!("Either --target or --config is required");
    };

    let ssl = match (&args.ssl_key, &args.ssl_cert) {
        (Some(key), Some(cert)) => Some(SslConfig {
            key: key.clone(),
            cert: cert.clone(),
        }),
        (None, None) => None,
        _ => bail!("--ssl-key and --ssl-cert must be given together"),
    };

    let defaults = Config::default();
    Ok(Config {
        target,
        host: args.host.clone().unwrap_or(defaults.host),
        port: args.port.unwrap_or(defaults.port),
        ssl,
        user_agent_header: args.user_agent.clone(),
        host_header: args.host_header.clone(),
        upstream_timeout_secs: args.upstream_timeout.or(defaults.upstream_timeout_secs),
    })
}
