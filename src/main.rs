//! Zentinel SOAP Gateway binary.
//!
//! Run with: `zentinel-soap-gateway --config gateway.yaml < request.xml`
//!
//! Handles one request per process, CGI style: the SOAP request is read
//! from stdin and the response written to stdout. `--wsdl` prints the
//! service description instead.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_soap_gateway::demo::DEMO_SERVICE;
use zentinel_soap_gateway::dispatcher::BufferedResponse;
use zentinel_soap_gateway::{
    BufferedHost, DemoService, MemoryWsdlCache, RunOutcome, ServiceConfig, SoapDispatcher,
};

const DEFAULT_SERVICE_URL: &str = "http://localhost/soap";

/// SOAP gateway for Zentinel.
///
/// Publishes the WSDL of the built-in demo service and dispatches SOAP
/// requests to it.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, default_value = "gateway.yaml")]
    config: PathBuf,

    /// Print the WSDL document instead of handling a request
    #[arg(long)]
    wsdl: bool,

    /// Prefix the response with CGI `Status` and `Content-Type` headers
    #[arg(long)]
    cgi_headers: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr, stdout carries the response
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting Zentinel SOAP Gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config).await?;
    info!(
        provider = config.provider.as_deref().unwrap_or_default(),
        service_url = config.service_url.as_deref().unwrap_or_default(),
        binding_style = config.binding_style().as_str(),
        wsdl_cache_duration = config.wsdl_cache_duration,
        debug = config.debug,
        "Configuration loaded"
    );

    let mut dispatcher = SoapDispatcher::new(config, DemoService::catalog())
        .with_cache("cache", Arc::new(MemoryWsdlCache::new()));

    if args.wsdl {
        let mut response = BufferedResponse::default();
        dispatcher
            .render_wsdl(&mut response)
            .context("Failed to generate WSDL")?;
        write_response(&response, args.cgi_headers).await?;
        return Ok(());
    }

    let mut body = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut body)
        .await
        .context("Failed to read request from stdin")?;

    let mut host = BufferedHost::new();
    let outcome = dispatcher
        .run(&body, &mut host)
        .context("Failed to configure SOAP dispatch")?;

    match &outcome {
        RunOutcome::Completed => info!("Request handled"),
        RunOutcome::Aborted => info!("Request declined by provider"),
        RunOutcome::Faulted(fault) => warn!(code = %fault.code, "Request ended with a fault"),
    }

    write_response(&host.response, args.cgi_headers).await?;

    if let Some(status) = host.exit_status() {
        std::process::exit(status);
    }
    Ok(())
}

async fn load_config(path: &Path) -> Result<ServiceConfig> {
    let mut config = if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        ServiceConfig::from_yaml(&content).context("Failed to parse config file")?
    } else {
        info!("Config file {} not found, using defaults", path.display());
        ServiceConfig::default()
    };

    if config.provider.is_none() {
        config.provider = Some(DEMO_SERVICE.to_string());
    }
    if config.service_url.is_none() {
        config.service_url = Some(DEFAULT_SERVICE_URL.to_string());
    }
    if config.wsdl_url.is_none() {
        config.wsdl_url = config.service_url.as_ref().map(|url| format!("{}?wsdl", url));
    }
    Ok(config)
}

async fn write_response(response: &BufferedResponse, cgi_headers: bool) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    if cgi_headers {
        let mut headers = format!("Status: {}\r\n", response.status.unwrap_or(200));
        if let Some(content_type) = response.content_type_header() {
            headers.push_str(&format!("Content-Type: {}\r\n", content_type));
        }
        headers.push_str("\r\n");
        stdout.write_all(headers.as_bytes()).await?;
    }
    stdout
        .write_all(&response.body)
        .await
        .context("Failed to write response")?;
    stdout.flush().await?;
    Ok(())
}
