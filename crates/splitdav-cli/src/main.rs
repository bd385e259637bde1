#![deny(unsafe_code)]

// Use mimalloc for reduced allocation latency (enabled by default).
#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod exit_code;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use splitdav::{ConfigError, DavProxy, ProxyConfig, ProxyServer, ServerConfig};

/// WebDAV proxy that splits large uploads into backend-sized chunks
#[derive(Parser)]
#[command(name = "splitdav")]
#[command(author, version)]
#[command(after_help = "EXAMPLES:
    # Proxy a Nextcloud instance, splitting files of 4 GiB and more
    BACKEND_URL=https://cloud.example.com/remote.php/dav/files/me \\
    BACKEND_USERNAME=me BACKEND_PASSWORD=secret splitdav

    # Smaller threshold, 1 GiB parts, mounted under /dav
    splitdav --backend-url http://nas:8080/webdav --file-max-size 2147483648 \\
        --chunk-size 1073741824 --mount-path /dav
")]
struct Args {
    #[command(flatten)]
    proxy: ProxyConfig,

    /// Verbosity level (-v, -vv, -vvv); overrides LOG_LEVEL
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log level when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also write logs to LOG_FILE
    #[arg(long, env = "ENABLE_FILE_LOGGING", default_value_t = false)]
    enable_file_logging: bool,

    /// Log file used when file logging is enabled
    #[arg(long, env = "LOG_FILE", default_value = "splitdav.log")]
    log_file: PathBuf,
}

/// Keeps the non-blocking file writer alive for the whole process.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(categorize_error(&e))
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    setup_tracing(&args)?;

    args.proxy.validate()?;
    let server_config = ServerConfig::from_proxy_config(&args.proxy)?;
    let proxy = Arc::new(DavProxy::new(&args.proxy)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    runtime.block_on(async move {
        let server = ProxyServer::start(Arc::clone(&proxy), server_config)
            .await
            .with_context(|| format!("Failed to bind {}:{}", args.proxy.host, args.proxy.port))?;
        tracing::info!(
            url = %server.url(),
            mount = %args.proxy.mount_path,
            backend = %args.proxy.backend_url,
            threshold = args.proxy.file_max_size,
            chunk_size = args.proxy.chunk_size(),
            "Proxy ready"
        );

        wait_for_shutdown().await?;
        server.stop().await;

        let snapshot = proxy.stats().snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(json) => tracing::info!(stats = %json, "Final statistics"),
            Err(e) => tracing::warn!("Could not serialize statistics: {e}"),
        }
        Ok(())
    })
}

/// Resolves on Ctrl-C, or on SIGTERM where available.
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down");
    Ok(())
}

/// Set up tracing: stderr always, plus a file when requested.
///
/// `RUST_LOG` wins over `-v`, which wins over `LOG_LEVEL`.
fn setup_tracing(args: &Args) -> Result<()> {
    let level = match args.verbose {
        0 => args.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_filter(filter());

    let file_layer = if args.enable_file_logging {
        let directory = args
            .log_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), PathBuf::from);
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;
        let file_name = args
            .log_file
            .file_name()
            .context("LOG_FILE has no file name")?;
        let appender = tracing_appender::rolling::never(&directory, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = LOG_GUARD.set(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter()),
        )
    } else {
        None
    };

    #[cfg(feature = "tokio-console")]
    {
        let console_layer = console_subscriber::spawn();
        tracing_subscriber::registry()
            .with(console_layer)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    }

    #[cfg(not(feature = "tokio-console"))]
    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(())
}

/// Maps an error chain onto an exit code.
fn categorize_error(e: &anyhow::Error) -> u8 {
    if e.chain().any(|cause| cause.downcast_ref::<ConfigError>().is_some()) {
        exit_code::USAGE_ERROR
    } else {
        exit_code::GENERAL_ERROR
    }
}
