use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use publishd::protocol::LdataFields;
use publishd::publish::Compression;
use publishd::{ExitReason, PublishClient, PutOptions, PutOutcome, Server, ServerConfig};

#[derive(Parser)]
#[command(name = "publishd")]
#[command(version)]
#[command(about = "Publish server - atomically writes client files into a data tree")]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve(ServeArgs),

    /// Publish a local file
    Put {
        file: PathBuf,
        /// Data URL, e.g. mdvp:://host::dir
        url: String,
        /// Server address
        #[arg(long, default_value = "127.0.0.1:5440")]
        server: String,
        /// Name relative to the URL directory (default: the URL's last component)
        #[arg(long)]
        name: Option<String>,
        /// Seconds an existing file must have aged before it is replaced; -1 never
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        overwrite_age: i32,
        /// Skip the enquiry and overwrite unconditionally
        #[arg(long)]
        force: bool,
        #[arg(long, value_enum, default_value_t = CompressArg::None)]
        compress: CompressArg,
        #[arg(long)]
        writer: Option<String>,
        #[arg(long)]
        data_type: Option<String>,
        #[arg(long)]
        user_info1: Option<String>,
        #[arg(long)]
        user_info2: Option<String>,
    },

    /// Check that a server is alive
    Ping {
        addr: String,
        #[arg(long)]
        json: bool,
    },

    /// Show how many clients a server is handling
    Clients {
        addr: String,
        #[arg(long)]
        json: bool,
    },

    /// Ask a server to stop
    Shutdown { addr: String },
}

#[derive(clap::Args)]
struct ServeArgs {
    /// TOML config file
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[arg(long)]
    bind: Option<String>,
    #[arg(long, short)]
    port: Option<u16>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    instance: Option<String>,
    /// Negative: no limit
    #[arg(long, allow_hyphen_values = true)]
    max_clients: Option<i64>,
    /// Exit after this many idle seconds; negative: never
    #[arg(long, allow_hyphen_values = true)]
    max_quiescent_secs: Option<i64>,
    #[arg(long)]
    tmp_dir: Option<PathBuf>,
    /// Handle connections inline in the listener
    #[arg(long)]
    no_threads: bool,
    /// Exit when a connection handler fails
    #[arg(long)]
    strict: bool,
    /// Reject absolute and '..' URL paths
    #[arg(long)]
    secure: bool,
    #[arg(long)]
    read_only: bool,
    #[arg(long)]
    writer: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum CompressArg {
    None,
    Zstd,
    Lz4,
}

impl From<CompressArg> for Compression {
    fn from(arg: CompressArg) -> Self {
        match arg {
            CompressArg::None => Compression::None,
            CompressArg::Zstd => Compression::Zstd,
            CompressArg::Lz4 => Compression::Lz4,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Put {
            file,
            url,
            server,
            name,
            overwrite_age,
            force,
            compress,
            writer,
            data_type,
            user_info1,
            user_info2,
        } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let mod_time = std::fs::metadata(&file)
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let opts = PutOptions {
                mod_time,
                overwrite_age,
                compression: compress.into(),
                ldata: LdataFields {
                    writer,
                    data_type,
                    user_info1,
                    user_info2,
                },
                ..Default::default()
            };

            let client = PublishClient::new(server);
            if force {
                client
                    .put_forced(&url, name.as_deref(), &data, &opts)
                    .await
                    .with_context(|| format!("Failed to publish {}", file.display()))?;
                println!("Published {} to {}", file.display(), url);
            } else {
                match client
                    .enquire_and_put(&url, name.as_deref(), &data, &opts)
                    .await
                    .with_context(|| format!("Failed to publish {}", file.display()))?
                {
                    PutOutcome::Published => println!("Published {} to {url}", file.display()),
                    PutOutcome::Skipped => {
                        println!("Skipped {}: server copy is recent", file.display())
                    }
                }
            }
            Ok(())
        }
        Commands::Ping { addr, json } => {
            let reply = PublishClient::new(&addr)
                .with_timeout(Some(Duration::from_secs(5)))
                .is_alive()
                .await
                .with_context(|| format!("No answer from {addr}"))?;
            let name = reply.server_name.unwrap_or_default();
            let pid = reply.pid.unwrap_or_default();
            if json {
                let out = serde_json::json!({
                    "addr": addr,
                    "alive": true,
                    "server_name": name,
                    "pid": pid,
                });
                println!("{out}");
            } else {
                println!("{addr}: {name} alive, pid {pid}");
            }
            Ok(())
        }
        Commands::Clients { addr, json } => {
            let count = PublishClient::new(&addr)
                .with_timeout(Some(Duration::from_secs(5)))
                .client_count()
                .await
                .with_context(|| format!("No answer from {addr}"))?;
            if json {
                let out = serde_json::json!({ "addr": addr, "num_clients": count });
                println!("{out}");
            } else {
                println!("{addr}: {count} client(s)");
            }
            Ok(())
        }
        Commands::Shutdown { addr } => {
            PublishClient::new(&addr)
                .with_timeout(Some(Duration::from_secs(5)))
                .shutdown()
                .await
                .with_context(|| format!("Failed to shut down {addr}"))?;
            println!("{addr}: shutdown requested");
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = publishd::config::expand_tilde(&dir);
    }
    if let Some(instance) = args.instance {
        config.instance = Some(instance);
    }
    if let Some(max) = args.max_clients {
        config.max_clients = max;
    }
    if let Some(secs) = args.max_quiescent_secs {
        config.max_quiescent_secs = secs;
    }
    if let Some(dir) = args.tmp_dir {
        config.tmp_dir = Some(publishd::config::expand_tilde(&dir));
    }
    if let Some(writer) = args.writer {
        config.writer = Some(writer);
    }
    config.no_threads |= args.no_threads;
    config.strict |= args.strict;
    config.secure |= args.secure;
    config.read_only |= args.read_only;

    let bind_addr = config.bind_addr();
    let server = Server::bind(&config)
        .await
        .with_context(|| format!("Failed to start server on {bind_addr}"))?;

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    match server.run_until(ctrl_c).await? {
        ExitReason::Quiescent => tracing::info!("Exited after quiescence"),
        ExitReason::Shutdown => tracing::info!("Shut down"),
    }
    Ok(())
}
