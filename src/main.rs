use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use ipnet::IpNet;
use lloggs::LoggingArgs;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

use fsserve::config::Config;
use fsserve::db::{DbMode, SqliteTreeDb, sqlite};
use fsserve::serve::{Server, ServerConfig};
use fsserve::store::FsStore;
use fsserve::tree::{EncodedFile, Tree};
use fsserve::{id, mime};

#[derive(Parser)]
#[command(name = "fsserve")]
#[command(about = "Content-addressed static file server")]
struct Args {
    /// Path to the config file
    #[arg(long, global = true, env = "FSSERVE_CONFIG", default_value = "fsserve.json")]
    config: PathBuf,

    /// Static files base directory
    #[arg(long, short, global = true, env = "FSSERVE_BASE")]
    base: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the published tree over HTTP
    Serve {
        /// Port to listen on
        #[arg(long, short, env = "FSSERVE_PORT")]
        port: Option<u16>,
    },
    /// Manage the content tree
    Tree {
        #[command(subcommand)]
        command: TreeCommand,
    },
}

#[derive(Subcommand)]
enum TreeCommand {
    /// Initialize the tree database
    Init,
    /// Publish one file and its pre-encoded alternates
    Add {
        /// Destination tree path
        #[arg(long = "file", short = 'f')]
        dst: String,
        /// Content type of the file
        #[arg(long = "contenttype", default_value = "")]
        content_type: String,
        /// Source file to publish
        #[arg(long, short)]
        src: PathBuf,
        /// Encoded alternates in the form code:path
        #[arg(long = "enc", short = 'e')]
        enc: Vec<String>,
    },
    /// Remove a published tree path
    Rm {
        /// Tree path to remove
        #[arg(long = "file", short = 'f')]
        dst: String,
    },
    /// Batch publish from the sync configuration
    Sync {
        /// Remove records not covered by the configuration
        #[arg(long)]
        rm: bool,
    },
    /// Collect unreferenced blobs
    Gc {
        /// Also sweep the whole blob store
        #[arg(long)]
        full: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let _guard = args.logging.setup(|v| match v {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    })?;

    let mut config = Config::load_or_default(&args.config)?;
    if let Some(base) = args.base {
        config.base = base;
    }

    match args.command {
        Command::Serve { port } => run_serve(config, port).await,
        Command::Tree { command } => run_tree(config, command).await,
    }
}

fn content_dir(config: &Config) -> PathBuf {
    Path::new(config.base_dir()).join(&config.content_dir)
}

fn open_tree_db(config: &Config, mode: DbMode) -> Result<SqliteTreeDb, fsserve::db::DbError> {
    let path = Path::new(config.base_dir()).join(sqlite::dsn_path(&config.tree_db));
    info!(db = %path.display(), "using tree db");
    SqliteTreeDb::open(&path, mode)
}

async fn publisher(
    config: &Config,
    mode: DbMode,
) -> Result<Tree<FsStore, SqliteTreeDb>, Box<dyn std::error::Error + Send + Sync>> {
    let store = FsStore::new(content_dir(config));
    store.init().await?;
    let db = open_tree_db(config, mode)?;
    Ok(Tree::new(store, db))
}

async fn run_serve(
    config: Config,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    mime::init(&config.ext_to_type);

    let mut proxies: Vec<IpNet> = Vec::with_capacity(config.proxies.len());
    for cidr in &config.proxies {
        proxies.push(cidr.parse()?);
    }
    info!(?proxies, "trusted proxies");

    let store = FsStore::new(content_dir(&config));
    let db = open_tree_db(&config, DbMode::ReadOnly)?;

    let server = Server::new(
        store,
        db,
        config.routes.clone(),
        ServerConfig {
            instance: id::random_instance(),
            proxies,
        },
    )?;

    let port = port.unwrap_or(config.port);
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let mut term = signal(SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        info!("shutting down");
    };

    server.serve(listener, config.serve_opts(), shutdown).await?;
    Ok(())
}

async fn run_tree(
    config: Config,
    command: TreeCommand,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match command {
        TreeCommand::Init => {
            let tree = publisher(&config, DbMode::Create).await?;
            tree.setup()?;
        }
        TreeCommand::Add {
            dst,
            content_type,
            src,
            enc,
        } => {
            let mut encoded = Vec::with_capacity(enc.len());
            for spec in &enc {
                let Some((code, path)) = spec.split_once(':') else {
                    return Err(format!("invalid encoded file spec {spec:?}").into());
                };
                encoded.push(EncodedFile {
                    code: code.to_string(),
                    src: PathBuf::from(path),
                });
            }
            let tree = publisher(&config, DbMode::ReadWrite).await?;
            tree.add(&dst, &content_type, &src, &encoded).await?;
        }
        TreeCommand::Rm { dst } => {
            let tree = publisher(&config, DbMode::ReadWrite).await?;
            tree.rm(&dst).await?;
        }
        TreeCommand::Sync { rm } => {
            let tree = publisher(&config, DbMode::ReadWrite).await?;
            tree.sync(&config.sync, rm).await?;
        }
        TreeCommand::Gc { full } => {
            let tree = publisher(&config, DbMode::ReadWrite).await?;
            tree.gc(full).await?;
        }
    }
    Ok(())
}
