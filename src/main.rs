//!
//! armory server binary
//! --------------------
//! Starts the HTTP server (default) or runs the administrative bootstrap.
//! Configuration comes from the environment; flags override it.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use armory::config::{AppConfig, LOCAL_PUSH_KEY};
use armory::push::PushConfig;
use armory::storage::SharedStore;

#[derive(Parser, Debug)]
#[command(name = "armory", version, about = "Weapon inventory service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// HTTP port (overrides ARMORY_HTTP_PORT)
    #[arg(long)]
    http_port: Option<u16>,

    /// Bind address (overrides ARMORY_BIND)
    #[arg(long)]
    bind: Option<String>,

    /// JSON data file (overrides ARMORY_DATA_FILE)
    #[arg(long)]
    data_file: Option<PathBuf>,

    /// Serve the in-process push hub when no Pusher credentials are set.
    #[arg(long, default_value_t = false)]
    local_push: bool,

    /// Keep the user row when the role check denies access; only sessions are revoked.
    #[arg(long, default_value_t = false)]
    keep_denied_users: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server.
    Serve(ServeArgs),
    /// Promote a user to ADMIN in the data file.
    MakeAdmin {
        user_id: String,

        #[arg(long, env = "ARMORY_DATA_FILE")]
        data_file: Option<PathBuf>,
    },
}

fn apply_overrides(mut config: AppConfig, args: ServeArgs) -> AppConfig {
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(path) = args.data_file {
        config.data_file = Some(path);
    }
    if args.local_push && config.push == PushConfig::Disabled {
        config.push = PushConfig::Local { key: LOCAL_PUSH_KEY.to_string() };
    }
    if args.keep_denied_users {
        config.deprovision_on_denied = false;
    }
    config
}

fn make_admin(user_id: &str, data_file: Option<PathBuf>) -> anyhow::Result<()> {
    let Some(path) = data_file else {
        bail!("make-admin needs a data file (--data-file or ARMORY_DATA_FILE)");
    };
    let store = SharedStore::open(&path).with_context(|| format!("While opening data file {}", path.display()))?;
    let promoted = armory::inventory::make_admin(&store, user_id).with_context(|| format!("While promoting {}", user_id))?;
    info!("{} ({}) is now an admin", promoted.value.display_name(), promoted.value.id);
    println!("{} is now ADMIN", promoted.value.id);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => armory::server::run(apply_overrides(AppConfig::from_env(), args)).await,
        Command::MakeAdmin { user_id, data_file } => make_admin(&user_id, data_file),
    }
}
