//!
//! armory watch binary
//! -------------------
//! Signs in with a Discord access token, runs the role gate, then keeps the
//! weapons, weapon types and users collections fresh either by polling the
//! data-status endpoint or by subscribing to push channels. Every change
//! re-fetches the collection and prints its size.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use armory::client::{
    AccessGate, ApiClient, ChangeDetector, ChangeHandlers, DetectorConfig, GateState, PushClient, PushClientConfig,
    PushSubscriber, StatusSource,
};
use armory::config::LOCAL_PUSH_KEY;
use armory::model::Collection;

#[derive(Parser, Debug)]
#[command(name = "armory_watch", version, about = "Follow armory collections from the command line")]
struct Cli {
    /// Server base URL
    #[arg(long, env = "ARMORY_URL", default_value = "http://127.0.0.1:7878")]
    base: String,

    /// Discord OAuth access token used to sign in
    #[arg(long, env = "ARMORY_DISCORD_TOKEN")]
    token: String,

    /// Subscribe to push channels instead of polling
    #[arg(long, default_value_t = false)]
    push: bool,

    /// Push socket URL; defaults to the server's local hub
    #[arg(long)]
    push_url: Option<String>,

    /// Polling interval in seconds
    #[arg(long, default_value_t = 15)]
    interval: u64,
}

/// Callbacks only enqueue; a single worker re-fetches so slow requests never
/// stall the detector or the socket.
fn queue_handlers(tx: mpsc::UnboundedSender<Collection>) -> ChangeHandlers {
    let (w, t, u) = (tx.clone(), tx.clone(), tx);
    ChangeHandlers::new()
        .on_weapons(move || {
            let _ = w.send(Collection::Weapons);
        })
        .on_weapon_types(move || {
            let _ = t.send(Collection::WeaponTypes);
        })
        .on_users(move || {
            let _ = u.send(Collection::Users);
        })
}

async fn refetch_worker(api: ApiClient, mut rx: mpsc::UnboundedReceiver<Collection>) {
    while let Some(collection) = rx.recv().await {
        match api.fetch_collection(collection).await {
            Ok(count) => println!("{}: {} rows", collection, count),
            Err(e) => warn!("re-fetching {} failed: {}", collection, e),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    let api = ApiClient::new(&cli.base).context("While creating the API client")?;
    let user = api.sign_in(&cli.token, None).await.context("While signing in")?;
    info!("signed in as {} ({})", user.display_name(), user.id);

    let gate = AccessGate::new(Arc::new(api.clone()));
    match gate.ensure_checked(Some(&user.id)).await {
        GateState::Denied { message } => {
            println!("access denied: {}", message);
            return Ok(());
        }
        GateState::Expired { message } => {
            println!("{} (sign in again at {})", message, armory::client::gate::SIGN_IN_ROUTE);
            return Ok(());
        }
        GateState::Unverified => warn!("role could not be verified, continuing"),
        state => info!(?state, "role gate passed"),
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let handlers = queue_handlers(tx);
    for collection in Collection::ALL {
        handlers.fire(collection);
    }
    let worker = tokio::spawn(refetch_worker(api.clone(), rx));

    if cli.push {
        let url = match cli.push_url {
            Some(url) => PushClientConfig::new(url),
            None => PushClientConfig::local(&cli.base, LOCAL_PUSH_KEY)?,
        };
        info!(url = %url.url, "following push channels");
        let client = PushClient::new(url);
        let mut subscriber = PushSubscriber::new(&client, handlers);
        subscriber.attach();
        client.acquire();
        let mut states = client.state_watch();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                info!(%state, "push connection");
            }
        });
        let _ = tokio::signal::ctrl_c().await;
        subscriber.detach();
        client.shutdown();
    } else {
        let source: Arc<dyn StatusSource> = Arc::new(api.clone());
        let config = DetectorConfig { handlers, polling_interval: Duration::from_secs(cli.interval.max(1)), enabled: true };
        info!(interval_secs = config.polling_interval.as_secs(), "polling data status");
        let mut detector = ChangeDetector::start(source, config);
        let _ = tokio::signal::ctrl_c().await;
        detector.shutdown();
    }

    worker.abort();
    if let Err(e) = api.sign_out().await {
        warn!("sign-out failed: {}", e);
    }
    Ok(())
}
