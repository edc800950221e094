use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use passkey_referral::{
    config::Config,
    session::HistoryNavigator,
    storage::{FileStore, KeyValueStore, MemoryStore},
    store::ReferralStore,
    token::{referral_link, ReferralToken},
    wallet::{verify_claim, DevWallet},
    ClaimStatus, ReferralApp, ReferralCapture,
};

#[derive(Parser)]
#[command(name = "refkit")]
#[command(about = "Referral links, attribution and gasless badge claims for passkey wallets")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "refkit.toml")]
    config: PathBuf,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "REFKIT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Tab whose pending referral is used (overrides config file)
    #[arg(long)]
    tab: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a development wallet key pair
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Print the referral link of a wallet
    Link {
        #[arg(long)]
        sk_hex: String,
    },
    /// Open a link in the current tab, capturing its referral token
    Visit { url: String },
    /// Sign in with a wallet, attribute any pending referral and show the dashboard
    Login {
        #[arg(long)]
        sk_hex: String,
        /// Display name reported by the wallet
        #[arg(long)]
        name: Option<String>,
        /// Wallet is returning from the passkey portal with a live session
        #[arg(long)]
        resume: bool,
        /// Also claim the welcome badge
        #[arg(long)]
        claim: bool,
    },
    /// Show referral stats of an identity
    Stats { identity: String },
    /// Run the whole referral flow in memory with two fresh wallets
    Demo,
}

//==================== helpers ====================//

fn write_all(p: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = fs::File::create(p).with_context(|| format!("create {}", p.display()))?;
    f.write_all(bytes)?;
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn file_app(
    config: &Config,
    wallet: Arc<DevWallet>,
    navigator: Arc<HistoryNavigator>,
) -> ReferralApp {
    ReferralApp::new(
        Arc::new(FileStore::new(config.durable_dir())),
        Arc::new(FileStore::new(config.tab_dir())),
        wallet.clone(),
        wallet,
        navigator,
        config.referral.origin.clone(),
    )
}

//==================== commands ====================//

fn keygen_cmd(out_dir: &Path) -> anyhow::Result<()> {
    let wallet = DevWallet::generate();
    write_all(&out_dir.join("sk.hex"), wallet.secret_hex().as_bytes())?;
    write_all(&out_dir.join("pk.hex"), wallet.identity().as_bytes())?;
    println!("keypair written → {}", out_dir.display());
    Ok(())
}

fn link_cmd(config: &Config, sk_hex: &str) -> anyhow::Result<()> {
    let wallet = DevWallet::from_secret_hex(sk_hex)?;
    let token = ReferralToken::for_identity(&wallet.identity());
    println!("{}", referral_link(&config.referral.origin, &token));
    Ok(())
}

fn visit_cmd(config: &Config, url: &str) -> anyhow::Result<()> {
    let tab: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(config.tab_dir()));
    let capture = ReferralCapture::new(tab);
    if capture.capture_link(url) {
        if let Some(pending) = capture.peek_pending() {
            println!("captured {} in tab {}", pending.token, config.storage.tab);
        }
    } else {
        println!("no referral token in {url}");
    }
    Ok(())
}

async fn login_cmd(
    config: &Config,
    sk_hex: &str,
    name: Option<String>,
    resume: bool,
    claim: bool,
) -> anyhow::Result<()> {
    let mut wallet = DevWallet::from_secret_hex(sk_hex)?;
    if let Some(name) = name {
        wallet = wallet.with_display_name(name);
    }
    if resume {
        wallet = wallet.resumed();
    }
    let wallet = Arc::new(wallet);
    let navigator = Arc::new(HistoryNavigator::new());
    let app = file_app(config, wallet, navigator.clone());

    if app.lifecycle.hydrate().await?.is_none() {
        app.lifecycle.connect(&config.connect_options()).await?;
    }
    info!(route = %navigator.current(), "signed in");

    if claim {
        match app.claim.claim().await? {
            Some(receipt) => {
                verify_claim(&receipt)?;
                print_json(&receipt)?;
            }
            None => println!("badge already claimed in this session"),
        }
    }

    let Some(view) = app.dashboard() else {
        bail!("session ended before the dashboard could load");
    };
    print_json(&view)
}

fn stats_cmd(config: &Config, identity: &str) -> anyhow::Result<()> {
    let store = ReferralStore::open(Arc::new(FileStore::new(config.durable_dir())));
    let graph = store.graph_snapshot();
    print_json(&serde_json::json!({
        "identity": identity,
        "referral_count": store.count_referrals(identity),
        "referred": store.referred_by(identity),
        "referred_by": store.referrer_of(identity),
        "graph_digest": hex::encode(graph.digest()),
    }))
}

async fn demo_cmd(config: &Config) -> anyhow::Result<()> {
    let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let origin = config.referral.origin.clone();

    // referrer signs in and shares a link
    let alice = Arc::new(DevWallet::generate().with_display_name("Alice"));
    let alice_nav = Arc::new(HistoryNavigator::new());
    let alice_app = ReferralApp::new(
        durable.clone(),
        Arc::new(MemoryStore::new()),
        alice.clone(),
        alice.clone(),
        alice_nav,
        origin.clone(),
    );
    alice_app.lifecycle.connect(&config.connect_options()).await?;
    let link = alice_app
        .dashboard()
        .map(|v| v.referral_link)
        .context("referrer dashboard")?;
    println!("1. Alice shares {link}");
    alice_app.lifecycle.disconnect().await;

    // a new visitor opens the link in a fresh tab and signs in
    let bob = Arc::new(DevWallet::generate().with_display_name("Bob"));
    let bob_nav = Arc::new(HistoryNavigator::new());
    let bob_app = ReferralApp::new(
        durable.clone(),
        Arc::new(MemoryStore::new()),
        bob.clone(),
        bob.clone(),
        bob_nav.clone(),
        origin,
    );
    bob_app.capture.capture_link(&link);
    println!("2. Bob opens the link; pending token captured");
    bob_app.lifecycle.connect(&config.connect_options()).await?;
    println!("3. Bob connects and lands on {}", bob_nav.current());

    let receipt = bob_app.claim.claim().await?.context("first claim signs")?;
    verify_claim(&receipt)?;
    println!("4. Bob claims the welcome badge (digest {})", receipt.digest);
    if bob_app.claim.claim().await?.is_some() || bob_app.claim.status() != ClaimStatus::Claimed {
        bail!("badge claimed twice");
    }

    bob_app.lifecycle.disconnect().await;
    bob_app.lifecycle.connect(&config.connect_options()).await?;
    let count = bob_app.store.count_referrals(&alice.identity());
    println!("5. Bob signs in again; Alice's referral count stays at {count}");

    alice_app.lifecycle.connect(&config.connect_options()).await?;
    if let Some(view) = alice_app.dashboard() {
        print_json(&view)?;
    }
    Ok(())
}

//==================== main ====================//

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("passkey_referral=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(tab) = cli.tab {
        config.storage.tab = tab;
    }

    match cli.command {
        Command::Keygen { out_dir } => keygen_cmd(&out_dir),
        Command::Link { sk_hex } => link_cmd(&config, &sk_hex),
        Command::Visit { url } => visit_cmd(&config, &url),
        Command::Login {
            sk_hex,
            name,
            resume,
            claim,
        } => login_cmd(&config, &sk_hex, name, resume, claim).await,
        Command::Stats { identity } => stats_cmd(&config, &identity),
        Command::Demo => demo_cmd(&config).await,
    }
}
