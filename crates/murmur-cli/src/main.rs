//! `murmur`: threaded Nostr voice-message feeds in the terminal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use murmur_core::error::ResultExt;
use murmur_core::upload::{self, BlossomUploader};
use murmur_core::{
    spawn_poller, Draft, FeedConfig, FeedEngine, FeedError, FeedKey, FeedUpdate, PageLoad, RelayPublisher,
    RelayStore, Result, ThreadNode,
};
use nostr_sdk::prelude::*;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time given to relay connections before the first query.
const CONNECT_GRACE: Duration = Duration::from_secs(2);

type Engine = FeedEngine<RelayStore, RelayPublisher>;

#[derive(Parser)]
#[command(name = "murmur", version, about = "Threaded Nostr voice-message feeds")]
struct Cli {
    /// Secret key (nsec or hex). Without one the client is read-only.
    #[arg(long, env = "MURMUR_NSEC", hide_env_values = true, global = true)]
    nsec: Option<String>,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Relay to use instead of the configured ones (repeatable)
    #[arg(long = "relay", global = true)]
    relays: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a threaded feed
    Feed {
        view: View,
        /// Hashtag, author pubkey, or thread id, depending on the view
        target: Option<String>,
        /// Pages to load before printing
        #[arg(long, default_value_t = 1)]
        pages: usize,
        /// Keep running and reprint on live updates
        #[arg(long)]
        watch: bool,
        #[arg(long)]
        json: bool,
    },
    /// Upload a recording and post it as a new voice message
    Post {
        #[arg(long)]
        file: PathBuf,
        /// Hashtag to attach (repeatable)
        #[arg(long = "tag")]
        hashtags: Vec<String>,
    },
    /// Upload a recording and post it as a reply
    Reply {
        id: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Ask relays to delete one of your messages
    Delete { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum View {
    Global,
    Following,
    Tag,
    Author,
    Thread,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=info,murmur_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => FeedConfig::from_json_file(path)?,
        None => FeedConfig::default(),
    };
    if !cli.relays.is_empty() {
        config.relays = cli.relays.clone();
    }

    let keys = cli
        .nsec
        .as_deref()
        .map(|nsec| Keys::parse(nsec).map_err(|e| FeedError::InvalidKey(e.to_string())))
        .transpose()?;

    let client = match &keys {
        Some(keys) => Client::builder().signer(keys.clone()).build(),
        None => Client::builder().build(),
    };
    for relay in &config.relays {
        if let Err(e) = client.add_relay(relay.as_str()).await {
            tracing::warn!(relay = %relay, error = %e, "skipping relay");
        }
    }
    client.connect().await;
    tokio::time::sleep(CONNECT_GRACE).await;

    let engine = Arc::new(FeedEngine::new(
        config,
        RelayStore::new(client.clone()),
        RelayPublisher::new(client.clone()),
    ));

    let outcome = match cli.command {
        Command::Feed { view, target, pages, watch, json } => {
            let key = feed_key(view, target, keys.as_ref())?;
            show_feed(&engine, key, pages, watch, json).await
        }
        Command::Post { file, hashtags } => {
            let url = upload_recording(&engine, keys.as_ref(), &file).await?;
            let draft = hashtags.into_iter().fold(Draft::root(url), Draft::with_hashtag);
            post(&engine, draft).await
        }
        Command::Reply { id, file } => {
            let parent = load_message(&engine, &id).await?;
            let url = upload_recording(&engine, keys.as_ref(), &file).await?;
            post(&engine, Draft::reply(parent, url)).await
        }
        Command::Delete { id } => {
            load_message(&engine, &id).await?;
            engine.delete(&id).await?;
            println!("deletion requested for {}", id);
            Ok(())
        }
    };

    client.disconnect().await;
    outcome
}

fn feed_key(view: View, target: Option<String>, keys: Option<&Keys>) -> Result<FeedKey> {
    let required = |what: &str| target.clone().ok_or_else(|| FeedError::InvalidKey(format!("missing {}", what)));
    Ok(match view {
        View::Global => FeedKey::Global,
        View::Following => {
            let follower = match (&target, keys) {
                (Some(pk), _) => to_hex_pubkey(pk)?,
                (None, Some(keys)) => keys.public_key().to_hex(),
                (None, None) => return Err(FeedError::InvalidKey("following needs a pubkey or --nsec".into())),
            };
            FeedKey::Following(follower)
        }
        View::Tag => FeedKey::Hashtag(required("hashtag")?.trim_start_matches('#').to_lowercase()),
        View::Author => FeedKey::Author(to_hex_pubkey(&required("author pubkey")?)?),
        View::Thread => FeedKey::Thread(to_hex_event_id(&required("thread id")?)?),
    })
}

fn to_hex_pubkey(raw: &str) -> Result<String> {
    PublicKey::parse(raw)
        .map(|pk| pk.to_hex())
        .map_err(|e| FeedError::InvalidKey(format!("{}: {}", raw, e)))
}

fn to_hex_event_id(raw: &str) -> Result<String> {
    EventId::parse(raw)
        .map(|id| id.to_hex())
        .map_err(|e| FeedError::InvalidKey(format!("{}: {}", raw, e)))
}

async fn show_feed(engine: &Arc<Engine>, key: FeedKey, pages: usize, watch: bool, json: bool) -> Result<()> {
    engine.subscribe(key.clone()).await;
    for _ in 0..pages.max(1) {
        match engine.load_next_page(&key).await? {
            PageLoad::Loaded { .. } => {}
            PageLoad::Exhausted => break,
            PageLoad::Unavailable => tracing::warn!(feed = %key, "relays did not answer, showing what we have"),
            PageLoad::Discarded => break,
        }
    }
    print_threads(&engine.threads(&key).await, json)?;

    if !watch {
        return Ok(());
    }
    let mut updates = engine.updates();
    let poller = spawn_poller(Arc::clone(engine));
    tracing::info!(feed = %key, "watching for replies, ctrl-c to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(FeedUpdate::Changed { keys }) if keys.contains(&key) => {
                    print_threads(&engine.threads(&key).await, json)?;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "update receiver lagged");
                    print_threads(&engine.threads(&key).await, json)?;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    poller.stop().await;
    engine.unsubscribe(&key).await;
    Ok(())
}

/// Load the thread around `id` and return the message itself.
async fn load_message(engine: &Engine, id: &str) -> Result<Arc<murmur_core::Message>> {
    let id = to_hex_event_id(id)?;
    let key = FeedKey::Thread(id.clone());
    engine.subscribe(key.clone()).await;
    engine.load_next_page(&key).await?;
    engine
        .snapshot(&key)
        .await
        .and_then(|part| part.find(&id).cloned())
        .ok_or(FeedError::UnknownMessage(id))
}

async fn upload_recording(engine: &Engine, keys: Option<&Keys>, file: &Path) -> Result<String> {
    let keys = keys.ok_or(FeedError::NotAuthenticated)?;
    let data = tokio::fs::read(file).await.upload(&file.display().to_string())?;

    let author = keys.public_key().to_hex();
    let config = engine.config();
    let servers = upload::discover_servers(engine.store(), Some(&author), config, config.query_timeout()).await;
    BlossomUploader::new(servers, keys.clone())
        .upload(data, Some(content_type(file)))
        .await
}

async fn post(engine: &Engine, draft: Draft) -> Result<()> {
    let outcome = engine.publish(draft).await?;
    println!("{}", outcome.id);
    Ok(())
}

fn content_type(file: &Path) -> &'static str {
    match file.extension().and_then(|e| e.to_str()).map(str::to_lowercase).as_deref() {
        Some("webm") => "audio/webm",
        Some("ogg" | "opus") => "audio/ogg",
        Some("mp3") => "audio/mpeg",
        Some("m4a" | "mp4") => "audio/mp4",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    }
}

fn print_threads(threads: &[ThreadNode], json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(threads).map_err(|e| FeedError::Config(e.to_string()))?;
        println!("{}", out);
        return Ok(());
    }
    for node in threads {
        print_node(node, 0);
    }
    Ok(())
}

fn print_node(node: &ThreadNode, depth: usize) {
    let msg = &node.message;
    let flag = if msg.failed {
        " [failed]"
    } else if msg.pending {
        " [sending]"
    } else {
        ""
    };
    println!(
        "{}{} {} {} {}{}",
        "  ".repeat(depth),
        short(&msg.id),
        short(&msg.author),
        msg.created_at,
        msg.content,
        flag
    );
    for reply in &node.replies {
        print_node(reply, depth + 1);
    }
}

fn short(hex: &str) -> String {
    hex.chars().take(8).collect()
}
