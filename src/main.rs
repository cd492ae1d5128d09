use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use es_app::config::{data_dir, BtcRpcConfig, Config};
use es_app::error::StreamError;
use es_app::event::shorten;
use es_app::ots::{BitcoinRpc, OtsService, Timestamper, Verification};
use es_app::relay::{Filter, RelayPool};
use es_app::store::StreamStore;
use es_app::stream::EventStream;
use es_app::world;

/// Personal cryptographically verifiable event streams over Nostr, anchored
/// in Bitcoin via OpenTimestamps.
#[derive(Parser, Debug)]
#[command(name = "es", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a stream from a private key, or generate one with --gen
    Create {
        name: String,
        privkey: Option<String>,
        #[arg(long)]
        gen: bool,
    },
    /// Remove a local stream and its on-disk state
    Remove { name: String },
    /// Make a stream the active one
    Switch { name: String },
    /// List owned streams (-a includes followed streams)
    Ll {
        #[arg(short = 'a')]
        all: bool,
    },
    /// Append a new event to the active stream and publish it
    Append { content: String },
    /// Follow a remote stream by pubkey and sync its history
    Follow { name: String, pubkey: String },
    /// Stop following a stream
    Unfollow { name: String },
    /// Sync a stream (the active one by default) to its remote head
    Sync { name: Option<String> },
    /// Publish a whole local stream to the relays
    Push { name: Option<String> },
    /// Render a stream's chain
    Log {
        #[arg(long)]
        name: Option<String>,
    },
    /// Fetch and display a single event by id
    Show {
        id: String,
        #[arg(long)]
        verbose: bool,
    },
    /// Add a relay to the active stream and publish its whole log there
    Mirror { url: String },
    /// Sync all followed streams, then listen for new events
    World,
    /// OpenTimestamps operations
    Ots {
        #[command(subcommand)]
        command: OtsCommand,
    },
    /// Manage the active stream's relay set
    Relay {
        #[command(subcommand)]
        command: RelayCommand,
    },
}

#[derive(Subcommand, Debug)]
enum OtsCommand {
    /// Upgrade pending attestations of a stream to Bitcoin-anchored proofs
    Upgrade { name: String },
    /// Verify every attestation of a stream against Bitcoin
    Verify { name: String },
    /// Configure Bitcoin RPC for self-sovereign verification
    Rpc {
        url: String,
        user: String,
        password: String,
    },
    /// Drop the Bitcoin RPC configuration
    Norpc,
}

#[derive(Subcommand, Debug)]
enum RelayCommand {
    Add { url: String },
    Remove { url: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "es=info,es_app=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let dir = data_dir();
    let mut config = Config::load(&dir)?;
    let mut store = StreamStore::open(dir.clone())?;
    let ts = OtsService::new(config.btcrpc.clone())?;

    match cli.command {
        Command::Create { name, privkey, gen } => {
            if privkey.is_some() && gen {
                return Err(StreamError::InvalidInput(
                    "you can't provide both a private key and generate one".to_string(),
                )
                .into());
            }
            if privkey.is_none() && !gen {
                return Err(StreamError::InvalidInput(
                    "provide a private key or pass --gen to generate one".to_string(),
                )
                .into());
            }
            let generated = privkey.is_none();
            let stream = store.create(&name, privkey)?;
            println!("{} ({})", stream.name, stream.pubkey);
            if generated {
                // Shown exactly once; afterwards it only lives in the store.
                println!("Private key: {}", stream.privkey.as_deref().unwrap_or_default());
            }
        }

        Command::Remove { name } => {
            store.remove(&name)?;
            println!("Removed {} stream.", name);
        }

        Command::Switch { name } => {
            store.set_active(&name)?;
            println!("Switched to {}.", name);
        }

        Command::Ll { all } => {
            let active = store.active_pubkey().map(str::to_string);
            for stream in store.list_owned()? {
                let marker = if active.as_deref() == Some(stream.pubkey.as_str()) {
                    "* "
                } else {
                    "  "
                };
                println!("{}{} ({})", marker, stream.name, stream.pubkey);
            }
            if all {
                println!("------------------------------------");
                println!("Following:");
                for stream in store.list_all()? {
                    println!("  {} ({})", stream.name, stream.pubkey);
                }
            }
        }

        Command::Append { content } => {
            let mut stream = store.get_active()?;
            let event = stream.create(&content, &ts).await?;
            store.save(&stream)?;
            println!("Appended event {} to {}.", event.id, stream.name);

            let pool = connect_pool(&config, stream.list_relays()).await;
            let urls = pool.urls();
            if urls.is_empty() {
                warn!("no relays reachable, the event exists only locally");
            } else if let Err(e) = pool.broadcast(&urls, &event).await {
                // The local save already happened; publishing can be retried
                // with `es push`.
                warn!("publish failed: {}", e);
            }
        }

        Command::Follow { name, pubkey } => {
            let pool = connect_pool(&config, &[]).await;
            let stream = store.follow(&pool, &ts, &pubkey, &name).await?;
            println!("Followed {} ({} events).", pubkey, stream.size());
        }

        Command::Unfollow { name } => {
            store.unfollow(&name)?;
            println!("Removed {} stream.", name);
        }

        Command::Sync { name } => {
            let mut stream = stream_by_name_or_active(&store, name.as_deref())?;
            let pool = connect_pool(&config, stream.list_relays()).await;
            let outcome = stream.sync(&pool, &ts).await;
            // Keep the synced prefix even when a later event fails.
            store.save(&stream)?;
            let appended = outcome?;
            println!("Synced {} (+{} events), HEAD at {}.", stream.name, appended, stream.head());
        }

        Command::Push { name } => {
            let stream = stream_by_name_or_active(&store, name.as_deref())?;
            let pool = connect_pool(&config, stream.list_relays()).await;
            let urls = pool.urls();
            if urls.is_empty() {
                return Err(StreamError::EmptyPool.into());
            }
            println!("Pushing stream labeled as {}", stream.name);
            stream.publish_log(&pool, &urls).await?;
            println!("Stream successfully pushed.");
        }

        Command::Log { name } => {
            let stream = stream_by_name_or_active(&store, name.as_deref())?;
            println!("{}", stream.render_chain());
        }

        Command::Show { id, verbose } => {
            if id.is_empty() {
                return Err(StreamError::InvalidInput("event id is empty".to_string()).into());
            }
            let pool = connect_pool(&config, &[]).await;
            let filter = Filter::new().ids(vec![id.clone()]);
            let events = pool.query_pool(&filter).await?;
            let event = events
                .into_iter()
                .find(|event| event.id == id)
                .ok_or_else(|| anyhow::anyhow!("event {} not found on any relay", shorten(&id)))?;
            let name = store.get(&event.pubkey).ok().map(|es| es.name);
            println!("{}", event.display(name.as_deref(), verbose));
        }

        Command::Mirror { url } => {
            let mut stream = store.get_active()?;
            let pool = connect_pool(&config, &[]).await;
            stream.mirror(&pool, &url).await?;
            store.save(&stream)?;
            println!("Mirrored {} to {}.", stream.name, url);
        }

        Command::World => {
            let mut pool = connect_pool(&config, &[]).await;
            world::run(&store, &mut pool, &ts).await?;
        }

        Command::Ots { command } => match command {
            OtsCommand::Upgrade { name } => {
                let mut stream = store.get_by_name(&name)?;
                let upgraded = stream.ots_upgrade(&ts).await?;
                store.save(&stream)?;
                println!("Upgraded {} of {} events.", upgraded, stream.size());
            }
            OtsCommand::Verify { name } => {
                let stream = store.get_by_name(&name)?;
                if !ts.has_rpc_configured() {
                    println!(
                        "No Bitcoin RPC configured; merkle roots are checked \
                         against blockchain.info. Trust the explorer or check \
                         the roots yourself."
                    );
                }
                for (id, verification) in stream.ots_verify(&ts).await? {
                    match verification {
                        Verification::Confirmed { attested_at } => {
                            let time = chrono::DateTime::from_timestamp(attested_at, 0)
                                .map(|t| t.to_rfc2822())
                                .unwrap_or_else(|| attested_at.to_string());
                            println!("{}: successfully verified, attested at {}", id, time);
                        }
                        Verification::Pending => {
                            println!("{}: pending confirmation in Bitcoin blockchain", id)
                        }
                        Verification::Waiting => {
                            println!("{}: waiting for 5 confirmations", id)
                        }
                    }
                }
            }
            OtsCommand::Rpc {
                url,
                user,
                password,
            } => {
                let rpc = BitcoinRpc::new(BtcRpcConfig {
                    host: url.clone(),
                    user: user.clone(),
                    password: password.clone(),
                })?;
                match rpc.block_count().await {
                    Ok(height) => {
                        config.configure_rpc(url, user, password);
                        config.save(&dir)?;
                        println!("Successfully configured Bitcoin RPC (tip at {}).", height);
                    }
                    Err(e) => {
                        return Err(anyhow::anyhow!(
                            "could not connect, keeping old RPC settings: {}",
                            e
                        ));
                    }
                }
            }
            OtsCommand::Norpc => {
                config.unset_rpc();
                config.save(&dir)?;
                println!("Removed Bitcoin RPC configuration.");
            }
        },

        Command::Relay { command } => match command {
            RelayCommand::Add { url } => {
                let mut stream = store.get_active()?;
                stream.add_relay(&url)?;
                store.save(&stream)?;
                println!("Added relay {} to {}.", url, stream.name);
            }
            RelayCommand::Remove { url } => {
                let mut stream = store.get_active()?;
                stream.remove_relay(&url)?;
                store.save(&stream)?;
                println!("Removed relay {} from {}.", url, stream.name);
            }
            RelayCommand::List => {
                let stream = store.get_active()?;
                println!("{} relays:", stream.name);
                for url in stream.list_relays() {
                    println!("  {}", url);
                }
                println!("pool relays:");
                for url in &config.relays {
                    println!("  {}", url);
                }
            }
        },
    }

    Ok(())
}

/// Load a stream by name, falling back to the active one.
fn stream_by_name_or_active(
    store: &StreamStore,
    name: Option<&str>,
) -> std::result::Result<EventStream, StreamError> {
    match name {
        Some(name) => store.get_by_name(name),
        None => store.get_active(),
    }
}

/// Dial the configured pool relays plus any stream-scoped extras.
async fn connect_pool(config: &Config, extra: &[String]) -> RelayPool {
    let mut pool = RelayPool::new();
    for url in config.relays.iter().chain(extra.iter()) {
        if let Err(e) = pool.add(url).await {
            warn!("skipping relay {}: {}", url, e);
        }
    }
    if pool.is_empty() {
        warn!("you have zero relays configured, everything will probably fail");
    }
    pool
}
