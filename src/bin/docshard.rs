use clap::{crate_version, Parser};

use libp2p::{core::Multiaddr, multiaddr::Protocol};
use std::error::Error;
use std::fs;
use std::sync::Arc;
use tokio::spawn;
use tokio::time::Duration;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use docshard::client::Client;
use docshard::collector::ShardCollector;
use docshard::config::DocshardConfig;
use docshard::constants::DEFAULT_CONFIG_DIR;
use docshard::document::{DataType, Document, DocumentHash};
use docshard::network;
use docshard::provider::run_loop;
use docshard::registry::{HolderRegistry, SnapshotFile};
use docshard::shard::ShardedDocument;
use docshard::splitter::ShardSplitter;
use docshard::transport::{collect, publish_all};
use docshard::verifier::ShardVerifier;

#[derive(Debug, Parser)]
#[command(name = "docshard")]
#[command(version = crate_version!())]
#[command(
    about = "docshard - threshold document sharding",
    long_about = "docshard splits a document into shards, assigns each shard to one holder taken from a weight-ordered holder snapshot, and rebuilds the document once enough signed shards are collected. Holders run `provide`: they accept shards addressed to their peer id, sign them with their identity key and serve them to combiners. The snapshot is a JSON file listing holder peer ids and weights at a given height; shard i goes to the holder ranked i."
)]
enum CliArgument {
    /// Run a holder node that signs, stores and serves the shards assigned to it.
    Provide {
        /// use embedded database for persistence
        /// otherwise use the configured path or a memory database
        #[clap(long, short)]
        db_path: Option<String>,
    },
    /// Split a document and hand each shard to its holder.
    Split {
        /// Holder snapshot (JSON).
        #[clap(long, short)]
        snapshot: String,

        /// Document to split.
        #[clap(long, short)]
        input: String,

        /// Number of shards. Defaults to the data type's shard count.
        #[clap(long, short = 'n')]
        shards: Option<usize>,

        /// Declared data type of the document.
        #[clap(long, short = 't')]
        data_type: Option<DataType>,

        /// Shards required to rebuild. Defaults to all of them.
        #[clap(long, short = 'k')]
        threshold: Option<usize>,

        /// Where to write the manifest. Defaults to `<document hash>.json`.
        #[clap(long, short)]
        manifest: Option<String>,

        /// Verbose mode displays the shards
        #[clap(long, short)]
        verbose: bool,
    },
    /// Collect signed shards from the holders and rebuild a document.
    Combine {
        /// Manifest written by `split`.
        #[clap(long, short)]
        manifest: String,

        /// Holder snapshot (JSON) the document was split against.
        #[clap(long, short)]
        snapshot: String,

        /// Output file. Prints to stdout otherwise.
        #[clap(long, short)]
        output: Option<String>,
    },
    /// List the holders providing shards of a document.
    Ls {
        /// Document hash (hex).
        #[clap(long)]
        hash: DocumentHash,
    },
}

#[derive(Parser, Debug)]
#[clap(name = "docshard")]
struct Opt {
    /// Configuration directory.
    #[clap(long, short, default_value = DEFAULT_CONFIG_DIR)]
    config: String,

    /// Address of a peer to connect to.
    #[clap(long, short)]
    peer: Option<Multiaddr>,

    /// Address to listen on.
    #[clap(long, short)]
    listen_address: Option<Multiaddr>,

    /// Subcommand to run.
    #[clap(subcommand)]
    argument: CliArgument,
}

fn load_registry(path: &str) -> Result<(HolderRegistry, SnapshotFile), Box<dyn Error>> {
    let snapshot = SnapshotFile::load(path)?;
    let registry = HolderRegistry::new();
    snapshot.seal_into(&registry)?;
    Ok((registry, snapshot))
}

async fn dial(client: &mut Client, addr: Multiaddr) -> Result<(), Box<dyn Error>> {
    debug!("Dialing peer at {}.", addr);
    let Some(Protocol::P2p(peer_id)) = addr.iter().last() else {
        return Err("Expect peer multiaddr to contain peer ID.".into());
    };
    client
        .dial(peer_id, addr)
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let opt = Opt::parse();
    let conf = DocshardConfig::new(&opt.config)?;
    let keypair = conf.key()?;

    let (mut network_client, network_events, network_event_loop) =
        network::new(keypair.clone()).await?;

    // Spawn the network task for it to run in the background.
    spawn(network_event_loop.run());

    let listen = match opt.listen_address {
        Some(addr) => addr,
        None => "/ip4/0.0.0.0/tcp/0".parse()?,
    };
    network_client
        .start_listening(listen)
        .await
        .map_err(|e| e.to_string())?;

    for addr in conf.bootstrappers.iter().cloned().chain(opt.peer) {
        if let Err(e) = dial(&mut network_client, addr).await {
            warn!("Could not reach peer: {e}");
        }
    }

    match opt.argument {
        CliArgument::Provide { db_path } => {
            println!("🛰️  Holding shards as {}", network_client.peer_id);
            run_loop(
                db_path.or(conf.db_path),
                keypair,
                &mut network_client,
                network_events,
            )
            .await?;
        }

        CliArgument::Split {
            snapshot,
            input,
            shards,
            data_type,
            threshold,
            manifest,
            verbose,
        } => {
            // sleep for a bit to give the network time to bootstrap
            tokio::time::sleep(Duration::from_secs(1)).await;

            let (registry, snapshot) = load_registry(&snapshot)?;
            let splitter = match (shards, data_type) {
                (None, Some(t)) if threshold.is_none() => ShardSplitter::for_data_type(t)?,
                _ => {
                    let total = match (shards, data_type) {
                        (Some(n), _) => n,
                        (None, Some(t)) => t.checked_shard_count()?,
                        (None, None) => snapshot.holders.len(),
                    };
                    ShardSplitter::with_threshold(threshold.unwrap_or(total), total)?
                }
            };

            let document = Document::new(fs::read(&input)?);
            let sharded =
                splitter.shard_document(&document, &registry, &snapshot.reference())?;

            if verbose {
                println!("🐛 shards: ");
                for shard in &sharded.shards {
                    println!(
                        "  {} {} {}",
                        shard.shard_index,
                        shard.holder_address,
                        hex::encode(&shard.payload)
                    );
                }
            }

            let acked = publish_all(&network_client, &sharded.shards).await;
            let manifest_path =
                manifest.unwrap_or_else(|| format!("{}.json", sharded.document_hash));
            fs::write(
                &manifest_path,
                serde_json::to_string_pretty(&sharded.manifest())?,
            )?;

            println!("✂️  Document has been split and distributed across holders.");
            println!("    hash: {}", sharded.document_hash);
            println!("    threshold: {}/{}", sharded.threshold, sharded.total_shards);
            println!("    accepted: {}", acked);
            println!("    manifest: {}", manifest_path);
            if acked < sharded.threshold {
                return Err(format!(
                    "only {acked} holders accepted their shard, {} needed to rebuild",
                    sharded.threshold
                )
                .into());
            }
        }

        CliArgument::Combine {
            manifest,
            snapshot,
            output,
        } => {
            // sleep for a bit to give the network time to bootstrap
            tokio::time::sleep(Duration::from_secs(1)).await;

            let sharded: ShardedDocument = serde_json::from_str(&fs::read_to_string(&manifest)?)?;
            let (registry, _) = load_registry(&snapshot)?;
            // ask the assigned holders directly as well as whoever the DHT reports
            let assigned = registry.get_top_n(sharded.total_shards, &sharded.snapshot)?;
            let transport =
                network_client.with_known_holders(assigned.into_iter().map(|r| r.address));
            let collector = ShardCollector::new(
                &sharded,
                Arc::new(ShardVerifier::new(Arc::new(registry))),
            );

            let document = collect(
                &transport,
                &collector,
                Duration::from_secs(conf.collect_timeout_secs),
            )
            .await?;

            match output {
                Some(path) => {
                    fs::write(&path, document.as_bytes())?;
                    println!("🔑 document {} written to {}", document.hash(), path);
                }
                None => match std::str::from_utf8(document.as_bytes()) {
                    Ok(text) => println!("{text}"),
                    Err(_) => println!("{}", hex::encode(document.as_bytes())),
                },
            }
        }

        CliArgument::Ls { hash } => {
            let providers = network_client.get_providers(hash.to_string()).await;
            if providers.is_empty() {
                return Err(format!("Could not find holders for document {hash}.").into());
            }
            println!("✂️  Shard Holders: {:#?}", providers);
        }
    }

    Ok(())
}
