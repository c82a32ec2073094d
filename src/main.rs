use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use agora::{
    JsonFileStore, Keypair, Message, Node, NodeConfig, NodeEvent, UserProfile, is_valid_author,
};

/// How long `/join` and `/history` wait for peers to answer before printing.
const HISTORY_WAIT: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: SocketAddr,
    identity: String,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("peer must include Identity (format: IP:PORT/IDENTITY)")?;

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;

        let id_bytes = hex::decode(id_part).context("invalid hex Identity")?;
        if id_bytes.len() != 32 {
            anyhow::bail!("Identity must be 64 hex characters (32 bytes)");
        }

        Ok(BootstrapPeer {
            addr,
            identity: id_part.to_string(),
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "agora")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// Directory holding forums, message logs, the profile and the node key.
    #[arg(short, long, default_value = "agora-data")]
    data_dir: PathBuf,

    /// Display name; saved to the profile.
    #[arg(short, long)]
    name: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum ShellCommand {
    Create(String),
    List,
    Join(String),
    Leave,
    History(Option<String>),
    Peers,
    Connect(String),
    Help,
    Quit,
    Post(String),
    Unknown(String),
    Empty,
}

fn parse_line(line: &str) -> ShellCommand {
    let line = line.trim();
    if line.is_empty() {
        return ShellCommand::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ShellCommand::Post(line.to_string());
    };

    let (cmd, arg) = match command.split_once(' ') {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (command, ""),
    };
    match (cmd, arg) {
        ("create", name) if !name.is_empty() => ShellCommand::Create(name.to_string()),
        ("list", _) => ShellCommand::List,
        ("join", name) if !name.is_empty() => ShellCommand::Join(name.to_string()),
        ("leave", _) => ShellCommand::Leave,
        ("history", "") => ShellCommand::History(None),
        ("history", name) => ShellCommand::History(Some(name.to_string())),
        ("peers", _) => ShellCommand::Peers,
        ("connect", peer) if !peer.is_empty() => ShellCommand::Connect(peer.to_string()),
        ("help", _) => ShellCommand::Help,
        ("quit" | "exit", _) => ShellCommand::Quit,
        _ => ShellCommand::Unknown(line.to_string()),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  /create <name>        create a forum");
    println!("  /list                 list known forums");
    println!("  /join <name>          enter a forum and fetch its history");
    println!("  /leave                leave the current forum");
    println!("  /history [name]       fetch and show a forum's messages");
    println!("  /peers                list connected peers");
    println!("  /connect IP:PORT/ID   connect to a peer");
    println!("  /quit                 exit");
    println!("Anything else is posted to the current forum.");
}

fn format_time(timestamp_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms as i64)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string())
}

fn print_message(message: &Message) {
    println!(
        "[{}] {}: {}",
        format_time(message.timestamp),
        message.author,
        message.body
    );
}

fn print_log(forum: &str, messages: &[Message]) {
    println!("--- {} ({} messages) ---", forum, messages.len());
    for message in messages {
        print_message(message);
    }
}

fn print_event(event: &NodeEvent) {
    match event {
        NodeEvent::Chat(message) => print_message(message),
        NodeEvent::HistoryUpdated { forum, messages } => {
            println!("* history of {} updated ({} messages)", forum, messages.len());
        }
        NodeEvent::DirectoryUpdated { added } => {
            for forum in added {
                println!("* new forum: {}", forum.name);
            }
        }
        NodeEvent::PeerConnected(peer) => println!("* peer {} connected", peer.short()),
        NodeEvent::PeerDisconnected(peer) => println!("* peer {} disconnected", peer.short()),
        NodeEvent::PersistenceWarning { error } => println!("! not saved: {}", error),
    }
}

/// Load the profile, asking for a display name the first time.
async fn load_profile(
    store: &JsonFileStore,
    name: Option<String>,
    lines: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
) -> Result<UserProfile> {
    let existing = store.load_profile().unwrap_or_else(|e| {
        warn!(error = %e, "ignoring unreadable profile");
        None
    });

    let mut profile = match (existing, name) {
        (Some(mut profile), Some(name)) => {
            profile.username = name;
            profile
        }
        (Some(profile), None) => profile,
        (None, Some(name)) => UserProfile::new(name),
        (None, None) => loop {
            println!("Choose a display name:");
            let line = lines
                .next_line()
                .await?
                .context("stdin closed before a name was entered")?;
            let candidate = line.trim();
            if is_valid_author(candidate) {
                break UserProfile::new(candidate);
            }
            println!("Names must be 1 to 30 characters.");
        },
    };

    if !is_valid_author(&profile.username) {
        anyhow::bail!("display name must be 1 to 30 characters");
    }
    profile.username = profile.username.trim().to_string();
    store.save_profile(&profile)?;
    Ok(profile)
}

async fn show_history(node: &Node, forum: &str) {
    if let Err(e) = node.request_history(forum).await {
        println!("! {}", e);
        return;
    }
    time::sleep(HISTORY_WAIT).await;
    print_log(forum, &node.messages(forum).await);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = NodeConfig::default();
    let store = JsonFileStore::open(&args.data_dir)?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut profile = load_profile(&store, args.name.clone(), &mut lines).await?;

    let keypair = Keypair::load_or_generate(&args.data_dir.join("node.key"))?;
    let node = Node::open(
        &args.bind.to_string(),
        keypair,
        Arc::new(store.clone()),
        config.clone(),
    )
    .await?;

    println!("Welcome, {}.", profile.username);
    println!("Listening on {}/{}", node.local_addr()?, node.identity());

    for peer in &args.bootstrap {
        info!("Bootstrapping from {}/{}", peer.addr, &peer.identity[..16]);
        match node.bootstrap(&peer.identity, &peer.addr.to_string()).await {
            Ok(()) => info!("Bootstrap complete"),
            Err(e) => warn!(error = %e, "Bootstrap failed"),
        }
    }

    if let Some(last) = &profile.last_forum {
        println!("Last forum: {} (/join {} to return)", last, last);
    }
    print_help();

    let mut events = node.events().await?;
    let mut sweep = time::interval(config.sweep_interval);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = sweep.tick() => {
                match store.sweep_expired(config.message_ttl) {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "expired message logs removed"),
                    Err(e) => warn!(error = %e, "expiry sweep failed"),
                }
            }
            Some(event) = events.recv() => print_event(&event),
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_line(&line) {
                    ShellCommand::Empty => {}
                    ShellCommand::Help => print_help(),
                    ShellCommand::Quit => break,
                    ShellCommand::Create(name) => match node.create_forum(&name, &profile.id).await {
                        Ok(forum) => println!("* created {} ({})", forum.name, forum.id),
                        Err(e) => println!("! {}", e),
                    },
                    ShellCommand::List => {
                        let forums = node.forums().await;
                        if forums.is_empty() {
                            println!("No forums yet. /create <name> to start one.");
                        }
                        for forum in forums {
                            println!("  {}  (created {})", forum.name, format_time(forum.created_at));
                        }
                    }
                    ShellCommand::Join(name) => match node.join(&name).await {
                        Ok(forum) => {
                            profile.last_forum = Some(forum.name.clone());
                            if let Err(e) = store.save_profile(&profile) {
                                warn!(error = %e, "failed to save profile");
                            }
                            time::sleep(HISTORY_WAIT).await;
                            print_log(&forum.name, &node.messages(&forum.name).await);
                        }
                        Err(e) => println!("! {}", e),
                    },
                    ShellCommand::Leave => match node.leave().await {
                        Some(forum) => println!("* left {}", forum.name),
                        None => println!("Not in a forum."),
                    },
                    ShellCommand::History(name) => {
                        let forum = match name {
                            Some(name) => Some(name),
                            None => node.active_forum().await.map(|f| f.name),
                        };
                        match forum {
                            Some(forum) => show_history(&node, &forum).await,
                            None => println!("Usage: /history <name> (or join a forum first)"),
                        }
                    }
                    ShellCommand::Peers => {
                        let peers = node.peers().await;
                        println!("{} peer(s)", peers.len());
                        for peer in peers {
                            println!("  {}", peer);
                        }
                    }
                    ShellCommand::Connect(target) => match target.parse::<BootstrapPeer>() {
                        Ok(peer) => match node.bootstrap(&peer.identity, &peer.addr.to_string()).await {
                            Ok(()) => println!("* connected to {}", peer.addr),
                            Err(e) => println!("! {:#}", e),
                        },
                        Err(e) => println!("! {:#}", e),
                    },
                    ShellCommand::Post(body) => match node.active_forum().await {
                        Some(forum) => {
                            if let Err(e) = node.post_message(&forum.name, &profile.username, &body).await {
                                println!("! {}", e);
                            }
                        }
                        None => println!("Join a forum first (/list, /join <name>)."),
                    },
                    ShellCommand::Unknown(line) => println!("Unknown command {:?}. /help for help.", line),
                }
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
