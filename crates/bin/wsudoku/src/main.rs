//! wsudoku - headless lobby over an in-process network
//!
//! `simulate` spins up several peers on one [`MemoryHub`], has the first
//! announce a session and the rest discover, join and finish it, then prints
//! the directory as every peer sees it.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use wsudoku_lobby::{
    derive_id, generate_title, Command, JoinState, Lobby, LobbyConfig, LobbyHandle, LobbyRuntime, LobbyView,
    SessionId,
};
use wsudoku_p2p::{MemoryHub, PeerId};

#[derive(Parser, Debug)]
#[command(name = "wsudoku")]
#[command(about = "serverless sudoku lobby", long_about = None)]
struct Args {
    /// Lobby config (TOML, durations in milliseconds)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run several peers through create / join / finish on a local network
    Simulate {
        /// Number of peers, the first one hosts
        #[arg(short, long, default_value = "3")]
        peers: usize,

        /// Session title (random when omitted)
        #[arg(short, long)]
        title: Option<String>,

        /// Override the periodic refresh interval
        #[arg(long)]
        refresh_ms: Option<u64>,

        /// How long to wait for each step
        #[arg(long, default_value = "5000")]
        step_timeout_ms: u64,
    },

    /// Print the session id a title maps to
    DeriveId { title: String },

    /// Print the effective config as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wsudoku=info,wsudoku_lobby=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => LobbyConfig::default(),
    };

    match args.command {
        Cmd::Simulate {
            peers,
            title,
            refresh_ms,
            step_timeout_ms,
        } => {
            if refresh_ms.is_some() {
                config.refresh_interval_ms = refresh_ms;
            }
            config.validate().context("invalid lobby config")?;
            simulate(config, peers, title, Duration::from_millis(step_timeout_ms)).await
        }
        Cmd::DeriveId { title } => {
            let id = derive_id(&title).context("cannot derive session id")?;
            println!("{}", id);
            Ok(())
        }
        Cmd::Config => {
            let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
            print!("{}", rendered);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<LobbyConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config file: {}", path.display()))
}

async fn simulate(config: LobbyConfig, peers: usize, title: Option<String>, step: Duration) -> Result<()> {
    if peers < 2 {
        bail!("need at least two peers, got {}", peers);
    }

    let hub = MemoryHub::new();
    let mut nodes: Vec<(PeerId, LobbyHandle)> = Vec::with_capacity(peers);
    for _ in 0..peers {
        let peer = PeerId::random();
        let (transport, connectivity) = hub.join(peer.clone());
        let lobby = Lobby::new(Arc::new(transport), peer.clone(), config.clone());
        info!(peer = %lobby.local_peer_id().short(), "peer online");
        nodes.push((peer, LobbyRuntime::spawn(lobby, connectivity)));
    }
    for (i, (a, _)) in nodes.iter().enumerate() {
        for (b, _) in &nodes[i + 1..] {
            hub.connect(a, b);
        }
    }

    let (host_id, host) = &nodes[0];
    wait(host, step, "host connectivity", |v| v.connected_peers > 0).await?;

    let title = title.unwrap_or_else(|| generate_title(&mut rand::thread_rng()));
    let session_id = host.create(&title, puzzle()).await?;
    wait(host, step, "session announcement", |v| v.snapshot.get(&session_id).is_some()).await?;
    info!(host = %host_id.short(), session = %session_id.short(), %title, "session hosted");

    for (peer, guest) in &nodes[1..] {
        guest.send(Command::Refresh).await?;
        wait(guest, step, "discovery", |v| v.snapshot.get(&session_id).is_some()).await?;
        guest.send(Command::Join(session_id.clone())).await?;
        let view = wait(guest, step, "join", |v| joined_or_timed_out(v, &session_id)).await?;
        match view.join_attempt(&session_id).map(|a| &a.state) {
            Some(JoinState::Confirmed) => info!(peer = %peer.short(), "joined"),
            _ => warn!(peer = %peer.short(), "join not confirmed"),
        }
        guest.send(Command::Finish(session_id.clone())).await?;
    }

    host.send(Command::Refresh).await?;
    let expected = nodes.len() - 1;
    let view = wait(host, step, "finishes", |v| {
        v.snapshot
            .get(&session_id)
            .map_or(false, |s| s.participants.iter().filter(|p| p.finished).count() == expected)
    })
    .await?;
    print_directory(&view);

    for (_, handle) in nodes {
        handle.shutdown().await?;
    }
    Ok(())
}

fn joined_or_timed_out(view: &LobbyView, session_id: &SessionId) -> bool {
    matches!(
        view.join_attempt(session_id).map(|a| &a.state),
        Some(JoinState::Confirmed) | Some(JoinState::TimedOut)
    )
}

async fn wait<F>(handle: &LobbyHandle, step: Duration, what: &str, f: F) -> Result<LobbyView>
where
    F: FnMut(&LobbyView) -> bool,
{
    let view = tokio::time::timeout(step, handle.wait_for(f))
        .await
        .with_context(|| format!("timed out waiting for {}", what))??;
    Ok(view)
}

/// Opaque stand-in for a generated puzzle
fn puzzle() -> Vec<u8> {
    let mut grid = vec![0u8; 81];
    rand::thread_rng().fill_bytes(&mut grid);
    grid.iter_mut().for_each(|c| *c %= 10);
    grid
}

fn print_directory(view: &LobbyView) {
    println!("{}", view.status);
    for (id, session) in &view.snapshot.sessions {
        println!("\n{}  ({})", session.label(), id.short());
        for p in &session.participants {
            println!(
                "  {:<10} joined {:>16}  {}{}",
                p.peer_id.short(),
                p.joined_at,
                if p.is_admin { "admin " } else { "" },
                if p.finished { "finished" } else { "playing" },
            );
        }
    }
}
