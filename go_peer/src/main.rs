mod commands;
mod render;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use clap::Parser;
use console::{style, Term};
use ring_arena::{NeighborRole, NodeCommand, NodeConfig, NodeEvent, PeerNode, SessionEvent, StepResult};
use tracing_subscriber::EnvFilter;

use commands::{parse_line, Input, Selection, HELP};
use render::render_board;

/// go_peer - serverless go between peers on a ring
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Display name
    #[arg(short, long)]
    name: Option<String>,

    /// Fixed peer id (persisted or generated if omitted)
    #[arg(long)]
    id: Option<String>,

    /// Address to bind and advertise to other peers
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// TCP port of the RPC endpoint (0 picks a free one)
    #[arg(long)]
    rpc_port: Option<u16>,

    /// UDP port shared by every peer for floods
    #[arg(long)]
    broadcast_port: Option<u16>,

    /// Seed peer address used until the node has neighbors (repeatable)
    #[arg(long)]
    bootstrap: Vec<IpAddr>,

    /// Hop budget of the floods this node originates
    #[arg(long)]
    ttl: Option<u32>,

    /// Directory for identity, paused games and history
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Path to a JSON node config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    /// Config file (or defaults) overridden by the command line
    fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_file(path)?,
            None => NodeConfig::default(),
        };
        if let Some(name) = &self.name {
            config = config.with_node_name(name.clone());
        }
        if let Some(id) = &self.id {
            config = config.with_node_id(id.clone());
        }
        if let Some(bind) = self.bind {
            config = config.with_bind_address(bind);
        }
        if let Some(port) = self.rpc_port {
            config = config.with_rpc_port(port);
        }
        if let Some(port) = self.broadcast_port {
            config = config.with_broadcast_port(port);
        }
        for seed in &self.bootstrap {
            config = config.with_bootstrap(*seed);
        }
        if let Some(ttl) = self.ttl {
            config = config.with_default_ttl(ttl);
        }
        if let Some(dir) = &self.storage {
            config = config.with_storage_dir(dir.clone());
        }
        Ok(config)
    }
}

fn lock(selection: &Mutex<Selection>) -> MutexGuard<'_, Selection> {
    match selection.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Logs go to stderr so they do not interleave with the console
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let config = args.node_config()?;
    let mut node = PeerNode::builder(config).step_timeout_ms(200).await?;

    let term = Term::stdout();
    term.write_line("=== go_peer - ring arena go ===")?;
    term.write_line(&format!("Peer: {}", node.descriptor()))?;
    term.write_line("Commands:")?;
    for line in HELP {
        term.write_line(&format!("  {}", line))?;
    }
    term.write_line("")?;

    let selection = Arc::new(Mutex::new(Selection::default()));
    let (local_tx, local_rx) = flume::unbounded::<Input>();

    // Spawn the console reader with its own term
    let node_sender = node.sender();
    let reader_selection = selection.clone();
    let reader_task = tokio::task::spawn_blocking(move || {
        let input_term = Term::stdout();
        loop {
            let line = match input_term.read_line() {
                Ok(line) => line,
                Err(_) => {
                    let _ = node_sender.send(NodeCommand::Stop);
                    break;
                }
            };
            let parsed = parse_line(&line, &lock(&reader_selection));
            match parsed {
                Ok(None) => {}
                Ok(Some(Input::Node(command))) => {
                    if node_sender.send(command).is_err() {
                        break;
                    }
                }
                Ok(Some(Input::Quit)) => {
                    let _ = node_sender.send(NodeCommand::Stop);
                    break;
                }
                Ok(Some(other)) => {
                    if local_tx.send(other).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = input_term.write_line(&style(format!("! {}", e)).red().to_string());
                }
            }
        }
    });

    // Main step loop - reports node events and serves local commands
    loop {
        let result = node.step().await?;
        for input in local_rx.try_iter() {
            run_local(&term, &node, input)?;
        }
        match result {
            StepResult::Stop => {
                term.write_line("Left the ring")?;
                break;
            }
            StepResult::Timeout => {}
            StepResult::Event(event) => report(&term, &node, &selection, event)?,
        }
    }

    reader_task.abort();
    Ok(())
}

fn run_local(term: &Term, node: &PeerNode, input: Input) -> anyhow::Result<()> {
    match input {
        Input::Board(game_id) => match node.snapshot(&game_id) {
            Some(snapshot) => {
                for line in render_board(&snapshot, node.id()) {
                    term.write_line(&line)?;
                }
            }
            None => term.write_line(&style(format!("! no game '{}'", game_id)).red().to_string())?,
        },
        Input::Stats => term.write_line(&format!("{}", node.stats()))?,
        Input::Help => {
            for line in HELP {
                term.write_line(&format!("  {}", line))?;
            }
        }
        Input::Node(_) | Input::Quit => {}
    }
    Ok(())
}

fn show_board(term: &Term, node: &PeerNode, game_id: &ring_arena::GameId) -> anyhow::Result<()> {
    if let Some(snapshot) = node.snapshot(game_id) {
        for line in render_board(&snapshot, node.id()) {
            term.write_line(&line)?;
        }
    }
    Ok(())
}

fn report(term: &Term, node: &PeerNode, selection: &Mutex<Selection>, event: NodeEvent) -> anyhow::Result<()> {
    match event {
        NodeEvent::NeighborsChanged(table) => {
            let slots: Vec<String> = NeighborRole::ALL
                .iter()
                .map(|role| match table.get(*role) {
                    Some(peer) => format!("{:?}={}", role, peer.name),
                    None => format!("{:?}=-", role),
                })
                .collect();
            term.write_line(&style(format!("ring: {}", slots.join(" "))).dim().to_string())?;
        }
        NodeEvent::PeerFound { id, peer: Some(peer) } => term.write_line(&format!("found {}: {}", id, peer))?,
        NodeEvent::PeerFound { id, peer: None } => term.write_line(&format!("nobody answered for {}", id))?,
        NodeEvent::GameFound { game_id, game: Some(game) } => term.write_line(&format!(
            "game {} hosted by {} ({}x{}, komi {}, {})",
            game_id, game.host.name, game.board_size, game.board_size, game.komi, game.state
        ))?,
        NodeEvent::GameFound { game_id, game: None } => {
            term.write_line(&format!("no open game {}", game_id))?
        }
        NodeEvent::OnlinePeers(peers) => {
            term.write_line(&format!("{} peer(s) online", peers.len()))?;
            for peer in peers {
                term.write_line(&format!("  {}", peer))?;
            }
        }
        NodeEvent::GameProposed { game_id, opponent } => {
            term.write_line(&format!("game {} proposed to {}", game_id, opponent))?;
            lock(selection).current = Some(game_id);
        }
        NodeEvent::History(records) => {
            if records.is_empty() {
                term.write_line("no finished games")?;
            }
            for record in records {
                let winner = record.winner.map(|w| w.to_string()).unwrap_or_else(|| "draw".to_string());
                term.write_line(&format!(
                    "  {}  {} vs {}  {}x{}  {} moves  winner: {}",
                    record.game_id, record.black, record.white, record.board_size, record.board_size, record.move_count, winner
                ))?;
            }
        }
        NodeEvent::CommandFailed { command, error } => {
            term.write_line(&style(format!("! {} failed: {}", command, error)).red().to_string())?
        }
        NodeEvent::Session(event) => report_session(term, node, selection, event)?,
    }
    Ok(())
}

fn report_session(term: &Term, node: &PeerNode, selection: &Mutex<Selection>, event: SessionEvent) -> anyhow::Result<()> {
    match event {
        SessionEvent::Invited { from, snapshot } => {
            term.write_line(
                &style(format!(
                    "{} invites you to a {}x{} game (komi {}), 'accept' or 'decline'",
                    from.name, snapshot.board_size, snapshot.board_size, snapshot.komi
                ))
                .yellow()
                .to_string(),
            )?;
            lock(selection).invite = Some(snapshot.game_id);
        }
        SessionEvent::InviteCancelled { game_id } => term.write_line(&format!("invite {} withdrawn", game_id))?,
        SessionEvent::InviteDeclined { game_id, by } => {
            term.write_line(&format!("{} declined game {}", by, game_id))?
        }
        SessionEvent::Started { game_id } => {
            term.write_line(&style(format!("game {} started", game_id)).green().to_string())?;
            show_board(term, node, &game_id)?;
            lock(selection).current = Some(game_id);
        }
        SessionEvent::MoveApplied { game_id, by, mv, seq } => {
            term.write_line(&format!("#{} {} by {}", seq, mv, by))?;
            show_board(term, node, &game_id)?;
        }
        SessionEvent::MoveAcked { game_id, seq } => {
            tracing::debug!("move {} of {} acknowledged", seq, game_id);
        }
        SessionEvent::Paused { game_id, who, reason } => {
            term.write_line(&format!("game {} paused by {} ({:?}), 'reconnect' to resume", game_id, who, reason))?
        }
        SessionEvent::Resumed {
            game_id,
            version,
            synchronized,
            ..
        } => {
            term.write_line(&format!(
                "game {} resumed at move {}{}",
                game_id,
                version,
                if synchronized { "" } else { " (waiting for the other side)" }
            ))?;
            show_board(term, node, &game_id)?;
            lock(selection).current = Some(game_id);
        }
        SessionEvent::Finished { game_id, winner, score } => {
            let winner = winner.map(|w| w.to_string()).unwrap_or_else(|| "nobody".to_string());
            let score = score
                .map(|s| format!(" (black {} / white {})", s.black, s.white))
                .unwrap_or_default();
            term.write_line(&style(format!("game {} over, winner {}{}", game_id, winner, score)).green().to_string())?;
            let mut selection = lock(selection);
            if selection.current.as_ref() == Some(&game_id) {
                selection.current = None;
            }
        }
        SessionEvent::Chat { sender, text, .. } => {
            term.write_line(&style(format!("<{}> {}", sender, text)).cyan().to_string())?
        }
    }
    Ok(())
}
