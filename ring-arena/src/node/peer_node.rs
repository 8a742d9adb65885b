/// Peer node: owns the background loops and turns commands into events
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::builder::NodeBuilder;
use super::context::NodeContext;
use super::types::{NodeCommand, NodeEvent, StepResult};
use crate::config::NodeConfig;
use crate::directory::NeighborTable;
use crate::error::{ArenaError, Result};
use crate::session::{SessionEvent, SessionSnapshot};
use crate::stats::NodeStats;
use crate::types::{GameId, PeerDescriptor, PeerId};

/// A running peer: ring member, flood relay and game host/guest
///
/// Nodes are autonomous; there is no coordinator and each one only knows
/// its neighbors and the peers it has talked to.
pub struct PeerNode {
    context: Arc<NodeContext>,

    /// Receiver for commands from the application
    command_rx: flume::Receiver<NodeCommand>,

    /// Sender for commands from the application
    command_tx: flume::Sender<NodeCommand>,

    /// Session activity, produced by the RPC handlers and local moves
    session_rx: flume::Receiver<SessionEvent>,

    /// Results of finished command tasks
    event_tx: flume::Sender<NodeEvent>,
    event_rx: flume::Receiver<NodeEvent>,

    /// Broadcast receiver and RPC accept loop
    tasks: Vec<JoinHandle<()>>,

    /// Neighbor table revision last reported through `step`
    last_revision: u64,

    stopped: bool,
}

impl PeerNode {
    /// Start configuring a node; `.await` the builder to bind and start it
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    pub(crate) fn new_internal(
        context: Arc<NodeContext>,
        session_rx: flume::Receiver<SessionEvent>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        let (command_tx, command_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        tracing::info!("Node '{}' started as {}", context.directory.local_id(), context.directory.local());
        Self {
            context,
            command_rx,
            command_tx,
            session_rx,
            event_tx,
            event_rx,
            tasks,
            last_revision: 0,
            stopped: false,
        }
    }

    pub fn id(&self) -> &PeerId {
        self.context.directory.local_id()
    }

    pub fn descriptor(&self) -> &PeerDescriptor {
        self.context.directory.local()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.context.config
    }

    /// Current neighbor table
    pub fn neighbors(&self) -> NeighborTable {
        self.context.directory.snapshot()
    }

    /// Peers learned from replies, invites and ring notifications
    pub fn known_peers(&self) -> Vec<PeerDescriptor> {
        self.context.directory.known_peers()
    }

    pub fn snapshot(&self, game_id: &GameId) -> Option<SessionSnapshot> {
        self.context.sessions.snapshot(game_id)
    }

    /// Every session this node takes part in
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.context.sessions.snapshots()
    }

    /// Get a sender for sending commands to this node
    pub fn sender(&self) -> flume::Sender<NodeCommand> {
        self.command_tx.clone()
    }

    /// Run one command to completion on the caller's task
    ///
    /// `step` does the same for commands sent through [`PeerNode::sender`],
    /// on a task of their own.
    pub async fn execute(&self, command: NodeCommand) -> Result<Option<NodeEvent>> {
        execute(&self.context, command).await
    }

    /// Wait for the next thing worth reporting
    ///
    /// Commands received meanwhile are started in the background. Returns when:
    /// - the neighbor table changed, a session moved or a command finished (Event)
    /// - the step timeout (configured in NodeConfig) elapses (Timeout)
    /// - a Stop command is received (Stop)
    pub async fn step(&mut self) -> Result<StepResult> {
        if self.stopped {
            return Ok(StepResult::Stop);
        }
        let commands = self.command_rx.clone();
        let sessions = self.session_rx.clone();
        let events = self.event_rx.clone();
        let poll = Duration::from_millis(self.context.config.poll_interval_ms.max(1));
        let timeout = tokio::time::sleep(Duration::from_millis(self.context.config.step_timeout_ms));
        tokio::pin!(timeout);

        loop {
            let table = self.context.directory.snapshot();
            if table.revision() != self.last_revision {
                self.last_revision = table.revision();
                return Ok(StepResult::Event(NodeEvent::NeighborsChanged(table)));
            }
            tokio::select! {
                _ = &mut timeout => return Ok(StepResult::Timeout),
                command = commands.recv_async() => match command {
                    Ok(NodeCommand::Stop) | Err(_) => {
                        self.leave().await;
                        return Ok(StepResult::Stop);
                    }
                    Ok(command) => self.spawn_command(command),
                },
                event = sessions.recv_async() => {
                    let event = event.map_err(|_| ArenaError::Internal("session events closed".to_string()))?;
                    return Ok(StepResult::Event(NodeEvent::Session(event)));
                }
                event = events.recv_async() => {
                    let event = event.map_err(|_| ArenaError::Internal("node events closed".to_string()))?;
                    return Ok(StepResult::Event(event));
                }
                // neighbor changes have no channel of their own
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    fn spawn_command(&self, command: NodeCommand) {
        let context = self.context.clone();
        let events = self.event_tx.clone();
        tracing::debug!("Node '{}' running command '{}'", self.id(), command.name());
        tokio::spawn(async move {
            let name = command.name();
            let event = match execute(&context, command).await {
                Ok(Some(event)) => event,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!("Node '{}' command '{}' failed: {}", context.directory.local_id(), name, e);
                    NodeEvent::CommandFailed {
                        command: name,
                        error: e.to_string(),
                    }
                }
            };
            let _ = events.send(event);
        });
    }

    /// Re-link our neighbors to each other and stop the background loops
    pub async fn leave(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.context.ring.leave().await;
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.context.gateway.shutdown();
    }

    /// Get current node statistics
    pub fn stats(&self) -> NodeStats {
        self.context.stats.get_stats()
    }

    /// Reset node statistics
    pub fn reset_stats(&self) {
        self.context.stats.reset();
    }
}

impl Drop for PeerNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Descriptor of `id`, from the local cache or else from a lookup flood
async fn resolve(context: &NodeContext, id: &PeerId) -> Result<PeerDescriptor> {
    if let Some(peer) = context.directory.find(id) {
        return Ok(peer);
    }
    context
        .lookup_peer(id)
        .await
        .ok_or_else(|| ArenaError::Timeout(format!("peer '{}' did not answer", id)))
}

async fn execute(context: &NodeContext, command: NodeCommand) -> Result<Option<NodeEvent>> {
    let sessions = &context.sessions;
    match command {
        NodeCommand::Join => {
            context.ring.join(&context.broadcast).await;
            Ok(None)
        }
        NodeCommand::LookupPeer(id) => {
            let peer = context.lookup_peer(&id).await;
            Ok(Some(NodeEvent::PeerFound { id, peer }))
        }
        NodeCommand::LookupGame(game_id) => {
            let game = context.lookup_game(&game_id).await;
            Ok(Some(NodeEvent::GameFound { game_id, game }))
        }
        NodeCommand::OnlinePeers => Ok(Some(NodeEvent::OnlinePeers(context.online_peers().await))),
        NodeCommand::Invite { peer, board_size, komi } => {
            let opponent = resolve(context, &peer).await?;
            let game_id = sessions.propose(&opponent, board_size, komi).await?;
            Ok(Some(NodeEvent::GameProposed { game_id, opponent: peer }))
        }
        NodeCommand::InviteAi { board_size, komi } => {
            let game_id = sessions.propose_ai(board_size, komi)?;
            Ok(Some(NodeEvent::GameProposed {
                game_id,
                opponent: PeerId::ai(),
            }))
        }
        NodeCommand::Accept(game_id) => sessions.accept(&game_id).await.map(|_| None),
        NodeCommand::Decline(game_id) => sessions.decline(&game_id).await.map(|_| None),
        NodeCommand::CancelInvite(game_id) => sessions.cancel_invite(&game_id).await.map(|_| None),
        NodeCommand::Play { game_id, x, y } => sessions.play(&game_id, x, y).await.map(|_| None),
        NodeCommand::Pass(game_id) => sessions.pass(&game_id).await.map(|_| None),
        NodeCommand::Pause(game_id) => sessions.pause(&game_id).await.map(|_| None),
        NodeCommand::Surrender(game_id) => sessions.surrender(&game_id).await.map(|_| None),
        NodeCommand::Reconnect(game_id) => {
            match sessions.reconnect(&game_id).await {
                Err(e) if e.is_transport() => {
                    // after a restart only the opponent's id is known
                    let snapshot = sessions.snapshot(&game_id).ok_or(e)?;
                    let local = context.directory.local_id();
                    let opponent = if &snapshot.black == local {
                        snapshot.white
                    } else {
                        snapshot.black
                    };
                    resolve(context, &opponent).await?;
                    sessions.reconnect(&game_id).await?;
                }
                other => other?,
            }
            Ok(None)
        }
        NodeCommand::Chat { game_id, text } => sessions.chat(&game_id, text).await.map(|_| None),
        NodeCommand::History { peer: None, limit } => Ok(Some(NodeEvent::History(sessions.history(limit)?))),
        NodeCommand::History { peer: Some(id), limit } => {
            let peer = resolve(context, &id).await?;
            let records = context.gateway.get_game_history(&peer, limit).await?;
            Ok(Some(NodeEvent::History(records)))
        }
        NodeCommand::Stop => {
            context.ring.leave().await;
            Ok(None)
        }
    }
}
