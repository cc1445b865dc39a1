//! Phase sequencer: the top-level state machine driving a session.
//!
//! Bootstrap ingests the roster, Init replays the server's one-way
//! setup messages, Turn runs deadline-bounded rounds, Terminated releases
//! everything. Fatal errors stop the session at the current phase
//! boundary; per-client failures never do.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};

use crate::collect;
use crate::protocol::{
    encode_sentinel, encode_view, ControlChannel, ProtocolError, RosterEntry, ServerCommand,
    END_GAME, END_INIT, MAX_LINE_LEN,
};
use crate::registry::{ClientRegistry, RegistryError};
use crate::router::{self, RouteError};
use crate::transport::ClientChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Bootstrap,
    Init,
    Turn,
    Terminated,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("protocol violation: {0}")]
    Violation(String),
    #[error("invalid round deadline: {0}")]
    InvalidDeadline(f64),
    #[error("invalid processing delay: {0}")]
    InvalidDelay(f64),
}

pub struct Sequencer {
    control: ControlChannel,
    registry: Option<ClientRegistry>,
    phase: Phase,
    round: u64,
}

impl Sequencer {
    pub fn new(control: ControlChannel) -> Self {
        Self {
            control,
            registry: None,
            phase: Phase::Bootstrap,
            round: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Bootstrap step one: the first control line must be the roster.
    /// Returns the ingested entries so the transport can admit those
    /// clients.
    pub async fn ingest_roster(&mut self) -> Result<Vec<RosterEntry>, SessionError> {
        if self.phase != Phase::Bootstrap {
            return Err(SessionError::Violation("roster already ingested".into()));
        }

        let value = self.control.next_value().await?;
        let Some(clients) = value.get("clients") else {
            return Err(SessionError::Violation(format!(
                "received a message before the roster: {}",
                value
            )));
        };
        let roster: Vec<RosterEntry> = serde_json::from_value(clients.clone())
            .map_err(|e| RegistryError::MalformedRoster(e.to_string()))?;

        let registry = ClientRegistry::ingest(&roster)?;
        tracing::info!("Roster ingested: {} clients", registry.len());
        self.registry = Some(registry);
        Ok(roster)
    }

    /// Bootstrap step two: attach the connected client channels,
    /// completing the transition to Init.
    pub fn attach_channels(
        &mut self,
        channels: HashMap<String, ClientChannel>,
    ) -> Result<(), SessionError> {
        match (self.phase, self.registry.as_mut()) {
            (Phase::Bootstrap, Some(registry)) => {
                registry.attach_channels(channels);
                self.phase = Phase::Init;
                Ok(())
            }
            _ => Err(SessionError::Violation(
                "channels attached out of phase".into(),
            )),
        }
    }

    /// Drive the session from Init to Terminated. Resources are released
    /// exactly once, whether the session ends with the end-of-game
    /// sentinel or a fatal error.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        let result = self.drive().await;
        if let Err(e) = &result {
            tracing::error!("Session aborted in {:?} phase: {}", self.phase, e);
        }
        if let Some(registry) = self.registry.as_mut() {
            registry.release_all();
        }
        self.phase = Phase::Terminated;
        result
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        loop {
            match self.phase {
                Phase::Init => self.init_step().await?,
                Phase::Turn => self.turn_step().await?,
                Phase::Terminated => return Ok(()),
                Phase::Bootstrap => {
                    return Err(SessionError::Violation(
                        "run() before bootstrap completed".into(),
                    ))
                }
            }
        }
    }

    /// One Init instruction: a one-way addressed message followed by its
    /// advisory processing delay. No response is ever read here.
    async fn init_step(&mut self) -> Result<(), SessionError> {
        let Some(registry) = self.registry.as_mut() else {
            return Err(SessionError::Violation("no registry".into()));
        };

        match self.control.next_command().await? {
            ServerCommand::Dispatch { message, seconds } => {
                // try_from rejects negative, non-finite, and delays too
                // large for a Duration.
                let Ok(delay) = Duration::try_from_secs_f64(seconds) else {
                    return Err(SessionError::InvalidDelay(seconds));
                };
                let sends = router::resolve(&message, &registry.active_clients())?;
                let failed = dispatch(registry, &sends, seconds)?;
                for identity in failed {
                    registry.mark_disconnected(&identity);
                }
                tracing::debug!(
                    "Init message sent to {} clients, processing delay {}s",
                    sends.len(),
                    seconds
                );
                tokio::time::sleep(delay).await;
            }
            ServerCommand::EndInit => {
                broadcast_sentinel(registry, END_INIT);
                tracing::info!("Init phase complete");
                self.phase = Phase::Turn;
            }
            ServerCommand::EndGame => {
                return Err(SessionError::Violation(
                    "end-of-game sentinel during init".into(),
                ));
            }
        }
        Ok(())
    }

    /// One Turn round: addressed message, deadline, bounded collection,
    /// result reported back to the game server.
    async fn turn_step(&mut self) -> Result<(), SessionError> {
        let Some(registry) = self.registry.as_mut() else {
            return Err(SessionError::Violation("no registry".into()));
        };

        match self.control.next_command().await? {
            ServerCommand::Dispatch { message, seconds } => {
                // A bad deadline is a server programming error. Abort
                // before anything is sent. Deadlines too large for a
                // Duration are rejected here too, not just non-positive
                // and non-finite ones.
                let deadline = match Duration::try_from_secs_f64(seconds) {
                    Ok(d) if seconds > 0.0 => d,
                    _ => return Err(SessionError::InvalidDeadline(seconds)),
                };

                let sends = router::resolve(&message, &registry.active_clients())?;
                let expected: Vec<String> = sends.iter().map(|(id, _)| id.clone()).collect();

                self.round += 1;
                collect::drain_stale(registry, &expected);
                let failed = dispatch(registry, &sends, seconds)?;
                if !failed.is_empty() {
                    // The collector will see these as closed channels.
                    tracing::debug!("Send failed for {} clients this round", failed.len());
                }
                let due = Instant::now() + deadline;
                tracing::info!(
                    "Round {}: {} clients expected, deadline {}s",
                    self.round,
                    expected.len(),
                    seconds
                );

                let outcome = collect::collect(registry, &expected, due).await;
                self.control.send_value(&outcome.result.to_value()).await?;
                for identity in outcome.hung_up {
                    registry.mark_disconnected(&identity);
                }
            }
            ServerCommand::EndGame => {
                broadcast_sentinel(registry, END_GAME);
                tracing::info!("Game over after {} rounds", self.round);
                self.phase = Phase::Terminated;
            }
            ServerCommand::EndInit => {
                return Err(SessionError::Violation(
                    "end-of-init sentinel during turn phase".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Send the resolved per-client views. Returns the identities whose
/// transport rejected the send.
fn dispatch(
    registry: &ClientRegistry,
    sends: &[(String, serde_json::Value)],
    seconds: f64,
) -> Result<Vec<String>, SessionError> {
    let mut failed = Vec::new();
    for (identity, payload) in sends {
        let line = encode_view(payload, seconds);
        let chars = line.chars().count();
        if chars > MAX_LINE_LEN {
            return Err(ProtocolError::Oversize(chars).into());
        }
        if registry.send_line(identity, line).is_err() {
            tracing::warn!("Send to client {} failed", identity);
            failed.push(identity.clone());
        }
    }
    Ok(failed)
}

/// Forward a phase sentinel verbatim to every active client.
fn broadcast_sentinel(registry: &mut ClientRegistry, sentinel: &str) {
    let line = encode_sentinel(sentinel);
    let mut failed = Vec::new();
    for client in registry.active_clients() {
        if registry.send_line(&client.identity, line.clone()).is_err() {
            failed.push(client.identity.clone());
        }
    }
    for identity in failed {
        registry.mark_disconnected(&identity);
    }
}
