//! Deadline-bounded response collection: the fan-in half of a turn round.
//!
//! Given that the round's outbound views have already been handed to the
//! transport, [`collect`] awaits up to one response per expected client
//! and returns no later than the round deadline, whatever the clients do.
//! Slow, silent, dead, and garbage-emitting clients are all contained to
//! their own result slot.

use std::collections::HashMap;
use std::future::poll_fn;
use std::task::Poll;

use tokio::time::Instant;

use crate::protocol::{MAX_LINE_LEN, NO_ANSWER};
use crate::registry::ClientRegistry;

/// A single client's result slot for one round.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Payload(serde_json::Value),
    NoAnswer,
}

impl Answer {
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Answer::Payload(v) => v.clone(),
            Answer::NoAnswer => serde_json::Value::String(NO_ANSWER.into()),
        }
    }
}

/// One completed round: exactly one answer per expected client, in the
/// round's emission order.
#[derive(Debug)]
pub struct RoundResult {
    entries: Vec<(String, Answer)>,
}

impl RoundResult {
    pub fn get(&self, identity: &str) -> Option<&Answer> {
        self.entries
            .iter()
            .find(|(id, _)| id == identity)
            .map(|(_, answer)| answer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire form reported back to the game server.
    pub fn to_value(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (identity, answer) in &self.entries {
            map.insert(identity.clone(), answer.to_value());
        }
        serde_json::Value::Object(map)
    }
}

/// Outcome of one round: the result set, plus the clients whose transport
/// closed mid-round. The registry is only mutated after the round closes,
/// so disconnects are reported here instead of applied in place.
#[derive(Debug)]
pub struct RoundOutcome {
    pub result: RoundResult,
    pub hung_up: Vec<String>,
}

/// Discard lines queued from outside any round, so a late response can
/// never be recorded against a later round. The sequencer calls this
/// before a round's sends go out; [`collect`] calls it again when the
/// round closes.
pub fn drain_stale(registry: &mut ClientRegistry, identities: &[String]) {
    for (identity, inbox) in registry.inboxes_mut(identities) {
        while let Ok(line) = inbox.try_recv() {
            tracing::debug!("Discarding out-of-round line from {}: {}", identity, line);
        }
    }
}

/// Await up to one response per expected client, returning no later than
/// `due`.
///
/// The expected clients' inbound receivers are multiplexed by readiness in
/// a single flow raced against one `sleep_until`: a hard deadline, not a
/// polling interval. The first line from a client fills its slot; a line
/// that fails to parse, or exceeds the size bound, fills it with
/// [`Answer::NoAnswer`]; a closed channel does the same and reports the
/// client in `hung_up`. Clients without a slot when the deadline fires get
/// [`Answer::NoAnswer`].
pub async fn collect(
    registry: &mut ClientRegistry,
    expected: &[String],
    due: Instant,
) -> RoundOutcome {
    let mut answers: HashMap<String, Answer> = HashMap::with_capacity(expected.len());
    let mut hung_up = Vec::new();

    {
        let mut pending = registry.inboxes_mut(expected);
        let sleep = tokio::time::sleep_until(due);
        tokio::pin!(sleep);

        while !pending.is_empty() {
            // Resolves with the first pending client that has a line (or a
            // closed channel); registers a waker with every one of them.
            let next = poll_fn(|cx| {
                for (index, (_, inbox)) in pending.iter_mut().enumerate() {
                    if let Poll::Ready(line) = inbox.poll_recv(cx) {
                        return Poll::Ready((index, line));
                    }
                }
                Poll::Pending
            });

            tokio::select! {
                _ = &mut sleep => {
                    tracing::debug!("Round deadline elapsed with {} clients pending", pending.len());
                    break;
                }
                (index, line) = next => {
                    let (identity, _) = pending.swap_remove(index);
                    match line {
                        Some(line) => {
                            answers.insert(identity.clone(), parse_answer(&identity, &line));
                        }
                        None => {
                            // Transport gone mid-round: same as a timeout
                            // for this client.
                            tracing::warn!("Client {} transport closed mid-round", identity);
                            hung_up.push(identity);
                        }
                    }
                }
            }
        }
    }

    // Whatever is still queued now belongs to no round.
    drain_stale(registry, expected);

    let entries = expected
        .iter()
        .map(|identity| {
            let answer = answers.remove(identity).unwrap_or(Answer::NoAnswer);
            (identity.clone(), answer)
        })
        .collect();

    RoundOutcome {
        result: RoundResult { entries },
        hung_up,
    }
}

fn parse_answer(identity: &str, line: &str) -> Answer {
    let chars = line.chars().count();
    if chars > MAX_LINE_LEN {
        tracing::warn!("Client {} sent an oversize line ({} chars)", identity, chars);
        return Answer::NoAnswer;
    }
    match serde_json::from_str(line) {
        Ok(value) => Answer::Payload(value),
        Err(e) => {
            tracing::warn!("Client {} sent an unparseable line: {}", identity, e);
            Answer::NoAnswer
        }
    }
}
