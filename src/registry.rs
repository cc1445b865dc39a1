//! Client registry: the roster of known client identities and their
//! transport handles.
//!
//! Built once from the roster message at session start; after that the
//! only permitted mutation is marking a client disconnected, which is
//! permanent for the session.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::protocol::{RosterEntry, BROADCAST};
use crate::transport::{ChannelClosed, ClientChannel};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("malformed roster: {0}")]
    MalformedRoster(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    Disconnected,
}

pub struct ClientRecord {
    pub identity: String,
    pub name: String,
    pub liveness: Liveness,
    pub(crate) channel: Option<ClientChannel>,
}

pub struct ClientRegistry {
    /// Roster order, fixing the deterministic send order.
    order: Vec<String>,
    records: HashMap<String, ClientRecord>,
}

impl ClientRegistry {
    /// Build the registry from the ingested roster. This is the only place
    /// clients are ever added.
    pub fn ingest(roster: &[RosterEntry]) -> Result<Self, RegistryError> {
        if roster.is_empty() {
            return Err(RegistryError::MalformedRoster("no clients".into()));
        }

        let mut order = Vec::with_capacity(roster.len());
        let mut records = HashMap::with_capacity(roster.len());
        for entry in roster {
            if entry.id == BROADCAST {
                return Err(RegistryError::MalformedRoster(
                    "empty client id is reserved for broadcast".into(),
                ));
            }
            if records.contains_key(&entry.id) {
                return Err(RegistryError::MalformedRoster(format!(
                    "duplicate client id: {}",
                    entry.id
                )));
            }
            order.push(entry.id.clone());
            records.insert(
                entry.id.clone(),
                ClientRecord {
                    identity: entry.id.clone(),
                    name: entry.name.clone(),
                    liveness: Liveness::Active,
                    channel: None,
                },
            );
        }

        Ok(Self { order, records })
    }

    /// Attach transport channels once the clients have connected. Roster
    /// clients without a channel start out Disconnected.
    pub fn attach_channels(&mut self, mut channels: HashMap<String, ClientChannel>) {
        for (id, record) in &mut self.records {
            match channels.remove(id) {
                Some(channel) => record.channel = Some(channel),
                None => {
                    tracing::warn!("Client {} ({}) has no transport", id, record.name);
                    record.liveness = Liveness::Disconnected;
                }
            }
        }
    }

    /// Mark a client disconnected and drop its transport handle. Idempotent.
    pub fn mark_disconnected(&mut self, identity: &str) {
        if let Some(record) = self.records.get_mut(identity) {
            if record.liveness == Liveness::Active {
                tracing::info!("Client {} ({}) disconnected", identity, record.name);
            }
            record.liveness = Liveness::Disconnected;
            record.channel = None;
        }
    }

    /// Active clients in roster order.
    pub fn active_clients(&self) -> Vec<&ClientRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.liveness == Liveness::Active)
            .collect()
    }

    pub fn is_active(&self, identity: &str) -> bool {
        self.records
            .get(identity)
            .is_some_and(|r| r.liveness == Liveness::Active)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Queue one line to a client. Fails if the client has no live transport.
    pub fn send_line(&self, identity: &str, line: String) -> Result<(), ChannelClosed> {
        match self.records.get(identity).and_then(|r| r.channel.as_ref()) {
            Some(channel) => channel.send(line),
            None => Err(ChannelClosed),
        }
    }

    /// Mutable inbound receivers for the given clients, for the collector.
    pub(crate) fn inboxes_mut(
        &mut self,
        identities: &[String],
    ) -> Vec<(String, &mut mpsc::UnboundedReceiver<String>)> {
        self.records
            .iter_mut()
            .filter(|(id, _)| identities.contains(*id))
            .filter_map(|(id, record)| {
                record.channel.as_mut().map(|c| (id.clone(), &mut c.inbound))
            })
            .collect()
    }

    /// Drop every transport handle. Called exactly once at session teardown.
    pub fn release_all(&mut self) {
        for record in self.records.values_mut() {
            record.channel = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(ids: &[(&str, &str)]) -> Vec<RosterEntry> {
        let value = serde_json::Value::Array(
            ids.iter()
                .map(|(id, name)| serde_json::json!({"id": id, "name": name}))
                .collect(),
        );
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_ingest_and_order() {
        let registry =
            ClientRegistry::ingest(&roster(&[("c2", "B"), ("c1", "A"), ("c3", "C")])).unwrap();
        let order: Vec<&str> = registry
            .active_clients()
            .iter()
            .map(|r| r.identity.as_str())
            .collect();
        assert_eq!(order, vec!["c2", "c1", "c3"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_ingest_rejects_bad_rosters() {
        assert!(matches!(
            ClientRegistry::ingest(&[]),
            Err(RegistryError::MalformedRoster(_))
        ));
        assert!(matches!(
            ClientRegistry::ingest(&roster(&[("c1", "A"), ("c1", "B")])),
            Err(RegistryError::MalformedRoster(_))
        ));
        assert!(matches!(
            ClientRegistry::ingest(&roster(&[("", "A")])),
            Err(RegistryError::MalformedRoster(_))
        ));
    }

    #[test]
    fn test_mark_disconnected_is_idempotent_and_permanent() {
        let mut registry = ClientRegistry::ingest(&roster(&[("c1", "A"), ("c2", "B")])).unwrap();
        registry.mark_disconnected("c1");
        registry.mark_disconnected("c1");
        registry.mark_disconnected("nobody");
        assert!(!registry.is_active("c1"));
        assert!(registry.is_active("c2"));
        assert_eq!(registry.active_clients().len(), 1);
    }

    #[tokio::test]
    async fn test_attach_channels_marks_missing_clients() {
        let mut registry = ClientRegistry::ingest(&roster(&[("c1", "A"), ("c2", "B")])).unwrap();

        let (channel, _out, _in) = ClientChannel::pair();
        let mut channels = HashMap::new();
        channels.insert("c1".to_string(), channel);
        registry.attach_channels(channels);

        assert!(registry.is_active("c1"));
        assert!(!registry.is_active("c2"));
        assert!(registry.send_line("c1", "\"hi\"".into()).is_ok());
        assert!(registry.send_line("c2", "\"hi\"".into()).is_err());
    }
}
