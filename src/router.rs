//! Addressed-message resolution: unicast, broadcast, and the override rule.

use crate::protocol::BROADCAST;
use crate::registry::ClientRecord;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("unknown recipient: {0:?}")]
    UnknownRecipient(String),
}

/// Resolve an addressed message into the concrete per-client send set.
///
/// An explicit per-client entry always overrides the broadcast entry for
/// that client. A concrete address that matches no active client rejects
/// the whole message; partial delivery would silently corrupt round
/// state. Output follows active-roster order, fixing deterministic
/// emission.
pub fn resolve(
    message: &serde_json::Map<String, serde_json::Value>,
    active: &[&ClientRecord],
) -> Result<Vec<(String, serde_json::Value)>, RouteError> {
    for address in message.keys() {
        if address != BROADCAST && !active.iter().any(|c| c.identity == *address) {
            return Err(RouteError::UnknownRecipient(address.clone()));
        }
    }

    let broadcast = message.get(BROADCAST);
    let mut sends = Vec::new();
    for client in active {
        if let Some(payload) = message.get(&client.identity) {
            sends.push((client.identity.clone(), payload.clone()));
        } else if let Some(payload) = broadcast {
            sends.push((client.identity.clone(), payload.clone()));
        }
    }
    Ok(sends)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RosterEntry;
    use crate::registry::ClientRegistry;

    fn registry(ids: &[&str]) -> ClientRegistry {
        let roster: Vec<RosterEntry> = serde_json::from_value(serde_json::Value::Array(
            ids.iter()
                .map(|id| serde_json::json!({"id": id, "name": id}))
                .collect(),
        ))
        .unwrap();
        ClientRegistry::ingest(&roster).unwrap()
    }

    fn message(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_explicit_overrides_broadcast() {
        let registry = registry(&["c1", "c2", "c3"]);
        let sends = resolve(
            &message(serde_json::json!({"": "A", "c1": "B"})),
            &registry.active_clients(),
        )
        .unwrap();
        assert_eq!(
            sends,
            vec![
                ("c1".to_string(), serde_json::json!("B")),
                ("c2".to_string(), serde_json::json!("A")),
                ("c3".to_string(), serde_json::json!("A")),
            ]
        );
    }

    #[test]
    fn test_unicast_subset() {
        let registry = registry(&["c1", "c2", "c3"]);
        let sends = resolve(
            &message(serde_json::json!({"c2": {"go": true}})),
            &registry.active_clients(),
        )
        .unwrap();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, "c2");
    }

    #[test]
    fn test_unknown_recipient_rejects_whole_message() {
        let registry = registry(&["c1", "c2"]);
        let result = resolve(
            &message(serde_json::json!({"c1": "x", "c9": "y"})),
            &registry.active_clients(),
        );
        assert!(matches!(result, Err(RouteError::UnknownRecipient(id)) if id == "c9"));
    }

    #[test]
    fn test_disconnected_client_is_unknown() {
        let mut registry = registry(&["c1", "c2"]);
        registry.mark_disconnected("c2");

        // Broadcast silently skips it...
        let sends = resolve(
            &message(serde_json::json!({"": "x"})),
            &registry.active_clients(),
        )
        .unwrap();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, "c1");

        // ...but an explicit address to it is fatal.
        let result = resolve(
            &message(serde_json::json!({"c2": "x"})),
            &registry.active_clients(),
        );
        assert!(matches!(result, Err(RouteError::UnknownRecipient(_))));
    }

    #[test]
    fn test_empty_message_resolves_to_nothing() {
        let registry = registry(&["c1"]);
        let sends = resolve(&message(serde_json::json!({})), &registry.active_clients()).unwrap();
        assert!(sends.is_empty());
    }
}
