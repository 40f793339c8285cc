//! Leased sessions: participants without a socket.
//!
//! A backend process keeps a leased session alive by upserting its presence
//! before the TTL runs out. Expiry is lazy. Nothing fires on a timer; an
//! expired row is noticed the next time the room lists leased sessions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{ActorId, JsonObject};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeasedSession {
    pub session_id: String,
    pub presence: JsonObject,
    /// Milliseconds since the epoch of the last upsert.
    pub updated_at: u64,
    pub info: Value,
    /// Lifetime in milliseconds, counted from `updated_at`.
    pub ttl: u64,
    pub actor: ActorId,
}

impl LeasedSession {
    pub fn expires_at(&self) -> u64 {
        self.updated_at.saturating_add(self.ttl)
    }

    /// A session is still live at exactly `updated_at + ttl`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at()
    }

    /// Shallow merge: keys in `patch` replace, absent keys are kept.
    pub fn merge_presence(&mut self, patch: &JsonObject) {
        for (k, v) in patch {
            self.presence.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> LeasedSession {
        LeasedSession {
            session_id: "bot".into(),
            presence: json!({"x": 1, "y": 2}).as_object().cloned().unwrap(),
            updated_at: 0,
            info: json!({"name": "bot"}),
            ttl: 1000,
            actor: 3,
        }
    }

    #[test]
    fn test_expiry_boundary() {
        let s = session();
        assert!(!s.is_expired(999));
        assert!(!s.is_expired(1000));
        assert!(s.is_expired(1001));
    }

    #[test]
    fn test_merge_keeps_absent_keys() {
        let mut s = session();
        s.merge_presence(json!({"x": 5, "z": 9}).as_object().unwrap());
        assert_eq!(Value::Object(s.presence), json!({"x": 5, "y": 2, "z": 9}));
    }

    #[test]
    fn test_json_row_shape() {
        let v = serde_json::to_value(session()).unwrap();
        assert_eq!(v["sessionId"], "bot");
        assert_eq!(v["updatedAt"], 0);
        let back: LeasedSession = serde_json::from_value(v).unwrap();
        assert_eq!(back, session());
    }
}
