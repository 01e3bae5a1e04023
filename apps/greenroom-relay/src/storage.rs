use anyhow::Result;
use interview_proto::{ParticipantRole, SignalEnvelope};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub candidate_id: String,
    pub created_at: u64,
    #[serde(default)]
    pub title: Option<String>,
}

impl SessionInfo {
    pub fn new(session_id: String, candidate_id: String, title: Option<String>) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            session_id,
            candidate_id,
            created_at,
            title,
        }
    }
}

#[derive(Clone)]
pub struct Storage {
    redis: ConnectionManager,
    ttl_seconds: u64,
}

impl Storage {
    pub async fn new(redis_url: &str, ttl_seconds: u64) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;

        Ok(Self { redis, ttl_seconds })
    }

    /// Store a session record. `ttl_seconds` is the initial lifetime; it
    /// must cover the invite's validity window, since activity-based
    /// refreshes only start once someone joins.
    pub async fn register_session(&self, session: SessionInfo, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.redis.clone();
        let key = session_key(&session.session_id);
        let value = serde_json::to_string(&session)?;

        conn.set_ex::<_, _, ()>(&key, value, ttl_seconds).await?;

        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(session_key(session_id)).await?;

        match value {
            Some(json) => {
                let session = serde_json::from_str(&json)?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::pipe()
            .cmd("DEL")
            .arg(session_key(session_id))
            .ignore()
            .cmd("DEL")
            .arg(inbox_key(session_id, ParticipantRole::Recruiter))
            .ignore()
            .cmd("DEL")
            .arg(inbox_key(session_id, ParticipantRole::Candidate))
            .ignore()
            .cmd("DEL")
            .arg(revoked_key(session_id))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn update_session_ttl(&self, session_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.expire::<_, ()>(session_key(session_id), self.ttl_seconds as i64)
            .await?;
        Ok(())
    }

    /// Queue a signal for a role that is not currently connected. The inbox
    /// is flushed, in order, when that role joins.
    pub async fn enqueue_signal(&self, envelope: &SignalEnvelope) -> Result<()> {
        let mut conn = self.redis.clone();
        let key = inbox_key(&envelope.session_id, envelope.to);
        let serialized = serde_json::to_string(envelope)?;
        conn.rpush::<_, _, ()>(&key, serialized).await?;
        conn.expire::<_, ()>(&key, self.ttl_seconds as i64).await?;
        Ok(())
    }

    /// Drain the inbox for a role. Each envelope is popped, so it is
    /// delivered at most once.
    pub async fn drain_inbox(
        &self,
        session_id: &str,
        role: ParticipantRole,
    ) -> Result<Vec<SignalEnvelope>> {
        let mut conn = self.redis.clone();
        let key = inbox_key(session_id, role);
        let mut envelopes = Vec::new();

        loop {
            let entry: Option<String> = conn.lpop(&key, None).await?;
            let Some(serialized) = entry else {
                break;
            };
            match serde_json::from_str::<SignalEnvelope>(&serialized) {
                Ok(envelope) => envelopes.push(envelope),
                Err(err) => {
                    tracing::warn!(session = %session_id, %err, "dropping undecodable inbox entry");
                }
            }
        }

        Ok(envelopes)
    }

    pub async fn revoke_invite(&self, session_id: &str, candidate_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let key = revoked_key(session_id);
        conn.sadd::<_, _, ()>(&key, candidate_id).await?;
        conn.expire::<_, ()>(&key, self.ttl_seconds as i64).await?;
        Ok(())
    }

    pub async fn is_invite_revoked(&self, session_id: &str, candidate_id: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let revoked: bool = conn
            .sismember(revoked_key(session_id), candidate_id)
            .await?;
        Ok(revoked)
    }
}

fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

fn inbox_key(session_id: &str, role: ParticipantRole) -> String {
    format!("session:{}:inbox:{}", session_id, role.as_str())
}

fn revoked_key(session_id: &str) -> String {
    format!("session:{}:revoked", session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_scoped_per_session_and_role() {
        assert_eq!(session_key("s1"), "session:s1");
        assert_eq!(
            inbox_key("s1", ParticipantRole::Recruiter),
            "session:s1:inbox:recruiter"
        );
        assert_ne!(
            inbox_key("s1", ParticipantRole::Recruiter),
            inbox_key("s1", ParticipantRole::Candidate)
        );
        assert_ne!(
            inbox_key("s1", ParticipantRole::Recruiter),
            inbox_key("s2", ParticipantRole::Recruiter)
        );
    }
}
