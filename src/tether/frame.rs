//! The tether frame: one tagged record in an instance's egress history.

use serde::{Deserialize, Serialize};

pub const FRAME_VERSION: u8 = 1;

/// `{channel, id}` — the tether's notion of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub channel: String,
    pub id: String,
}

/// One tether message: a tagged record with session, optional reply
/// linkage, and a monotonically assigned sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TetherFrame {
    pub version: u8,
    #[serde(rename = "type")]
    pub frame_type: String,
    pub ts_ms: i64,
    pub session: Session,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl TetherFrame {
    /// Build a frame with `seq` left at zero; the store assigns the real
    /// value atomically on append.
    pub fn new(
        frame_type: impl Into<String>,
        session: Session,
        msg_id: Option<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: FRAME_VERSION,
            frame_type: frame_type.into(),
            ts_ms: now_ms(),
            session,
            msg_id,
            seq: 0,
            payload,
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Conjunctive filter applied by `Poll`/`Subscribe` consumers.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub channel: Option<String>,
    pub session_id: Option<String>,
    pub types: Option<Vec<String>>,
    pub reply_to_msg_id: Option<String>,
}

impl Filter {
    pub fn matches(&self, frame: &TetherFrame) -> bool {
        if let Some(channel) = &self.channel {
            if &frame.session.channel != channel {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if &frame.session.id != session_id {
                return false;
            }
        }
        if let Some(types) = &self.types {
            if !types.contains(&frame.frame_type) {
                return false;
            }
        }
        if let Some(reply_to) = &self.reply_to_msg_id {
            if frame.msg_id.as_deref() != Some(reply_to.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ty: &str, channel: &str, session: &str) -> TetherFrame {
        TetherFrame::new(
            ty,
            Session { channel: channel.into(), id: session.into() },
            None,
            Vec::new(),
        )
    }

    #[test]
    fn filter_matches_channel_and_session() {
        let f = Filter { channel: Some("host".into()), session_id: Some("s1".into()), ..Default::default() };
        assert!(f.matches(&frame("user.message", "host", "s1")));
        assert!(!f.matches(&frame("user.message", "host", "s2")));
        assert!(!f.matches(&frame("user.message", "guest", "s1")));
    }

    #[test]
    fn filter_matches_type_set() {
        let f = Filter { types: Some(vec!["assistant.done".into()]), ..Default::default() };
        assert!(f.matches(&frame("assistant.done", "host", "s1")));
        assert!(!f.matches(&frame("assistant.delta", "host", "s1")));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = Filter::default();
        assert!(f.matches(&frame("anything", "c", "s")));
    }
}
