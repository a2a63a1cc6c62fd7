//! Access log messages

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Accepted,
    Rejected,
}

impl std::fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessStatus::Accepted => write!(f, "accepted"),
            AccessStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// One access-log line: filled in progressively as a flow moves through the
/// dispatcher, emitted once the outbound tag is known.
#[derive(Debug, Clone)]
pub struct AccessMessage {
    pub from: String,
    pub to: String,
    pub status: AccessStatus,
    pub reason: String,
    pub inbound_tag: String,
    pub outbound_tag: String,
}

impl AccessMessage {
    pub fn accepted(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            status: AccessStatus::Accepted,
            reason: String::new(),
            inbound_tag: String::new(),
            outbound_tag: String::new(),
        }
    }

    pub fn emit(&self) {
        info!("{}", self);
    }
}

impl std::fmt::Display for AccessMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} {} [{}] {} {}",
            self.inbound_tag, self.from, self.status, self.outbound_tag, self.to, self.reason
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_message_format() {
        let mut msg = AccessMessage::accepted("10.0.0.1:52311", "tcp:example.com:443");
        msg.inbound_tag = "socks-in".to_string();
        msg.outbound_tag = "proxy".to_string();
        assert_eq!(
            msg.to_string(),
            "[socks-in] 10.0.0.1:52311 accepted [proxy] tcp:example.com:443 "
        );
    }
}
