//! Identity of a connecting client, as reported in its hello frame.

/// Why the client connected: to publish or to subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Pub,
    Sub,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Pub => "pub",
            Purpose::Sub => "sub",
        }
    }
}

/// Client-reported identity. Host and port are overwritten with the observed
/// peer address when the session is created; the rest is taken as declared.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UserAgent {
    /// Logical client group, unqualified (environment is appended by the
    /// registry, see `protocol::build_client_group`).
    pub group: String,
    /// Subsystem identifier, e.g. "5109" or "5109-1A0".
    pub subsystem: String,
    pub purpose: Purpose,
    pub host: String,
    pub port: u16,
}

impl UserAgent {
    pub fn new(
        group: impl Into<String>,
        subsystem: impl Into<String>,
        purpose: Purpose,
    ) -> Self {
        Self {
            group: group.into(),
            subsystem: subsystem.into(),
            purpose,
            host: String::new(),
            port: 0,
        }
    }

    pub fn is_consumer(&self) -> bool {
        self.purpose == Purpose::Sub
    }

    pub fn is_producer(&self) -> bool {
        self.purpose == Purpose::Pub
    }
}

impl std::fmt::Display for UserAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}/{}:{}[{}]",
            self.subsystem,
            self.group,
            self.host,
            self.port,
            self.purpose.as_str()
        )
    }
}
