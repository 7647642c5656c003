//! Liveness oracle
//!
//! Answers "is this identity live right now, and where is its stream?".
//! Failures are transient by contract: callers log them and ask again on
//! their next tick.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// One liveness observation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LivenessReport {
    pub is_online: bool,
    pub viewer_count: u32,
    /// Stream locator, present only while the source is live
    pub source_locator: Option<String>,
}

impl LivenessReport {
    pub fn offline() -> Self {
        Self::default()
    }

    pub fn online(source_locator: impl Into<String>, viewer_count: u32) -> Self {
        Self {
            is_online: true,
            viewer_count,
            source_locator: Some(source_locator.into()),
        }
    }

    /// Locator to record from, if the source is live and has one
    pub fn recordable_locator(&self) -> Option<&str> {
        if !self.is_online {
            return None;
        }
        self.source_locator.as_deref().filter(|l| !l.trim().is_empty())
    }
}

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("liveness request for '{identity}' failed: {source}")]
    Transport {
        identity: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("liveness endpoint returned HTTP {status} for '{identity}'")]
    Status { identity: String, status: u16 },

    #[error("unreadable liveness response for '{identity}': {reason}")]
    Decode { identity: String, reason: String },
}

#[async_trait]
pub trait LivenessOracle: Send + Sync {
    async fn query(&self, identity: &str) -> Result<LivenessReport, LivenessError>;
}

/// Response body of the room-context endpoint; unknown fields are ignored
#[derive(Debug, Default, Deserialize)]
struct RoomContext {
    #[serde(default, alias = "source_locator", alias = "url")]
    hls_source: Option<String>,
    #[serde(default)]
    room_status: Option<String>,
    #[serde(default, alias = "viewer_count", alias = "viewers")]
    num_users: Option<u32>,
    #[serde(default, alias = "is_online")]
    online: Option<bool>,
}

impl From<RoomContext> for LivenessReport {
    fn from(ctx: RoomContext) -> Self {
        let locator = ctx.hls_source.filter(|s| !s.trim().is_empty());
        let is_online = ctx.online.unwrap_or_else(|| {
            locator.is_some() || ctx.room_status.as_deref() == Some("public")
        });
        LivenessReport {
            is_online,
            viewer_count: ctx.num_users.unwrap_or(0),
            source_locator: locator,
        }
    }
}

/// JSON-over-HTTP oracle. `url_template` contains an `{identity}` placeholder.
pub struct HttpLivenessOracle {
    client: reqwest::Client,
    url_template: String,
}

impl HttpLivenessOracle {
    pub const USER_AGENT: &'static str =
        concat!("streamrec/", env!("CARGO_PKG_VERSION"));

    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(Self::USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            url_template: url_template.into(),
        })
    }

    pub fn url_for(&self, identity: &str) -> String {
        self.url_template
            .replace("{identity}", &urlencoding::encode(identity))
    }
}

#[async_trait]
impl LivenessOracle for HttpLivenessOracle {
    async fn query(&self, identity: &str) -> Result<LivenessReport, LivenessError> {
        let url = self.url_for(identity);
        let transport = |source: reqwest::Error| LivenessError::Transport {
            identity: identity.to_string(),
            source,
        };

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // Unknown rooms are simply not live
            return Ok(LivenessReport::offline());
        }
        if !status.is_success() {
            return Err(LivenessError::Status {
                identity: identity.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(transport)?;
        parse_report(identity, &body)
    }
}

fn parse_report(identity: &str, body: &str) -> Result<LivenessReport, LivenessError> {
    serde_json::from_str::<RoomContext>(body)
        .map(LivenessReport::from)
        .map_err(|e| LivenessError::Decode {
            identity: identity.to_string(),
            reason: e.to_string(),
        })
}
