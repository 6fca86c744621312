//! Session registry: one task per connection, shared adapters, explicit termination.

use crate::config::SessionConfig;
use crate::error::VoiceResult;
use crate::format::DefaultNormalizer;
use crate::generator::create_best_generator;
use crate::protocol::{ClientFrame, ServerMessage};
use crate::session::{Adapters, Session, SessionPhase, SessionSummary};
use crate::stt::create_best_stt;
use crate::tts::create_best_tts;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

impl Adapters {
    /// Best available backends from the environment, placeholders otherwise.
    pub fn from_env(normalizer: DefaultNormalizer) -> Self {
        Self {
            normalizer: Arc::new(normalizer),
            stt: create_best_stt(),
            generator: create_best_generator(),
            tts: create_best_tts(),
        }
    }
}

struct SessionHandle {
    cancel: CancellationToken,
    phase: watch::Receiver<SessionPhase>,
    started_at: DateTime<Utc>,
}

/// Point-in-time view of a live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub phase: SessionPhase,
    pub started_at: DateTime<Utc>,
}

/// Removes the registry entry however the session future ends, including being dropped.
struct Registration {
    sessions: Arc<DashMap<Uuid, SessionHandle>>,
    id: Uuid,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some((_, handle)) = self.sessions.remove(&self.id) {
            handle.cancel.cancel();
        }
    }
}

/// Runs sessions against one set of adapters and tracks the live ones.
#[derive(Clone)]
pub struct SessionManager {
    adapters: Adapters,
    config: SessionConfig,
    sessions: Arc<DashMap<Uuid, SessionHandle>>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(adapters: Adapters, config: SessionConfig) -> VoiceResult<Self> {
        config.validate()?;
        Ok(Self {
            adapters,
            config,
            sessions: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run one session to completion. Returns when the client disconnects, the session is
    /// terminated, or the outbound channel fails.
    pub async fn run_session<S>(
        &self,
        inbound: S,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> VoiceResult<SessionSummary>
    where
        S: Stream<Item = ClientFrame> + Unpin,
    {
        let id = Uuid::new_v4();
        let cancel = self.shutdown.child_token();
        let session = Session::new(id, self.config.clone(), self.adapters.clone(), cancel.clone())?;
        self.sessions.insert(
            id,
            SessionHandle {
                cancel,
                phase: session.subscribe(),
                started_at: Utc::now(),
            },
        );
        let _registration = Registration {
            sessions: Arc::clone(&self.sessions),
            id,
        };
        info!(target: "parley::manager", %id, active = self.sessions.len(), "session registered");

        let summary = session
            .run(inbound, outbound)
            .instrument(info_span!("session", %id))
            .await;
        Ok(summary)
    }

    /// Close a session from outside. Returns false when no such session is live.
    pub fn terminate(&self, id: Uuid) -> bool {
        match self.sessions.get(&id) {
            Some(handle) => {
                info!(target: "parley::manager", %id, "terminating session");
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Close every live session.
    pub fn shutdown(&self) {
        info!(target: "parley::manager", active = self.sessions.len(), "shutting down sessions");
        self.shutdown.cancel();
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| SessionInfo {
                id: *entry.key(),
                phase: *entry.value().phase.borrow(),
                started_at: entry.value().started_at,
            })
            .collect()
    }
}
