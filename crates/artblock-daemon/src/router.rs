use std::sync::Arc;

use artblock_proto::protocol::{
    Action, ErrorCode, Event, Outgoing, Reply, PROTOCOL_VERSION,
};
use tokio::sync::{broadcast, mpsc};

use crate::engine::Engine;
use crate::store::BlacklistStore;
use crate::sync::SyncClient;
use crate::tabs::{ForwardOutcome, PlayerId, PlayerRegistry};

/// Client id for requests that do not arrive over a socket connection (HTTP
/// handlers, the periodic sync).  Socket connections start at 1.
pub const INTERNAL_CLIENT: PlayerId = 0;

/// Where a request came from: the connection id and, for socket clients, the
/// outbound channel a player registration binds to.
pub struct RequestSource {
    pub client: PlayerId,
    pub outbound: Option<mpsc::Sender<Outgoing>>,
}

impl RequestSource {
    pub fn socket(client: PlayerId, outbound: mpsc::Sender<Outgoing>) -> Self {
        Self {
            client,
            outbound: Some(outbound),
        }
    }

    pub fn internal() -> Self {
        Self {
            client: INTERNAL_CLIENT,
            outbound: None,
        }
    }
}

/// One dispatch surface for every request, whatever transport carried it.
/// Mutations that change the store push a `StateUpdated` event to all
/// subscribed connections.
pub struct MessageRouter {
    store: Arc<BlacklistStore>,
    engine: Engine,
    sync: SyncClient,
    registry: Arc<PlayerRegistry>,
    events: broadcast::Sender<Event>,
}

impl MessageRouter {
    pub fn new(
        store: Arc<BlacklistStore>,
        engine: Engine,
        sync: SyncClient,
        registry: Arc<PlayerRegistry>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            store,
            engine,
            sync,
            registry,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// The greeting pushed to every new socket connection.
    pub async fn hello(&self) -> Event {
        Event::Hello {
            protocol_version: PROTOCOL_VERSION,
            state: self.store.summary().await,
        }
    }

    pub async fn dispatch(&self, source: &RequestSource, action: Action) -> Reply {
        match action {
            Action::CheckArtist { artist } => {
                let verdict = self.engine.check(&artist).await;
                Reply::Check {
                    blocked: verdict.blocked,
                    source: verdict.source,
                }
            }

            Action::BlockArtist { artist } => {
                if self.engine.block(&artist).await {
                    self.broadcast_state().await;
                }
                Reply::Ack { success: true }
            }

            Action::SyncCommunity => {
                let outcome = self.sync.sync(&self.store).await;
                if outcome.success {
                    self.broadcast_state().await;
                }
                Reply::Sync {
                    success: outcome.success,
                    count: outcome.count,
                }
            }

            Action::GetSettings => {
                let settings = self.store.settings().await;
                Reply::Settings {
                    community_enabled: settings.community_enabled,
                    local_enabled: settings.local_enabled,
                    last_sync: settings.last_sync,
                    local_blacklist: settings.local,
                    community_blacklist: settings.community,
                }
            }

            Action::SetSettings {
                community_enabled,
                local_enabled,
            } => match self.store.set_flags(community_enabled, local_enabled).await {
                Ok(()) => {
                    self.broadcast_state().await;
                    Reply::Ack { success: true }
                }
                Err(e) => internal_error(format!("failed to persist settings: {e:#}")),
            },

            Action::GetCurrentArtist => {
                match self.registry.forward(Action::GetCurrentArtist).await {
                    ForwardOutcome::Reply(reply) => reply,
                    // No player tab at all is a normal answer, not an error.
                    ForwardOutcome::NoPlayer => Reply::NowPlaying {
                        artist: None,
                        track: None,
                    },
                    ForwardOutcome::NotConnected => not_connected(),
                }
            }

            Action::SkipTrack => match self.registry.forward(Action::SkipTrack).await {
                ForwardOutcome::Reply(reply) => reply,
                ForwardOutcome::NoPlayer | ForwardOutcome::NotConnected => not_connected(),
            },

            Action::RegisterPlayer { url, window } => match &source.outbound {
                Some(outbound) => {
                    self.registry
                        .register(source.client, url, window, outbound.clone())
                        .await;
                    Reply::Registered {
                        player: source.client,
                    }
                }
                None => internal_error("player registration requires a socket connection"),
            },

            Action::UpdatePlayer {
                audible,
                active,
                window_focused,
                url,
            } => {
                if self
                    .registry
                    .update(source.client, audible, active, window_focused, url)
                    .await
                {
                    Reply::Ack { success: true }
                } else {
                    internal_error("player is not registered")
                }
            }
        }
    }

    async fn broadcast_state(&self) {
        let state = self.store.summary().await;
        let _ = self.events.send(Event::StateUpdated { state });
    }
}

fn not_connected() -> Reply {
    Reply::Error {
        code: ErrorCode::NotConnected,
        message: "no player tab is connected".to_string(),
    }
}

fn internal_error(message: impl Into<String>) -> Reply {
    Reply::Error {
        code: ErrorCode::Internal,
        message: message.into(),
    }
}
