use std::sync::Arc;

use artblock_proto::protocol::Action;
use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::router::{MessageRouter, RequestSource};

/// REST mirror of the socket protocol for pages and scripts that cannot hold
/// a TCP connection.  Every route funnels into the same dispatch as the
/// socket, so the two surfaces cannot drift apart.
pub fn start_server(
    listener: TcpListener,
    router: Arc<MessageRouter>,
) -> tokio::task::JoinHandle<()> {
    let app = Router::new()
        .route("/api/state", get(get_state))
        .route("/api/check", post(check_artist))
        .route("/api/block", post(block_artist))
        .route("/api/sync", post(sync_community))
        .route("/api/settings", post(set_settings))
        .layer(CorsLayer::permissive())
        .with_state(router);

    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            info!("HTTP API listening on http://{addr}");
        }
        if let Err(e) = axum::serve(listener, app).await {
            warn!("HTTP API error: {e}");
        }
    })
}

#[derive(Debug, Deserialize)]
struct ArtistBody {
    artist: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsBody {
    community_enabled: bool,
    local_enabled: bool,
}

async fn get_state(State(router): State<Arc<MessageRouter>>) -> impl IntoResponse {
    Json(
        router
            .dispatch(&RequestSource::internal(), Action::GetSettings)
            .await,
    )
}

async fn check_artist(
    State(router): State<Arc<MessageRouter>>,
    Json(body): Json<ArtistBody>,
) -> impl IntoResponse {
    Json(
        router
            .dispatch(
                &RequestSource::internal(),
                Action::CheckArtist {
                    artist: body.artist,
                },
            )
            .await,
    )
}

async fn block_artist(
    State(router): State<Arc<MessageRouter>>,
    Json(body): Json<ArtistBody>,
) -> impl IntoResponse {
    Json(
        router
            .dispatch(
                &RequestSource::internal(),
                Action::BlockArtist {
                    artist: body.artist,
                },
            )
            .await,
    )
}

async fn sync_community(State(router): State<Arc<MessageRouter>>) -> impl IntoResponse {
    Json(
        router
            .dispatch(&RequestSource::internal(), Action::SyncCommunity)
            .await,
    )
}

async fn set_settings(
    State(router): State<Arc<MessageRouter>>,
    Json(body): Json<SettingsBody>,
) -> impl IntoResponse {
    Json(
        router
            .dispatch(
                &RequestSource::internal(),
                Action::SetSettings {
                    community_enabled: body.community_enabled,
                    local_enabled: body.local_enabled,
                },
            )
            .await,
    )
}
