//! Player registry and forwarding.
//!
//! Player clients are streaming-site tabs.  Each one registers on its daemon
//! connection and keeps its volatile state fresh with `updatePlayer`.  When a
//! controller asks for the current artist or a skip, the daemon picks one
//! player and forwards the request to it:
//!
//! ```text
//!   controller ── getCurrentArtist ──▶ daemon ── RequestFrame{id} ──▶ player
//!   controller ◀──── nowPlaying ───── daemon ◀── ReplyFrame{id} ◀─── player
//! ```
//!
//! Forwarded requests are correlated by id through a pending map; a player
//! that never answers is cut off by a timeout so controllers always get a
//! reply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use artblock_proto::protocol::{Action, Outgoing, Reply, ReplyFrame, RequestFrame};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

pub type PlayerId = u64;

/// How long a player tab gets to answer a forwarded request.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_FORWARD_ID: AtomicU64 = AtomicU64::new(1);

struct PlayerTab {
    url: String,
    window: u64,
    active: bool,
    audible: bool,
    last_accessed: Instant,
    outbound: mpsc::Sender<Outgoing>,
}

#[derive(Default)]
struct RegistryInner {
    players: HashMap<PlayerId, PlayerTab>,
    focused_window: Option<u64>,
}

struct PendingForward {
    player: PlayerId,
    reply: oneshot::Sender<Reply>,
}

/// What a forwarded request came back with.
pub enum ForwardOutcome {
    Reply(Reply),
    /// No supported player tab is registered.
    NoPlayer,
    /// A player was selected but went away or did not answer in time.
    NotConnected,
}

pub struct PlayerRegistry {
    inner: RwLock<RegistryInner>,
    pending: Mutex<HashMap<u64, PendingForward>>,
    allowed_domains: Vec<String>,
}

impl PlayerRegistry {
    pub fn new(allowed_domains: Vec<String>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            pending: Mutex::new(HashMap::new()),
            allowed_domains,
        }
    }

    pub async fn register(
        &self,
        id: PlayerId,
        url: String,
        window: u64,
        outbound: mpsc::Sender<Outgoing>,
    ) {
        info!("tabs: player {id} registered for {url} (window {window})");
        let mut inner = self.inner.write().await;
        inner.players.insert(
            id,
            PlayerTab {
                url,
                window,
                active: false,
                audible: false,
                last_accessed: Instant::now(),
                outbound,
            },
        );
    }

    /// Refresh a player's volatile state.  Returns `false` for a connection
    /// that never registered.
    pub async fn update(
        &self,
        id: PlayerId,
        audible: bool,
        active: bool,
        window_focused: bool,
        url: Option<String>,
    ) -> bool {
        let mut inner = self.inner.write().await;
        let Some(tab) = inner.players.get_mut(&id) else {
            debug!("tabs: update from unregistered client {id}");
            return false;
        };

        tab.audible = audible;
        tab.active = active;
        tab.last_accessed = Instant::now();
        if let Some(url) = url {
            tab.url = url;
        }
        let window = tab.window;

        if window_focused {
            inner.focused_window = Some(window);
        } else if inner.focused_window == Some(window) {
            inner.focused_window = None;
        }
        true
    }

    /// Bump a player's recency.  Called for every frame a connection sends;
    /// a no-op for connections that never registered.
    pub async fn touch(&self, id: PlayerId) {
        if let Some(tab) = self.inner.write().await.players.get_mut(&id) {
            tab.last_accessed = Instant::now();
        }
    }

    /// Drop a player on disconnect.  Any forward still waiting on it fails
    /// immediately instead of running out the timeout.
    pub async fn remove(&self, id: PlayerId) {
        let removed = self.inner.write().await.players.remove(&id).is_some();
        if removed {
            info!("tabs: player {id} disconnected");
            self.pending
                .lock()
                .await
                .retain(|_, pending| pending.player != id);
        }
    }

    /// Route a reply frame from a player back to the forward that is waiting
    /// for it.
    pub async fn resolve(&self, frame: ReplyFrame) {
        match self.pending.lock().await.remove(&frame.id) {
            Some(pending) => {
                let _ = pending.reply.send(frame.reply);
            }
            None => debug!("tabs: reply for unknown forward id {}", frame.id),
        }
    }

    /// Send `action` to the best player tab and wait for its answer.
    pub async fn forward(&self, action: Action) -> ForwardOutcome {
        let target = {
            let inner = self.inner.read().await;
            let views: Vec<TabView> = inner
                .players
                .iter()
                .filter(|(_, tab)| self.is_supported(&tab.url))
                .map(|(&id, tab)| TabView {
                    id,
                    window: tab.window,
                    active: tab.active,
                    audible: tab.audible,
                    last_accessed: tab.last_accessed,
                })
                .collect();
            select_player(&views, inner.focused_window).and_then(|id| {
                inner
                    .players
                    .get(&id)
                    .map(|tab| (id, tab.outbound.clone()))
            })
        };

        let Some((player, outbound)) = target else {
            return ForwardOutcome::NoPlayer;
        };

        let id = NEXT_FORWARD_ID.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(id, PendingForward { player, reply: reply_tx });

        debug!("tabs: forwarding to player {player} (forward id {id})");
        let frame = Outgoing::Request(RequestFrame { id, action });
        if outbound.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return ForwardOutcome::NotConnected;
        }

        match tokio::time::timeout(FORWARD_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => ForwardOutcome::Reply(reply),
            Ok(Err(_)) => ForwardOutcome::NotConnected,
            Err(_) => {
                self.pending.lock().await.remove(&id);
                warn!("tabs: player {player} did not answer forward id {id}");
                ForwardOutcome::NotConnected
            }
        }
    }

    fn is_supported(&self, url: &str) -> bool {
        let Ok(parsed) = reqwest::Url::parse(url) else {
            return false;
        };
        match parsed.host_str() {
            Some(host) => self
                .allowed_domains
                .iter()
                .any(|domain| host_matches(host, domain)),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TabView {
    id: PlayerId,
    window: u64,
    active: bool,
    audible: bool,
    last_accessed: Instant,
}

/// Pick the tab a forwarded request should go to.  The active tab of the
/// focused window wins; after that audible tabs beat silent ones and recency
/// breaks ties, first within the focused window, then across all of them.
fn select_player(tabs: &[TabView], focused_window: Option<u64>) -> Option<PlayerId> {
    if let Some(window) = focused_window {
        if let Some(tab) = tabs.iter().find(|t| t.window == window && t.active) {
            return Some(tab.id);
        }
        if let Some(tab) = best_of(tabs.iter().filter(|t| t.window == window)) {
            return Some(tab.id);
        }
    }
    best_of(tabs.iter()).map(|tab| tab.id)
}

fn best_of<'a>(tabs: impl Iterator<Item = &'a TabView>) -> Option<&'a TabView> {
    tabs.max_by_key(|t| (t.audible, t.last_accessed))
}

/// `deezer.com` matches itself and any subdomain, but never a host that
/// merely ends with the same letters (`notdeezer.com`).
fn host_matches(host: &str, domain: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{domain}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domains() -> Vec<String> {
        vec![
            "open.spotify.com".to_string(),
            "deezer.com".to_string(),
            "music.youtube.com".to_string(),
        ]
    }

    #[test]
    fn test_supported_check_uses_parsed_host() {
        let registry = PlayerRegistry::new(domains());
        assert!(registry.is_supported("https://open.spotify.com/playlist/xyz?si=1"));
        assert!(registry.is_supported("http://deezer.com"));
        assert!(registry.is_supported("https://user@music.youtube.com:443/watch"));
        assert!(!registry.is_supported("https://example.com/listen"));
        assert!(!registry.is_supported("not a url"));
        assert!(!registry.is_supported(""));
        // An allowed name in userinfo or path position is not the host.
        assert!(!registry.is_supported("https://evil.example\\@open.spotify.com/track/1"));
        assert!(!registry.is_supported("https://evil.example/open.spotify.com"));
        assert!(!registry.is_supported("https://open.spotify.com.evil.example/track/1"));
    }

    #[test]
    fn test_host_matching_is_suffix_by_label() {
        assert!(host_matches("deezer.com", "deezer.com"));
        assert!(host_matches("www.deezer.com", "deezer.com"));
        assert!(host_matches("WWW.Deezer.Com", "deezer.com"));
        assert!(!host_matches("notdeezer.com", "deezer.com"));
        assert!(!host_matches("deezer.com.evil.example", "deezer.com"));
        assert!(!host_matches("youtube.com", "music.youtube.com"));
    }

    fn view(id: PlayerId, window: u64, active: bool, audible: bool, age_ms: u64) -> TabView {
        TabView {
            id,
            window,
            active,
            audible,
            last_accessed: Instant::now() - Duration::from_millis(age_ms),
        }
    }

    #[test]
    fn test_selection_prefers_active_tab_of_focused_window() {
        let tabs = [
            view(1, 10, false, true, 0),
            view(2, 20, true, false, 0),
            view(3, 20, false, true, 0),
        ];
        assert_eq!(select_player(&tabs, Some(20)), Some(2));
    }

    #[test]
    fn test_selection_falls_back_to_audible_then_recent() {
        // No active tab in the focused window: audible wins over newer silent.
        let tabs = [view(1, 10, false, false, 10), view(2, 10, false, true, 5000)];
        assert_eq!(select_player(&tabs, Some(10)), Some(2));

        // Nothing audible: most recently accessed wins.
        let tabs = [view(1, 10, false, false, 5000), view(2, 10, false, false, 10)];
        assert_eq!(select_player(&tabs, Some(10)), Some(2));
    }

    #[test]
    fn test_selection_leaves_focused_window_when_empty() {
        let tabs = [view(1, 30, false, true, 0), view(2, 30, false, false, 0)];
        assert_eq!(select_player(&tabs, Some(10)), Some(1));
        assert_eq!(select_player(&[], Some(10)), None);
    }

    #[tokio::test]
    async fn test_forward_without_players() {
        let registry = PlayerRegistry::new(domains());
        assert!(matches!(
            registry.forward(Action::SkipTrack).await,
            ForwardOutcome::NoPlayer
        ));
    }

    #[tokio::test]
    async fn test_forward_ignores_unsupported_urls() {
        let registry = PlayerRegistry::new(domains());
        let (tx, _rx) = mpsc::channel(8);
        registry
            .register(1, "https://example.com/listen".to_string(), 1, tx)
            .await;
        assert!(matches!(
            registry.forward(Action::SkipTrack).await,
            ForwardOutcome::NoPlayer
        ));
    }

    #[tokio::test]
    async fn test_forward_rejects_userinfo_host_spoof() {
        let registry = PlayerRegistry::new(domains());
        let (tx, _rx) = mpsc::channel(8);
        registry
            .register(
                1,
                "https://evil.example\\@open.spotify.com/track/1".to_string(),
                1,
                tx,
            )
            .await;
        registry.update(1, true, true, true, None).await;
        assert!(matches!(
            registry.forward(Action::SkipTrack).await,
            ForwardOutcome::NoPlayer
        ));
    }

    #[tokio::test]
    async fn test_update_url_changes_eligibility() {
        let registry = std::sync::Arc::new(PlayerRegistry::new(domains()));
        let (tx, mut rx) = mpsc::channel(8);
        registry
            .register(5, "https://open.spotify.com/album/1".to_string(), 2, tx)
            .await;

        // The tab navigates away from the streaming site.
        assert!(
            registry
                .update(5, true, true, true, Some("https://news.example/story".to_string()))
                .await
        );
        assert!(matches!(
            registry.forward(Action::SkipTrack).await,
            ForwardOutcome::NoPlayer
        ));

        // Navigating back makes it forwardable again.
        assert!(
            registry
                .update(5, true, true, true, Some("https://deezer.com/track/9".to_string()))
                .await
        );
        let answering = std::sync::Arc::clone(&registry);
        tokio::spawn(async move {
            if let Some(Outgoing::Request(frame)) = rx.recv().await {
                answering
                    .resolve(ReplyFrame {
                        id: frame.id,
                        reply: Reply::Ack { success: true },
                    })
                    .await;
            }
        });
        assert!(matches!(
            registry.forward(Action::SkipTrack).await,
            ForwardOutcome::Reply(Reply::Ack { success: true })
        ));
    }

    #[tokio::test]
    async fn test_forward_roundtrip() {
        let registry = std::sync::Arc::new(PlayerRegistry::new(domains()));
        let (tx, mut rx) = mpsc::channel(8);
        registry
            .register(7, "https://open.spotify.com/album/1".to_string(), 1, tx)
            .await;

        // Fake player: answer the forwarded request through the registry.
        let answering = std::sync::Arc::clone(&registry);
        tokio::spawn(async move {
            if let Some(Outgoing::Request(frame)) = rx.recv().await {
                assert_eq!(frame.action, Action::GetCurrentArtist);
                answering
                    .resolve(ReplyFrame {
                        id: frame.id,
                        reply: Reply::NowPlaying {
                            artist: Some("Four Tet".to_string()),
                            track: Some("Parallel 1".to_string()),
                        },
                    })
                    .await;
            }
        });

        match registry.forward(Action::GetCurrentArtist).await {
            ForwardOutcome::Reply(Reply::NowPlaying { artist, .. }) => {
                assert_eq!(artist.as_deref(), Some("Four Tet"));
            }
            _ => panic!("expected a nowPlaying reply"),
        }
    }

    #[tokio::test]
    async fn test_forward_fails_fast_when_player_disconnects() {
        let registry = std::sync::Arc::new(PlayerRegistry::new(domains()));
        let (tx, _rx) = mpsc::channel(8);
        registry
            .register(3, "https://deezer.com/track/9".to_string(), 1, tx)
            .await;

        let forwarding = std::sync::Arc::clone(&registry);
        let handle =
            tokio::spawn(async move { forwarding.forward(Action::SkipTrack).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.remove(3).await;

        let started = Instant::now();
        assert!(matches!(
            handle.await.unwrap(),
            ForwardOutcome::NotConnected
        ));
        assert!(started.elapsed() < FORWARD_TIMEOUT);
    }
}
