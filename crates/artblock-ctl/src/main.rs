mod connection;

use anyhow::bail;
use artblock_proto::platform;
use artblock_proto::protocol::{Action, ErrorCode, ListSource, Reply, StateSummary};
use clap::{Parser, Subcommand, ValueEnum};

use connection::DaemonConnection;

#[derive(Parser)]
#[command(name = "abctl", about = "Control a running artblock daemon")]
struct Cli {
    /// Daemon address, host:port.  Defaults to the local daemon.
    #[arg(long, global = true)]
    address: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show blacklist counts and sync state.
    Status,
    /// Show who is playing in the selected player tab.
    Now,
    /// Check whether an artist is on an enabled blacklist.
    Check { artist: String },
    /// Block an artist.  With no name, blocks whoever is playing right now
    /// and skips the track.
    Block { artist: Option<String> },
    /// Fetch the community blacklist from the backend now.
    Sync,
    /// Show the blacklist settings, or change them with --community/--local.
    Settings {
        #[arg(long, value_enum)]
        community: Option<Toggle>,
        #[arg(long, value_enum)]
        local: Option<Toggle>,
    },
    /// Skip the current track.
    Skip,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn as_bool(self) -> bool {
        matches!(self, Toggle::On)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let address = cli.address.unwrap_or_else(platform::daemon_address);

    let (mut daemon, state) = DaemonConnection::connect(&address).await?;

    match cli.command {
        Command::Status => print_status(&state),

        Command::Now => match reply_or_err(daemon.request(Action::GetCurrentArtist).await?)? {
            Reply::NowPlaying {
                artist: Some(artist),
                track,
            } => match track {
                Some(track) => println!("{artist} - {track}"),
                None => println!("{artist}"),
            },
            Reply::NowPlaying { artist: None, .. } => println!("no track playing"),
            other => return Err(unexpected(other)),
        },

        Command::Check { artist } => {
            match reply_or_err(
                daemon
                    .request(Action::CheckArtist {
                        artist: artist.clone(),
                    })
                    .await?,
            )? {
                Reply::Check { blocked: true, source } => {
                    let list = match source {
                        Some(ListSource::Local) => "local",
                        Some(ListSource::Community) => "community",
                        None => "a",
                    };
                    println!("{artist}: blocked ({list} blacklist)");
                }
                Reply::Check { blocked: false, .. } => println!("{artist}: not blocked"),
                other => return Err(unexpected(other)),
            }
        }

        Command::Block { artist } => {
            let name = match artist {
                Some(name) => name,
                // No name given: block whoever is playing, then skip.
                None => {
                    let outcome = block_current(&mut daemon).await?;
                    println!("Blocked {}", outcome.artist);
                    match outcome.skip_error {
                        None => println!("Skipped the track"),
                        Some(error) => return Err(error),
                    }
                    return Ok(());
                }
            };
            reply_or_err(
                daemon
                    .request(Action::BlockArtist {
                        artist: name.clone(),
                    })
                    .await?,
            )?;
            println!("Blocked {name}");
        }

        Command::Sync => match reply_or_err(daemon.request(Action::SyncCommunity).await?)? {
            Reply::Sync {
                success: true,
                count,
            } => match count {
                Some(count) => println!("synced ({count})"),
                None => println!("synced"),
            },
            Reply::Sync { success: false, .. } => {
                bail!("sync failed, see the daemon log for details")
            }
            other => return Err(unexpected(other)),
        },

        Command::Settings { community, local } => {
            if community.is_some() || local.is_some() {
                let (community_enabled, local_enabled) =
                    match reply_or_err(daemon.request(Action::GetSettings).await?)? {
                        Reply::Settings {
                            community_enabled,
                            local_enabled,
                            ..
                        } => (community_enabled, local_enabled),
                        other => return Err(unexpected(other)),
                    };
                reply_or_err(
                    daemon
                        .request(Action::SetSettings {
                            community_enabled: community
                                .map_or(community_enabled, Toggle::as_bool),
                            local_enabled: local.map_or(local_enabled, Toggle::as_bool),
                        })
                        .await?,
                )?;
            }

            match reply_or_err(daemon.request(Action::GetSettings).await?)? {
                Reply::Settings {
                    community_enabled,
                    local_enabled,
                    last_sync,
                    local_blacklist,
                    community_blacklist,
                } => {
                    println!(
                        "Local blacklist:     {} artists ({})",
                        local_blacklist.len(),
                        on_off(local_enabled)
                    );
                    println!(
                        "Community blacklist: {} artists ({})",
                        community_blacklist.len(),
                        on_off(community_enabled)
                    );
                    println!("Last sync:           {}", format_sync_time(last_sync));
                }
                other => return Err(unexpected(other)),
            }
        }

        Command::Skip => {
            reply_or_err(daemon.request(Action::SkipTrack).await?)?;
            println!("Skipped");
        }
    }

    Ok(())
}

/// What the bare `block` flow did.  The skip runs only after the block has
/// persisted, so its failure is carried alongside the blocked name instead of
/// replacing it.
struct BlockOutcome {
    artist: String,
    skip_error: Option<anyhow::Error>,
}

/// Block whoever is playing right now, then try to skip the track.
async fn block_current(daemon: &mut DaemonConnection) -> anyhow::Result<BlockOutcome> {
    let playing = match reply_or_err(daemon.request(Action::GetCurrentArtist).await?)? {
        Reply::NowPlaying {
            artist: Some(artist),
            ..
        } => artist,
        Reply::NowPlaying { artist: None, .. } => {
            bail!("nothing is playing, name the artist to block")
        }
        other => return Err(unexpected(other)),
    };

    reply_or_err(
        daemon
            .request(Action::BlockArtist {
                artist: playing.clone(),
            })
            .await?,
    )?;

    let skip_error = match daemon.request(Action::SkipTrack).await.and_then(reply_or_err) {
        Ok(_) => None,
        Err(error) => Some(error),
    };

    Ok(BlockOutcome {
        artist: playing,
        skip_error,
    })
}

fn print_status(state: &StateSummary) {
    println!(
        "Local blacklist:     {} artists ({})",
        state.local_count,
        on_off(state.local_enabled)
    );
    println!(
        "Community blacklist: {} artists ({})",
        state.community_count,
        on_off(state.community_enabled)
    );
    println!("Last sync:           {}", format_sync_time(state.last_sync));
}

/// Turn an error reply into a readable CLI error, pass everything else on.
fn reply_or_err(reply: Reply) -> anyhow::Result<Reply> {
    match reply {
        Reply::Error { code, message } => match code {
            ErrorCode::NotConnected => bail!("player not connected ({message})"),
            _ => bail!("daemon error: {message}"),
        },
        other => Ok(other),
    }
}

fn unexpected(reply: Reply) -> anyhow::Error {
    anyhow::anyhow!("unexpected reply from the daemon: {reply:?}")
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

fn format_sync_time(millis: Option<i64>) -> String {
    millis
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_else(|| "never".to_string())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use artblock_proto::protocol::{Event, Incoming, Outgoing, ReplyFrame, PROTOCOL_VERSION};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn test_format_sync_time_never() {
        assert_eq!(format_sync_time(None), "never");
    }

    #[test]
    fn test_format_sync_time_stamped() {
        let formatted = format_sync_time(Some(1_700_000_000_000));
        assert!(formatted.starts_with("20"), "got {formatted}");
    }

    /// One-connection daemon double: sends the hello, then answers each
    /// request with the next scripted reply, recording the actions it saw.
    async fn scripted_daemon(replies: Vec<Reply>) -> (SocketAddr, Arc<Mutex<Vec<Action>>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&seen);
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let hello = Outgoing::Event(Event::Hello {
                protocol_version: PROTOCOL_VERSION,
                state: StateSummary {
                    local_count: 0,
                    community_count: 0,
                    community_enabled: true,
                    local_enabled: true,
                    last_sync: None,
                },
            });
            stream.write_all(&hello.encode().unwrap()).await.unwrap();

            let mut replies = replies.into_iter();
            let mut buffer: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                match Incoming::decode(&buffer) {
                    Ok((frame, consumed)) => {
                        buffer.drain(..consumed);
                        if let Incoming::Request(request) = frame {
                            let id = request.id;
                            recorded.lock().unwrap().push(request.action);
                            let Some(reply) = replies.next() else { break };
                            let out = Outgoing::Reply(ReplyFrame { id, reply });
                            stream.write_all(&out.encode().unwrap()).await.unwrap();
                        }
                    }
                    Err(_) => {
                        let n = stream.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        buffer.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        });

        (addr, seen)
    }

    #[tokio::test]
    async fn test_block_current_keeps_block_when_skip_fails() {
        let (addr, seen) = scripted_daemon(vec![
            Reply::NowPlaying {
                artist: Some("Synthetic Act".to_string()),
                track: Some("Loop".to_string()),
            },
            Reply::Ack { success: true },
            Reply::Error {
                code: ErrorCode::NotConnected,
                message: "player went away".to_string(),
            },
        ])
        .await;

        let (mut daemon, _) = DaemonConnection::connect(&addr.to_string()).await.unwrap();
        let outcome = block_current(&mut daemon).await.unwrap();

        // The block went through and is reported even though the skip failed.
        assert_eq!(outcome.artist, "Synthetic Act");
        let error = outcome.skip_error.expect("the skip should have failed");
        assert!(error.to_string().contains("player not connected"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Action::GetCurrentArtist,
                Action::BlockArtist {
                    artist: "Synthetic Act".to_string(),
                },
                Action::SkipTrack,
            ]
        );
    }

    #[tokio::test]
    async fn test_block_current_blocks_then_skips() {
        let (addr, _) = scripted_daemon(vec![
            Reply::NowPlaying {
                artist: Some("Botify".to_string()),
                track: None,
            },
            Reply::Ack { success: true },
            Reply::Ack { success: true },
        ])
        .await;

        let (mut daemon, _) = DaemonConnection::connect(&addr.to_string()).await.unwrap();
        let outcome = block_current(&mut daemon).await.unwrap();

        assert_eq!(outcome.artist, "Botify");
        assert!(outcome.skip_error.is_none());
    }
}
