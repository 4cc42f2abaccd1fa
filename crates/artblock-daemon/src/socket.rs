use std::sync::Arc;

use artblock_proto::protocol::{ErrorCode, FrameError, Incoming, Outgoing, Reply, ReplyFrame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::router::{MessageRouter, RequestSource};
use crate::tabs::{PlayerId, PlayerRegistry};

pub fn start_server(
    listener: TcpListener,
    router: Arc<MessageRouter>,
    registry: Arc<PlayerRegistry>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            info!("TCP server listening at {addr}");
        }

        let mut client_id: PlayerId = 0;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {id} connected from {peer}");

                    let router = Arc::clone(&router);
                    let registry = Arc::clone(&registry);
                    tokio::spawn(async move {
                        handle_client(stream, id, router, Arc::clone(&registry)).await;
                        registry.remove(id).await;
                        info!("Client {id} disconnected");
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {e}");
                }
            }
        }
    })
}

/// Per-connection loop.  Requests are dispatched from their own tasks so one
/// slow forward (a player taking seconds to answer) never stalls the other
/// traffic on this connection; replies are matched by frame id, not order.
async fn handle_client(
    stream: TcpStream,
    client_id: PlayerId,
    router: Arc<MessageRouter>,
    registry: Arc<PlayerRegistry>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Single writer: replies, forwarded requests, and events all funnel
    // through this channel.
    let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(64);
    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let encoded = match message.encode() {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!("socket: failed to encode frame: {e}");
                    continue;
                }
            };
            if write_half.write_all(&encoded).await.is_err() {
                break;
            }
        }
    });

    // Hello with a state summary on connect.
    if out_tx
        .send(Outgoing::Event(router.hello().await))
        .await
        .is_err()
    {
        return;
    }

    let mut events = router.subscribe();

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {client_id} closed connection");
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            match Incoming::decode(&read_buf) {
                                Ok((frame, consumed)) => {
                                    read_buf.drain(..consumed);
                                    registry.touch(client_id).await;
                                    match frame {
                                        Incoming::Request(frame) => {
                                            debug!("Client {client_id} sent {:?}", frame.action);
                                            let router = Arc::clone(&router);
                                            let source = RequestSource::socket(client_id, out_tx.clone());
                                            let reply_tx = out_tx.clone();
                                            tokio::spawn(async move {
                                                let reply = router.dispatch(&source, frame.action).await;
                                                let _ = reply_tx
                                                    .send(Outgoing::Reply(ReplyFrame { id: frame.id, reply }))
                                                    .await;
                                            });
                                        }
                                        Incoming::Reply(frame) => {
                                            registry.resolve(frame).await;
                                        }
                                        Incoming::Event(_) => {
                                            debug!("Client {client_id} sent an event; ignored");
                                        }
                                        Incoming::Unknown { id: Some(id) } => {
                                            warn!("Client {client_id} sent an unknown action");
                                            let reply = Reply::Error {
                                                code: ErrorCode::UnknownAction,
                                                message: "unknown action".to_string(),
                                            };
                                            if out_tx
                                                .send(Outgoing::Reply(ReplyFrame { id, reply }))
                                                .await
                                                .is_err()
                                            {
                                                return;
                                            }
                                        }
                                        Incoming::Unknown { id: None } => {
                                            debug!("Client {client_id} sent an unrecognized frame; ignored");
                                        }
                                    }
                                }
                                Err(FrameError::Incomplete) => break,
                                Err(FrameError::Malformed(e)) => {
                                    warn!("Client {client_id} sent malformed data, closing: {e}");
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {client_id}: {e}");
                        break;
                    }
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if out_tx.send(Outgoing::Event(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // The next event carries a full summary anyway.
                        warn!("Client {client_id} missed {n} events");
                    }
                    Err(_) => break,
                }
            }
        }
    }
}
