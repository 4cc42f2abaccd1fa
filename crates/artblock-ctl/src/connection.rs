use std::time::Duration;

use anyhow::Context;
use artblock_proto::protocol::{
    Action, Event, FrameError, Incoming, Outgoing, Reply, RequestFrame, StateSummary,
    PROTOCOL_VERSION,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// How long to wait for one reply.  Requests forwarded to a player tab can
/// take a few seconds when the tab is slow to answer.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DaemonConnection {
    stream: TcpStream,
    read_buffer: Vec<u8>,
    next_id: u64,
}

impl DaemonConnection {
    /// Connect and consume the hello the daemon sends first.  Returns the
    /// connection plus the state summary carried by the hello.
    pub async fn connect(address: &str) -> anyhow::Result<(Self, StateSummary)> {
        let stream = TcpStream::connect(address)
            .await
            .with_context(|| format!("could not reach the daemon at {address}"))?;
        let mut conn = Self {
            stream,
            read_buffer: Vec::with_capacity(4096),
            next_id: 0,
        };

        match conn.read_frame().await? {
            Incoming::Event(Event::Hello {
                protocol_version,
                state,
            }) => {
                anyhow::ensure!(
                    protocol_version == PROTOCOL_VERSION,
                    "daemon speaks protocol v{protocol_version}, this tool speaks v{PROTOCOL_VERSION}"
                );
                Ok((conn, state))
            }
            other => anyhow::bail!("expected a hello from the daemon, got {other:?}"),
        }
    }

    /// Send one action and wait for its reply, skipping pushed events.
    pub async fn request(&mut self, action: Action) -> anyhow::Result<Reply> {
        self.next_id += 1;
        let id = self.next_id;
        let frame = Outgoing::Request(RequestFrame { id, action });
        self.stream.write_all(&frame.encode()?).await?;

        tokio::time::timeout(REPLY_TIMEOUT, self.wait_for_reply(id))
            .await
            .context("timed out waiting for the daemon")?
    }

    async fn wait_for_reply(&mut self, id: u64) -> anyhow::Result<Reply> {
        loop {
            match self.read_frame().await? {
                Incoming::Reply(frame) if frame.id == id => return Ok(frame.reply),
                Incoming::Reply(_) | Incoming::Event(_) => {}
                other => anyhow::bail!("unexpected frame from the daemon: {other:?}"),
            }
        }
    }

    async fn read_frame(&mut self) -> anyhow::Result<Incoming> {
        loop {
            match Incoming::decode(&self.read_buffer) {
                Ok((frame, consumed)) => {
                    self.read_buffer.drain(..consumed);
                    return Ok(frame);
                }
                Err(FrameError::Incomplete) => {
                    let mut buf = [0u8; 4096];
                    let n = self.stream.read(&mut buf).await?;
                    anyhow::ensure!(n > 0, "the daemon closed the connection");
                    self.read_buffer.extend_from_slice(&buf[..n]);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
