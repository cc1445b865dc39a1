//! Transport adapter: per-client line channels and the TCP boundary.
//!
//! Each admitted client connection gets one reader task and one writer
//! task; the core only ever sees a pair of channel ends, so attribution is
//! positional (whatever arrives on a client's inbound channel came from
//! that client's connection) and a session can be driven entirely
//! in-process for tests.

use std::collections::HashMap;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Take};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Duration, Instant};

use crate::protocol::{RosterEntry, MAX_LINE_BYTES};

#[derive(Debug, thiserror::Error)]
#[error("client transport closed")]
pub struct ChannelClosed;

/// Channel pair for one client: lines out to the client process, lines in
/// from it.
#[derive(Debug)]
pub struct ClientChannel {
    pub(crate) outbound: mpsc::UnboundedSender<String>,
    pub(crate) inbound: mpsc::UnboundedReceiver<String>,
}

impl ClientChannel {
    /// A channel pair plus its far ends, for in-process transports and tests.
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<String>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            out_rx,
            in_tx,
        )
    }

    /// Queue one line for delivery. Fails if the writer side is gone.
    pub(crate) fn send(&self, line: String) -> Result<(), ChannelClosed> {
        self.outbound.send(line).map_err(|_| ChannelClosed)
    }
}

/// First line a client must send after connecting.
#[derive(Debug, Deserialize)]
struct Hello {
    secret: String,
    id: String,
}

/// Accept client connections until every roster client is connected or the
/// window closes. Clients missing from the returned map never connected.
pub async fn connect_clients(
    listener: &TcpListener,
    roster: &[RosterEntry],
    secret: &str,
    window: Duration,
) -> HashMap<String, ClientChannel> {
    let due = Instant::now() + window;
    let mut channels: HashMap<String, ClientChannel> = HashMap::new();
    let (admitted_tx, mut admitted_rx) = mpsc::unbounded_channel();

    while channels.len() < roster.len() {
        tokio::select! {
            _ = sleep_until(due) => {
                tracing::warn!("Connect window closed with {}/{} clients", channels.len(), roster.len());
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!("Connection from {}", addr);
                    // Handshakes run concurrently so a connection that
                    // never sends its hello cannot hold up the ones
                    // behind it.
                    let roster = roster.to_vec();
                    let secret = secret.to_string();
                    let admitted_tx = admitted_tx.clone();
                    tokio::spawn(async move {
                        match admit(stream, &roster, &secret, due).await {
                            Ok(pair) => {
                                let _ = admitted_tx.send(pair);
                            }
                            Err(reason) => tracing::warn!("Rejected connection: {}", reason),
                        }
                    });
                }
                Err(e) => tracing::warn!("Accept failed: {}", e),
            },
            Some((id, channel)) = admitted_rx.recv() => {
                if channels.contains_key(&id) {
                    tracing::warn!("Duplicate connection for client {}", id);
                    continue;
                }
                tracing::info!("Client {} connected ({}/{})", id, channels.len() + 1, roster.len());
                channels.insert(id, channel);
            }
        }
    }

    for entry in roster {
        if !channels.contains_key(&entry.id) {
            tracing::warn!("Client {} ({}) never connected", entry.id, entry.name);
        }
    }
    channels
}

/// Handshake one connection: its first line must identify a roster client
/// and carry the session secret. Duplicate claims are resolved by the
/// accept loop; the first admitted connection for an id wins.
async fn admit(
    stream: TcpStream,
    roster: &[RosterEntry],
    secret: &str,
    due: Instant,
) -> Result<(String, ClientChannel), String> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).take(MAX_LINE_BYTES);

    let mut line = String::new();
    let bytes = timeout_at(due, reader.read_line(&mut line))
        .await
        .map_err(|_| "handshake timed out".to_string())?
        .map_err(|e| format!("handshake read failed: {}", e))?;
    if bytes == 0 {
        return Err("closed during handshake".into());
    }

    let hello: Hello =
        serde_json::from_str(line.trim()).map_err(|e| format!("bad hello line: {}", e))?;
    if hello.secret != secret {
        return Err(format!("wrong secret from claimed id {}", hello.id));
    }
    if !roster.iter().any(|e| e.id == hello.id) {
        return Err(format!("unknown client id {}", hello.id));
    }

    let channel = spawn_io(hello.id.clone(), reader, write_half);
    Ok((hello.id, channel))
}

/// Spawn the reader and writer tasks for one admitted connection. The
/// tasks end on EOF, IO error, or when the core drops its channel ends.
///
/// Lines are buffered under a byte cap. A line that blows past the cap is
/// forwarded as its capped prefix, which always exceeds the character
/// bound and so can never be recorded as an answer; the rest of the line
/// is discarded so its tail is not read as a new line.
fn spawn_io(
    id: String,
    mut reader: Take<BufReader<OwnedReadHalf>>,
    mut write_half: OwnedWriteHalf,
) -> ClientChannel {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    let reader_id = id.clone();
    tokio::spawn(async move {
        let mut buf = String::new();
        let mut discarding = false;
        loop {
            buf.clear();
            reader.set_limit(MAX_LINE_BYTES);
            match reader.read_line(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("Client {} closed its connection", reader_id);
                    break;
                }
                Ok(_) => {
                    let complete = buf.ends_with('\n');
                    if discarding {
                        // Tail of a line that already blew the cap.
                        discarding = !complete;
                        continue;
                    }
                    if !complete && reader.limit() == 0 {
                        tracing::warn!("Client {} sent an oversize line", reader_id);
                        discarding = true;
                    }
                    let trimmed = buf.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if in_tx.send(trimmed.to_string()).is_err() {
                        break; // session over
                    }
                }
                Err(e) => {
                    tracing::warn!("Client {} read error: {}", reader_id, e);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            let write = async {
                write_half.write_all(line.as_bytes()).await?;
                write_half.write_all(b"\n").await?;
                write_half.flush().await
            };
            if let Err(e) = write.await {
                tracing::warn!("Client {} write error: {}", id, e);
                break;
            }
        }
    });

    ClientChannel {
        outbound: out_tx,
        inbound: in_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn roster() -> Vec<RosterEntry> {
        serde_json::from_value(serde_json::json!([
            {"id": "c1", "name": "Team A"},
            {"id": "c2", "name": "Team B"},
        ]))
        .unwrap()
    }

    #[tokio::test]
    async fn test_handshake_and_line_io() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut c1 = TcpStream::connect(addr).await.unwrap();
            c1.write_all(b"{\"secret\": \"s3cret\", \"id\": \"c1\"}\n")
                .await
                .unwrap();
            let mut c2 = TcpStream::connect(addr).await.unwrap();
            c2.write_all(b"{\"secret\": \"s3cret\", \"id\": \"c2\"}\n")
                .await
                .unwrap();

            // c1 echoes one answer once it sees a line from the server.
            let mut buf = vec![0u8; 256];
            let n = c1.read(&mut buf).await.unwrap();
            assert!(n > 0);
            c1.write_all(b"\"ok\"\n").await.unwrap();
            (c1, c2)
        });

        let mut channels =
            connect_clients(&listener, &roster(), "s3cret", Duration::from_secs(5)).await;
        assert_eq!(channels.len(), 2);

        let mut c1 = channels.remove("c1").unwrap();
        c1.send("\"hello\"".to_string()).unwrap();
        let answer = c1.inbound.recv().await.unwrap();
        assert_eq!(answer, "\"ok\"");

        // Keep the client sockets alive until the exchange is done.
        let _streams = client.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_connection_does_not_block_others() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            // A connection that never sends its hello, then a correct one.
            let lurker = TcpStream::connect(addr).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut good = TcpStream::connect(addr).await.unwrap();
            good.write_all(b"{\"secret\": \"s3cret\", \"id\": \"c1\"}\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(lurker);
        });

        let single: Vec<RosterEntry> =
            serde_json::from_value(serde_json::json!([{"id": "c1", "name": "Team A"}])).unwrap();
        let started = Instant::now();
        let channels =
            connect_clients(&listener, &single, "s3cret", Duration::from_secs(5)).await;
        assert!(channels.contains_key("c1"));
        // c1 was admitted as soon as its hello arrived, not at the end of
        // the window.
        assert!(started.elapsed() < Duration::from_secs(2));
        client.abort();
    }

    #[tokio::test]
    async fn test_oversize_client_line_is_cut_off_and_discarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut c1 = TcpStream::connect(addr).await.unwrap();
            c1.write_all(b"{\"secret\": \"s3cret\", \"id\": \"c1\"}\n")
                .await
                .unwrap();
            // One line well past the byte cap, then a normal one.
            let flood = format!("\"{}\"\n\"ok\"\n", "x".repeat(50_000));
            c1.write_all(flood.as_bytes()).await.unwrap();
            c1
        });

        let single: Vec<RosterEntry> =
            serde_json::from_value(serde_json::json!([{"id": "c1", "name": "Team A"}])).unwrap();
        let mut channels =
            connect_clients(&listener, &single, "s3cret", Duration::from_secs(5)).await;
        let c1 = channels.get_mut("c1").unwrap();

        // The flood arrives as its capped prefix, past the character
        // bound, and its tail is not mistaken for a second line.
        let first = c1.inbound.recv().await.unwrap();
        assert!(first.chars().count() > crate::protocol::MAX_LINE_LEN);
        let second = c1.inbound.recv().await.unwrap();
        assert_eq!(second, "\"ok\"");

        let _stream = client.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_bad_secret_and_unknown_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut bad = TcpStream::connect(addr).await.unwrap();
            bad.write_all(b"{\"secret\": \"wrong\", \"id\": \"c1\"}\n")
                .await
                .unwrap();
            let mut stranger = TcpStream::connect(addr).await.unwrap();
            stranger
                .write_all(b"{\"secret\": \"s3cret\", \"id\": \"c9\"}\n")
                .await
                .unwrap();
            let mut good = TcpStream::connect(addr).await.unwrap();
            good.write_all(b"{\"secret\": \"s3cret\", \"id\": \"c1\"}\n")
                .await
                .unwrap();
            // Hold the good socket open until the accept loop finishes.
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let single: Vec<RosterEntry> =
            serde_json::from_value(serde_json::json!([{"id": "c1", "name": "Team A"}])).unwrap();
        let channels =
            connect_clients(&listener, &single, "s3cret", Duration::from_secs(5)).await;
        assert_eq!(channels.len(), 1);
        assert!(channels.contains_key("c1"));
    }
}
