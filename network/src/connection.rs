use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{Message, NetworkError, Result};

pub type ConnectionId = Uuid;

/// Longest line accepted from a peer, newline included.
pub const MAX_LINE_LENGTH: usize = 1 << 20;

enum Outgoing {
    Line(String),
    Bytes(Bytes),
}

/// Cheap, cloneable sending side of a connection.
///
/// Writes are queued to a dedicated writer task, so sending never blocks the
/// caller. The socket is shut down once every handle has been dropped and the
/// queue has drained.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    sender: mpsc::UnboundedSender<Outgoing>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send(&self, message: &Message) -> Result<()> {
        tracing::trace!("-> {} {}", self.peer, message);
        self.sender
            .send(Outgoing::Line(message.to_string()))
            .map_err(|_| NetworkError::ConnectionLost(self.id))
    }

    pub fn send_bytes(&self, data: Bytes) -> Result<()> {
        self.sender
            .send(Outgoing::Bytes(data))
            .map_err(|_| NetworkError::ConnectionLost(self.id))
    }

}

/// Receiving side of a connection: one parsed line at a time, or raw payload bytes.
pub struct MessageReader {
    id: ConnectionId,
    peer: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    line: Vec<u8>,
}

impl MessageReader {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns `None` once the peer has closed the connection. A malformed line
    /// yields `Some(Err(InvalidMessage))` and leaves the connection usable; so
    /// do lines that are not UTF-8 or run past [`MAX_LINE_LENGTH`].
    pub async fn next_message(&mut self) -> Option<Result<Message>> {
        loop {
            match self.read_line().await {
                Ok(0) => return None,
                Ok(n) if n == MAX_LINE_LENGTH && self.line.last() != Some(&b'\n') => {
                    if let Err(e) = self.skip_line().await {
                        return Some(Err(e));
                    }
                    return Some(Err(NetworkError::InvalidMessage(format!(
                        "line longer than {} bytes",
                        MAX_LINE_LENGTH
                    ))));
                }
                Ok(_) => {
                    let Ok(line) = std::str::from_utf8(&self.line) else {
                        return Some(Err(NetworkError::InvalidMessage(format!(
                            "not UTF-8: {}",
                            String::from_utf8_lossy(&self.line).trim_end()
                        ))));
                    };
                    let line = line.trim_end_matches(['\r', '\n']);
                    if line.trim().is_empty() {
                        continue;
                    }
                    tracing::trace!("<- {} {}", self.peer, line);
                    return Some(Message::parse(line));
                }
                Err(e) => return Some(Err(NetworkError::Io(e))),
            }
        }
    }

    async fn read_line(&mut self) -> std::io::Result<usize> {
        self.line.clear();
        (&mut self.reader)
            .take(MAX_LINE_LENGTH as u64)
            .read_until(b'\n', &mut self.line)
            .await
    }

    /// Discards the rest of an overlong line.
    async fn skip_line(&mut self) -> Result<()> {
        loop {
            let n = self.read_line().await?;
            if n == 0 || self.line.last() == Some(&b'\n') {
                self.line.clear();
                return Ok(());
            }
        }
    }

    /// Like [`next_message`](Self::next_message) but bounded. A timed-out read
    /// discards any partially received line.
    pub async fn next_message_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        match tokio::time::timeout(timeout, self.next_message()).await {
            Err(_) => Err(NetworkError::Timeout(format!(
                "no message from {} within {:?}",
                self.peer, timeout
            ))),
            Ok(None) => Ok(None),
            Ok(Some(result)) => result.map(Some),
        }
    }

    pub async fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

pub struct Connection;

impl Connection {
    pub fn spawn(stream: TcpStream) -> Result<(ConnectionHandle, MessageReader)> {
        let peer = stream.peer_addr()?;
        let id = Uuid::new_v4();
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            if let Err(e) = Self::write_loop(write_half, rx).await {
                tracing::debug!("Writer for connection {} ({}) stopped: {}", id, peer, e);
            }
        });

        tracing::debug!("Opened connection {} with {}", id, peer);

        Ok((
            ConnectionHandle {
                id,
                peer,
                sender: tx,
            },
            MessageReader {
                id,
                peer,
                reader: BufReader::new(read_half),
                line: Vec::new(),
            },
        ))
    }

    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<(ConnectionHandle, MessageReader)> {
        let stream = TcpStream::connect(addr).await?;
        Self::spawn(stream)
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut queue: mpsc::UnboundedReceiver<Outgoing>,
    ) -> Result<()> {
        while let Some(outgoing) = queue.recv().await {
            match outgoing {
                Outgoing::Line(line) => {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
                Outgoing::Bytes(data) => writer.write_all(&data).await?,
            }
            writer.flush().await?;
        }

        writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> ((ConnectionHandle, MessageReader), (ConnectionHandle, MessageReader)) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(Connection::connect(addr), listener.accept());
        let (stream, _) = accepted.unwrap();
        (client.unwrap(), Connection::spawn(stream).unwrap())
    }

    #[tokio::test]
    async fn lines_flow_in_order() {
        let ((client, _client_reader), (_server, mut server_reader)) = pair().await;

        client.send(&Message::List).unwrap();
        client
            .send(&Message::StoreAck {
                filename: "a.txt".to_string(),
            })
            .unwrap();

        assert_eq!(server_reader.next_message().await.unwrap().unwrap(), Message::List);
        assert_eq!(
            server_reader.next_message().await.unwrap().unwrap(),
            Message::StoreAck {
                filename: "a.txt".to_string()
            }
        );
    }

    #[tokio::test]
    async fn malformed_line_does_not_close_the_stream() {
        let ((client, _client_reader), (_server, mut server_reader)) = pair().await;

        client.send_bytes(Bytes::from_static(b"NONSENSE here\n")).unwrap();
        client.send(&Message::JoinAck).unwrap();

        assert!(matches!(
            server_reader.next_message().await,
            Some(Err(NetworkError::InvalidMessage(_)))
        ));
        assert_eq!(server_reader.next_message().await.unwrap().unwrap(), Message::JoinAck);
    }

    #[tokio::test]
    async fn non_utf8_line_does_not_close_the_stream() {
        let ((client, _client_reader), (_server, mut server_reader)) = pair().await;

        client
            .send_bytes(Bytes::from_static(b"STORE_ACK \xff\xfe.txt\n"))
            .unwrap();
        client.send(&Message::JoinAck).unwrap();

        assert!(matches!(
            server_reader.next_message().await,
            Some(Err(NetworkError::InvalidMessage(_)))
        ));
        assert_eq!(server_reader.next_message().await.unwrap().unwrap(), Message::JoinAck);
    }

    #[tokio::test]
    async fn overlong_line_is_rejected_and_skipped() {
        let ((client, _client_reader), (_server, mut server_reader)) = pair().await;

        let mut line = vec![b'x'; MAX_LINE_LENGTH * 2 + 10];
        line.push(b'\n');
        client.send_bytes(Bytes::from(line)).unwrap();
        client.send(&Message::JoinAck).unwrap();

        match server_reader.next_message().await {
            Some(Err(NetworkError::InvalidMessage(reason))) => assert!(reason.contains("longer than")),
            other => panic!("expected an invalid message, got {:?}", other),
        }
        assert_eq!(server_reader.next_message().await.unwrap().unwrap(), Message::JoinAck);
    }

    #[tokio::test]
    async fn raw_payload_follows_a_line() {
        let ((client, _client_reader), (_server, mut server_reader)) = pair().await;

        client
            .send(&Message::RebalanceStore {
                filename: "a.txt".to_string(),
                size: 5,
            })
            .unwrap();
        client.send_bytes(Bytes::from_static(b"hello")).unwrap();

        let header = server_reader.next_message().await.unwrap().unwrap();
        assert_eq!(
            header,
            Message::RebalanceStore {
                filename: "a.txt".to_string(),
                size: 5
            }
        );
        assert_eq!(&server_reader.read_bytes(5).await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn dropping_every_handle_closes_the_peer() {
        let ((client, client_reader), (_server, mut server_reader)) = pair().await;
        drop(client);
        drop(client_reader);

        assert!(server_reader.next_message().await.is_none());
    }

    #[tokio::test]
    async fn bounded_read_times_out() {
        let ((_client, _client_reader), (_server, mut server_reader)) = pair().await;
        let result = server_reader
            .next_message_timeout(Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(NetworkError::Timeout(_))));
    }
}
