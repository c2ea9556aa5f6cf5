// TCP connection wrapper
// Line-delimited JSON framing shared by the stream client and the simulator

use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;

use crate::constants::MAX_LINE_BYTES;

/// A single TCP connection carrying one JSON document per line.
pub struct Connection {
    reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
    writer: BufWriter<tokio::io::WriteHalf<TcpStream>>,
    peer_addr: SocketAddr,
    /// Bytes of the line being assembled
    pending: Vec<u8>,
    /// Skipping the rest of an overlong line
    discarding: bool,
}

impl Connection {
    /// Wrap an accepted or connected TCP stream
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);

        Connection {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            peer_addr,
            pending: Vec::new(),
            discarding: false,
        }
    }

    /// Open an outbound connection
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self::new(stream, peer_addr))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read one line without its terminator. `None` on EOF.
    ///
    /// Lines longer than `MAX_LINE_BYTES` or not valid UTF-8 fail with
    /// `InvalidData`; the connection stays usable and the next call returns
    /// the following line. Cancel-safe: a partial line survives a dropped
    /// future and is completed by the next call.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                // EOF: an unterminated last line is still a line
                self.discarding = false;
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return decode_line(std::mem::take(&mut self.pending)).map(Some);
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let used = newline.map_or(available.len(), |i| i + 1);
            if !self.discarding {
                self.pending.extend_from_slice(&available[..used]);
            }
            self.reader.consume(used);

            if self.discarding {
                // Still inside an overlong line that was already reported
                if newline.is_some() {
                    self.discarding = false;
                }
                continue;
            }
            if self.pending.len() > MAX_LINE_BYTES + 1 {
                self.pending.clear();
                self.discarding = newline.is_none();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line exceeds {MAX_LINE_BYTES} bytes"),
                ));
            }
            if newline.is_some() {
                return decode_line(std::mem::take(&mut self.pending)).map(Some);
            }
        }
    }

    /// Serialize `value` and write it as one line
    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> io::Result<()> {
        let json_str = serde_json::to_string(value)?;
        self.write_line(&json_str).await
    }

    /// Write an already-serialized line
    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Strip the line terminator and check the encoding
fn decode_line(mut bytes: Vec<u8>) -> io::Result<String> {
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
    }
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_line_roundtrip_and_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, peer);
            let line = conn.read_line().await.unwrap();
            conn.write_line("pong\r").await.unwrap();
            line
        });

        let mut client = Connection::connect(&addr.to_string()).await.unwrap();
        client.write_json(&serde_json::json!({"cmd": "ping"})).await.unwrap();
        assert_eq!(client.read_line().await.unwrap().as_deref(), Some("pong"));
        assert_eq!(server.await.unwrap().as_deref(), Some(r#"{"cmd":"ping"}"#));

        // Server side dropped: EOF
        assert_eq!(client.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overlong_line_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, peer);
            conn.write_line(&"x".repeat(MAX_LINE_BYTES + 6_000)).await.unwrap();
            conn.write_line("ok").await.unwrap();
            conn.writer.write_all(&[0xff, 0xfe, b'\n']).await.unwrap();
            conn.write_line(&"y".repeat(MAX_LINE_BYTES)).await.unwrap();
        });

        let mut client = Connection::connect(&addr.to_string()).await.unwrap();
        let err = client.read_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(client.read_line().await.unwrap().as_deref(), Some("ok"));

        let err = client.read_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // Exactly at the limit is fine
        assert_eq!(client.read_line().await.unwrap().map(|l| l.len()), Some(MAX_LINE_BYTES));
        assert_eq!(client.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_partial_line_survives_cancelled_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, peer);
            conn.writer.write_all(b"hel").await.unwrap();
            conn.writer.flush().await.unwrap();
            go_rx.await.unwrap();
            conn.write_line("lo").await.unwrap();
        });

        let mut client = Connection::connect(&addr.to_string()).await.unwrap();
        let first = tokio::time::timeout(std::time::Duration::from_millis(100), client.read_line()).await;
        assert!(first.is_err());
        go_tx.send(()).unwrap();
        assert_eq!(client.read_line().await.unwrap().as_deref(), Some("hello"));
    }
}
