use std::time::Duration;

use peer_binary_protocol::{Handshake, MAX_MSG_LEN, Message, MessageDeserializeError};
use tokio::io::AsyncReadExt;

use crate::{Error, peer_connection::with_timeout};

// Most messages are tiny; the buffer grows only when a large bitfield or piece
// arrives, and never beyond one full frame.
const INITIAL_BUFLEN: usize = 64 * 1024;

/// A buffer for reading framed bittorrent messages from a socket.
/// Bytes past the last parsed frame are kept for the next call.
pub struct ReadBuf {
    buf: Vec<u8>,
    start: usize,
    len: usize,
}

impl Default for ReadBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadBuf {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; INITIAL_BUFLEN],
            start: 0,
            len: 0,
        }
    }

    fn filled(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }

    fn advance(&mut self, size: usize) {
        self.start += size;
        self.len -= size;
        if self.len == 0 {
            self.start = 0;
        }
    }

    /// Make room for at least `additional` more bytes after the filled part.
    fn reserve(&mut self, additional: usize) -> crate::Result<()> {
        let needed = self.len + additional;
        if needed > MAX_MSG_LEN {
            return Err(Error::ProtocolViolation("frame larger than read buffer"));
        }
        if self.start + needed > self.buf.len() {
            self.buf.copy_within(self.start..self.start + self.len, 0);
            self.start = 0;
        }
        if needed > self.buf.len() {
            let new_len = needed.max(self.buf.len() * 2).min(MAX_MSG_LEN);
            self.buf.resize(new_len, 0);
        }
        Ok(())
    }

    /// Read whatever is available into the free tail of the buffer.
    async fn fill(&mut self, mut conn: impl AsyncReadExt + Unpin) -> std::io::Result<usize> {
        let from = self.start + self.len;
        let size = conn.read(&mut self.buf[from..]).await?;
        self.len += size;
        Ok(size)
    }

    /// Read the BT handshake. This MUST be the first operation on the buffer.
    pub async fn read_handshake(
        &mut self,
        conn: impl AsyncReadExt + Unpin,
        timeout: Duration,
    ) -> crate::Result<Handshake> {
        with_timeout("reading handshake", timeout, self.read_handshake_inner(conn)).await
    }

    async fn read_handshake_inner(
        &mut self,
        mut conn: impl AsyncReadExt + Unpin,
    ) -> crate::Result<Handshake> {
        loop {
            match Handshake::deserialize(self.filled()) {
                Ok((h, size)) => {
                    self.advance(size);
                    return Ok(h);
                }
                Err(MessageDeserializeError::NotEnoughData(n, _)) => {
                    self.reserve(n)?;
                    let size = self.fill(&mut conn).await.map_err(Error::ReadHandshake)?;
                    if size == 0 {
                        return Err(Error::PeerDisconnectedReadingHandshake);
                    }
                }
                Err(e) => return Err(Error::DeserializeHandshake(e)),
            }
        }
    }

    /// Read until one full message is buffered, and return it.
    pub async fn read_message(
        &mut self,
        mut conn: impl AsyncReadExt + Unpin,
    ) -> crate::Result<Message> {
        loop {
            match Message::deserialize(self.filled()) {
                Ok((msg, size)) => {
                    self.advance(size);
                    return Ok(msg);
                }
                Err(MessageDeserializeError::NotEnoughData(n, _)) => {
                    self.reserve(n)?;
                    let size = self.fill(&mut conn).await.map_err(Error::Read)?;
                    if size == 0 && self.len > 0 {
                        return Err(Error::PeerDisconnectedMidMessage);
                    }
                    if size == 0 {
                        return Err(Error::PeerDisconnected);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
