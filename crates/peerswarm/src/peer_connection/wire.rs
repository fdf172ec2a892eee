// The two I/O loops of a connection. The writer drains the outgoing queue in
// FIFO order; the reader turns the byte stream into events for the control loop.

use peer_binary_protocol::{Message, Piece, piece_message_len};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc::UnboundedReceiver,
    time::timeout,
};
use tracing::trace;

use crate::{
    Error,
    options::PeerConnectionOptions,
    read_buf::ReadBuf,
    type_aliases::PeerEventTx,
};

use super::{PeerConnectionHandler, PeerEvent, WriterRequest, session::CancelledUploads};

/// Send our bitfield, then everything queued for this peer. When nothing was
/// queued for `keep_alive_interval`, a keep-alive goes out and the control loop
/// is told about it. Returns once the queue is closed.
pub async fn run_writer<H: PeerConnectionHandler>(
    handler: &H,
    mut conn: impl AsyncWrite + Unpin,
    mut rx: UnboundedReceiver<WriterRequest>,
    events: &PeerEventTx,
    cancelled: &CancelledUploads,
    options: &PeerConnectionOptions,
    block_size: u32,
) -> crate::Result<()> {
    let rwtimeout = options.read_write_timeout;
    let mut write_buf = Vec::<u8>::with_capacity(piece_message_len(block_size as usize));

    let len = handler.serialize_bitfield_message_to_buf(&mut write_buf)?;
    with_timeout_write(rwtimeout, &mut conn, &write_buf[..len]).await?;
    write_buf.clear();
    trace!("sent bitfield");

    loop {
        let (req, is_keep_alive) = match timeout(options.keep_alive_interval, rx.recv()).await {
            Ok(Some(req)) => (req, false),
            Ok(None) => {
                trace!("closing writer, channel closed");
                return Ok(());
            }
            Err(_) => (WriterRequest::Message(Message::KeepAlive), true),
        };

        let mut uploaded_add = None;

        match &req {
            WriterRequest::Message(msg) => {
                msg.serialize(&mut write_buf)?;
            }
            WriterRequest::UploadBlock(request) => {
                if cancelled.lock().remove(request) {
                    trace!(?request, "request was cancelled, not uploading");
                    continue;
                }
                let mut block = vec![0u8; request.length as usize];
                handler
                    .read_block(request, &mut block)
                    .map_err(Error::ReadBlock)?;
                Message::Piece(Piece::from_data(request.index, request.begin, block))
                    .serialize(&mut write_buf)?;
                uploaded_add = Some(request.length);
            }
        }

        trace!("sending: {:?}, length={}", &req, write_buf.len());

        with_timeout_write(rwtimeout, &mut conn, &write_buf).await?;
        write_buf.clear();

        if let Some(uploaded_add) = uploaded_add {
            handler.on_uploaded_bytes(uploaded_add);
        }
        if is_keep_alive && events.send(PeerEvent::KeepAliveSent).is_err() {
            return Ok(());
        }
    }
}

async fn with_timeout_write(
    rwtimeout: std::time::Duration,
    conn: &mut (impl AsyncWrite + Unpin),
    buf: &[u8],
) -> crate::Result<()> {
    super::with_timeout("writing", rwtimeout, async {
        conn.write_all(buf).await.map_err(Error::Write)
    })
    .await
}

/// Read messages until the stream fails or ends.
pub async fn run_reader(
    read_buf: &mut ReadBuf,
    mut conn: impl AsyncRead + Unpin,
    events: &PeerEventTx,
) -> crate::Result<()> {
    loop {
        let message = read_buf.read_message(&mut conn).await?;
        trace!("received: {:?}", &message);
        if events.send(PeerEvent::Received(message)).is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use peer_binary_protocol::Request;
    use tokio::sync::mpsc::unbounded_channel;

    use crate::{read_buf::ReadBuf, tests::test_util::MockHandler};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_after_idle_interval() {
        let handler = MockHandler::new(8);
        let (ours, mut theirs) = tokio::io::duplex(4096);
        let (_tx, rx) = unbounded_channel();
        let (events_tx, mut events_rx) = unbounded_channel();
        let cancelled = CancelledUploads::default();
        let opts = PeerConnectionOptions::default();

        let writer = run_writer(&handler, ours, rx, &events_tx, &cancelled, &opts, 16384);
        let check = async {
            let mut rb = ReadBuf::new();
            assert_eq!(
                rb.read_message(&mut theirs).await.unwrap(),
                Message::Bitfield(Bytes::from(vec![0u8]))
            );
            let before = tokio::time::Instant::now();
            assert_eq!(rb.read_message(&mut theirs).await.unwrap(), Message::KeepAlive);
            assert!(before.elapsed() >= Duration::from_secs(120));
            assert!(matches!(events_rx.recv().await, Some(PeerEvent::KeepAliveSent)));
        };
        tokio::select! {
            r = writer => panic!("writer finished early: {r:?}"),
            _ = check => {}
        }
    }

    #[tokio::test]
    async fn test_upload_skips_cancelled_requests() {
        let handler = MockHandler::new(8);
        let (ours, mut theirs) = tokio::io::duplex(1 << 20);
        let (tx, rx) = unbounded_channel();
        let (events_tx, _events_rx) = unbounded_channel();
        let cancelled = CancelledUploads::default();
        let opts = PeerConnectionOptions::default();

        let skipped = Request::new(0, 0, 16384);
        let served = Request::new(0, 16384, 16384);
        cancelled.lock().insert(skipped);
        tx.send(WriterRequest::UploadBlock(skipped)).unwrap();
        tx.send(WriterRequest::UploadBlock(served)).unwrap();
        drop(tx);

        // Smaller than the served block: the buffer grows as needed.
        let mut ours = ours;
        run_writer(&handler, &mut ours, rx, &events_tx, &cancelled, &opts, 4096)
            .await
            .unwrap();

        let mut rb = ReadBuf::new();
        assert!(matches!(
            rb.read_message(&mut theirs).await.unwrap(),
            Message::Bitfield(_)
        ));
        match rb.read_message(&mut theirs).await.unwrap() {
            Message::Piece(p) => {
                assert_eq!(p.as_request(), served);
                assert_eq!(p.block, handler.block_content(&served));
            }
            other => panic!("expected a piece, got {other:?}"),
        }
        assert_eq!(*handler.uploaded.lock(), 16384);
        assert!(cancelled.lock().is_empty());
    }
}
