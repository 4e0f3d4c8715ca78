use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

use super::Outbox;
use crate::protocol::{FrameWriter, Message, ProtocolError};

/// Drains `outbox` to the socket until the connection closes.
///
/// Writes a keepalive whenever `keepalive` passes with nothing sent; any
/// real message pushes the deadline back.
pub(crate) async fn run_writer<W>(
    outbox: Arc<Outbox>,
    mut writer: FrameWriter<W>,
    keepalive: Duration,
    mut closed: watch::Receiver<bool>,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut deadline = Instant::now() + keepalive;
    loop {
        if *closed.borrow() {
            break;
        }

        let batch = outbox.drain();
        if !batch.is_empty() {
            for msg in &batch {
                let n = writer.write_message(msg).await?;
                outbox.record_written(n);
            }
            writer.flush().await?;
            deadline = Instant::now() + keepalive;
            continue;
        }

        tokio::select! {
            _ = outbox.notified() => {}
            _ = closed.changed() => break,
            _ = sleep_until(deadline) => {
                trace!("writing keepalive");
                let n = writer.write_message(&Message::KeepAlive).await?;
                writer.flush().await?;
                outbox.record_written(n);
                deadline = Instant::now() + keepalive;
            }
        }
    }
    // best effort: the peer may already be gone
    let _ = writer.shutdown().await;
    Ok(())
}
