//! Content-Length message framing for stream sockets (TCP, Unix).
//!
//! HTTP-style headers delimit each JSON body, the same framing the Language
//! Server Protocol uses:
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! Header names are matched case-insensitively and both CRLF and LF line
//! endings are accepted.

use anyhow::{anyhow, Context, Result};
use futures::{sink, stream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::warn;

use super::Transport;
use crate::error::LinkError;

/// Maximum message size (100MB) to prevent OOM from malicious/buggy servers.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Read one framed message.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between
/// messages. A close in the middle of a message is an error.
///
/// # Errors
///
/// - No Content-Length header before the blank line
/// - Content-Length exceeds [`MAX_MESSAGE_SIZE`]
/// - The body is truncated or not valid UTF-8
pub async fn read_message<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .context("Failed to read header line")?;

        if bytes_read == 0 {
            if saw_header {
                return Err(anyhow!("Connection closed in the middle of a message"));
            }
            return Ok(None);
        }
        saw_header = true;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }

        if let Some((key, value)) = trimmed.split_once(':') {
            if key.trim().eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(
                    value
                        .parse()
                        .with_context(|| format!("Invalid Content-Length value: {}", value))?,
                );
            }
        }
    }

    let size = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;
    if size > MAX_MESSAGE_SIZE {
        return Err(anyhow!(
            "Message size {} exceeds maximum {} bytes",
            size,
            MAX_MESSAGE_SIZE
        ));
    }

    let mut body = vec![0u8; size];
    reader
        .read_exact(&mut body)
        .await
        .context("Failed to read message body")?;

    String::from_utf8(body)
        .map(Some)
        .context("Message body is not valid UTF-8")
}

/// Write one framed message and flush.
pub async fn write_message<W>(writer: &mut W, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", body.len());

    writer
        .write_all(header.as_bytes())
        .await
        .context("Failed to write message header")?;
    writer
        .write_all(body.as_bytes())
        .await
        .context("Failed to write message body")?;
    writer.flush().await.context("Failed to flush message")?;

    Ok(())
}

/// Wrap the two halves of a byte stream into a frame [`Transport`].
///
/// The inbound stream ends at a clean EOF. A framing error is yielded once,
/// after which the stream ends too.
pub fn framed_transport<R, W>(reader: R, writer: W) -> Transport
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let inbound = stream::unfold(Some(BufReader::new(reader)), |state| async move {
        let mut reader = state?;
        match read_message(&mut reader).await {
            Ok(Some(frame)) => Some((Ok(frame), Some(reader))),
            Ok(None) => None,
            Err(e) => {
                warn!("Framing error: {:#}", e);
                Some((Err(LinkError::ConnectionLost), None))
            }
        }
    });

    let outbound = sink::unfold(writer, |mut writer, frame: String| async move {
        write_message(&mut writer, &frame)
            .await
            .map_err(|e| LinkError::ConnectionFailed(format!("{:#}", e)))?;
        Ok::<_, LinkError>(writer)
    });

    Transport::new(outbound, inbound)
}
