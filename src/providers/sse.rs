//! Line-oriented SSE scanning for upstream responses.
//!
//! Yields the payload of every `data:` line, including the `[DONE]` sentinel;
//! interpreting it is the adapter's job. Lines are capped at 1 MiB because
//! Gemini emits whole candidate deltas as single JSON lines.

use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::io::StreamReader;

use super::ProviderError;

pub const MAX_LINE_BYTES: usize = 1024 * 1024;

async fn read_line_limited<R>(reader: &mut R, out: &mut Vec<u8>) -> Result<bool, ProviderError>
where
    R: AsyncBufRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    out.clear();
    loop {
        let buf = reader
            .fill_buf()
            .await
            .map_err(|err| ProviderError::Transport(format!("failed to read SSE line: {err}")))?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }

        let newline = buf.iter().position(|b| *b == b'\n');
        let take = newline.map(|pos| pos + 1).unwrap_or(buf.len());
        if out.len().saturating_add(take) > MAX_LINE_BYTES {
            return Err(ProviderError::Decode(format!(
                "SSE line exceeds {MAX_LINE_BYTES} bytes"
            )));
        }
        out.extend_from_slice(&buf[..take]);
        reader.consume(take);

        if newline.is_some() {
            return Ok(true);
        }
    }
}

/// Stream of `data:` payloads from an SSE reader.
pub fn data_lines_from_reader<R>(reader: R) -> BoxStream<'static, Result<String, ProviderError>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        (reader, Vec::<u8>::new()),
        |(mut reader, mut line)| async move {
            loop {
                if !read_line_limited(&mut reader, &mut line).await? {
                    return Ok(None);
                }
                let text = std::str::from_utf8(&line)
                    .map_err(|err| ProviderError::Decode(format!("invalid SSE UTF-8: {err}")))?;
                let text = text.trim_end_matches(['\r', '\n']);
                let Some(payload) = text.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim_start();
                if payload.is_empty() {
                    continue;
                }
                let payload = payload.to_string();
                return Ok(Some((payload, (reader, line))));
            }
        },
    ))
}

/// Stream of `data:` payloads from an upstream HTTP response body.
pub fn data_lines(response: reqwest::Response) -> BoxStream<'static, Result<String, ProviderError>> {
    let bytes = response.bytes_stream().map_err(std::io::Error::other);
    data_lines_from_reader(BufReader::new(StreamReader::new(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::StreamExt;

    fn reader_for(raw: &str) -> impl AsyncBufRead + Unpin + Send + 'static {
        let chunks = [Ok::<_, std::io::Error>(Bytes::from(raw.to_string()))];
        BufReader::new(StreamReader::new(stream::iter(chunks)))
    }

    #[tokio::test]
    async fn yields_each_data_payload_including_done() {
        let raw = concat!(
            "event: message\n",
            "data: {\"a\":1}\n",
            "\n",
            ": keepalive\n",
            "data: [DONE]\n\n",
        );
        let mut lines = data_lines_from_reader(reader_for(raw));
        let mut out = Vec::new();
        while let Some(item) = lines.next().await {
            out.push(item.unwrap());
        }
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[tokio::test]
    async fn crlf_lines_are_trimmed() {
        let raw = "data: hello\r\n\r\n";
        let mut lines = data_lines_from_reader(reader_for(raw));
        assert_eq!(lines.next().await.unwrap().unwrap(), "hello");
        assert!(lines.next().await.is_none());
    }

    #[tokio::test]
    async fn oversized_lines_error_out() {
        let raw = format!("data: {}\n\n", "x".repeat(MAX_LINE_BYTES + 16));
        let mut lines = data_lines_from_reader(reader_for(&raw));
        let err = lines.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));
    }

    #[tokio::test]
    async fn stream_without_trailing_newline_still_yields() {
        let raw = "data: tail";
        let mut lines = data_lines_from_reader(reader_for(raw));
        assert_eq!(lines.next().await.unwrap().unwrap(), "tail");
        assert!(lines.next().await.is_none());
    }
}
