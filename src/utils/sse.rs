//! Bounded `text/event-stream` decoding.
//!
//! Frames are delimited by a blank line. `data:` lines are joined with `\n`,
//! the last `event:` line names the frame, and comment lines (`:`) are skipped.
//! A trailing frame without its blank line is still yielded at end of input.

use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

use crate::{FlowgateError, Result};

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

struct FrameDecoder<R> {
    reader: R,
    line: Vec<u8>,
    frame: SseFrame,
    has_data: bool,
    limits: SseLimits,
}

impl<R> FrameDecoder<R>
where
    R: AsyncBufRead + Unpin,
{
    fn new(reader: R, limits: SseLimits) -> Self {
        Self {
            reader,
            line: Vec::new(),
            frame: SseFrame::default(),
            has_data: false,
            limits,
        }
    }

    async fn read_line(&mut self) -> Result<bool> {
        self.line.clear();
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(!self.line.is_empty());
            }

            let newline_pos = buf.iter().position(|b| *b == b'\n');
            let take_len = newline_pos.map(|pos| pos + 1).unwrap_or(buf.len());
            if self.line.len().saturating_add(take_len) > self.limits.max_line_bytes {
                return Err(FlowgateError::InvalidResponse(format!(
                    "SSE line exceeds max_line_bytes={}",
                    self.limits.max_line_bytes
                )));
            }

            self.line.extend_from_slice(&buf[..take_len]);
            self.reader.consume(take_len);
            if newline_pos.is_some() {
                return Ok(true);
            }
        }
    }

    fn take_frame(&mut self) -> Option<SseFrame> {
        if !self.has_data {
            self.frame = SseFrame::default();
            return None;
        }
        self.has_data = false;
        Some(std::mem::take(&mut self.frame))
    }

    async fn next_frame(&mut self) -> Result<Option<SseFrame>> {
        if self.limits.max_line_bytes == 0 || self.limits.max_event_bytes == 0 {
            return Err(FlowgateError::InvalidResponse(
                "SSE limits must be > 0".to_string(),
            ));
        }

        loop {
            if !self.read_line().await? {
                return Ok(self.take_frame());
            }

            let line = std::str::from_utf8(&self.line)
                .map_err(|err| FlowgateError::InvalidResponse(format!("invalid SSE UTF-8: {err}")))?
                .trim_end_matches(['\r', '\n'])
                .to_string();

            if line.is_empty() {
                if let Some(frame) = self.take_frame() {
                    return Ok(Some(frame));
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_str(), ""),
            };
            match field {
                "event" => self.frame.event = Some(value.to_string()),
                "data" => {
                    let separator = usize::from(self.has_data);
                    let next_len = self
                        .frame
                        .data
                        .len()
                        .saturating_add(separator)
                        .saturating_add(value.len());
                    if next_len > self.limits.max_event_bytes {
                        return Err(FlowgateError::InvalidResponse(format!(
                            "SSE event exceeds max_event_bytes={}",
                            self.limits.max_event_bytes
                        )));
                    }
                    if self.has_data {
                        self.frame.data.push('\n');
                    }
                    self.frame.data.push_str(value);
                    self.has_data = true;
                }
                _ => {}
            }
        }
    }
}

pub fn sse_frames_from_reader_with_limits<R>(
    reader: R,
    limits: SseLimits,
) -> BoxStream<'static, Result<SseFrame>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        FrameDecoder::new(reader, limits),
        |mut decoder| async move {
            let frame = decoder.next_frame().await?;
            Ok(frame.map(|frame| (frame, decoder)))
        },
    ))
}

pub fn sse_frames_from_reader<R>(reader: R) -> BoxStream<'static, Result<SseFrame>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    sse_frames_from_reader_with_limits(reader, SseLimits::default())
}

pub fn sse_frames_from_response(
    response: reqwest::Response,
    limits: SseLimits,
) -> BoxStream<'static, Result<SseFrame>> {
    let byte_stream = response.bytes_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(byte_stream);
    sse_frames_from_reader_with_limits(tokio::io::BufReader::new(reader), limits)
}
