//! Minimal server-sent-events framing.
//!
//! Turns a raw byte stream into the sequence of `data:` payloads it
//! carries. Payloads may be split across arbitrary byte-chunk boundaries;
//! `event:` fields, comments, and blank separator lines are skipped. The
//! caller interprets the payloads (JSON or the `[DONE]` sentinel).

use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};

use crate::error::ProviderError;

struct Parser {
    inner: BoxStream<'static, Result<Bytes, ProviderError>>,
    buf: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

/// Extract complete lines from `buf`, queueing `data:` payloads.
fn drain_lines(buf: &mut Vec<u8>, pending: &mut VecDeque<String>) {
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = buf.drain(..=pos).collect();
        line.pop(); // '\n'
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        queue_data_line(&line, pending);
    }
}

fn queue_data_line(line: &[u8], pending: &mut VecDeque<String>) {
    let Ok(text) = std::str::from_utf8(line) else {
        return;
    };
    if let Some(payload) = text.strip_prefix("data:") {
        pending.push_back(payload.trim_start().to_string());
    }
}

/// Parse a byte stream into its `data:` payloads.
///
/// Transport errors map to their item position in the output; the stream
/// ends after the first error. A final line without a trailing newline is
/// still delivered.
pub(crate) fn data_events<S>(inner: S) -> impl Stream<Item = Result<String, ProviderError>> + Send
where
    S: Stream<Item = Result<Bytes, ProviderError>> + Send + 'static,
{
    let parser = Parser {
        inner: inner.boxed(),
        buf: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures_util::stream::unfold(parser, |mut p| async move {
        loop {
            if let Some(event) = p.pending.pop_front() {
                return Some((Ok(event), p));
            }
            if p.done {
                return None;
            }
            match p.inner.next().await {
                Some(Ok(chunk)) => {
                    p.buf.extend_from_slice(&chunk);
                    drain_lines(&mut p.buf, &mut p.pending);
                }
                Some(Err(e)) => {
                    p.done = true;
                    return Some((Err(e), p));
                }
                None => {
                    p.done = true;
                    if !p.buf.is_empty() {
                        let tail = std::mem::take(&mut p.buf);
                        queue_data_line(&tail, &mut p.pending);
                    }
                }
            }
        }
    })
}
