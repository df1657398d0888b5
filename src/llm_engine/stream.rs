//! Newline-delimited JSON stream decoder
//!
//! Turns a byte stream (an HTTP response body) into a lazy sequence of
//! independently parsed JSON records. Records may arrive split across any
//! number of reads.

use std::fmt::Display;
use std::pin::Pin;

use futures_util::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;

use crate::llm_engine::provider::LlmError;

/// Decoder state shared across reads
struct NdjsonDecoder<S> {
    /// `None` once the source has ended or failed; dropping it releases the body
    source: Option<Pin<Box<S>>>,
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for a newline
    scanned: usize,
}

impl<S, B, E> NdjsonDecoder<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    fn new(source: S) -> Self {
        Self {
            source: Some(Box::pin(source)),
            buffer: Vec::new(),
            scanned: 0,
        }
    }

    /// Produce the next record, reading more input as needed.
    ///
    /// Lines are split on raw bytes, so a multi-byte character cut in half by
    /// a read boundary is only decoded once both halves are buffered.
    async fn next_record<T: DeserializeOwned>(&mut self) -> Option<Result<T, LlmError>> {
        loop {
            while let Some(newline) = self.buffer[self.scanned..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.scanned + offset)
            {
                let line: Vec<u8> = self.buffer.drain(..=newline).collect();
                self.scanned = 0;
                let text = String::from_utf8_lossy(&line[..newline]);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }

                match serde_json::from_str::<T>(text) {
                    Ok(record) => {
                        crate::stream_trace!("Decoded stream record ({} bytes)", text.len());
                        return Some(Ok(record));
                    }
                    Err(e) => {
                        // A corrupt line mid-stream is recoverable; later lines may still parse.
                        log::warn!("Skipping malformed stream line {:?}: {}", text, e);
                    }
                }
            }
            self.scanned = self.buffer.len();

            let next = match self.source.as_mut() {
                Some(source) => source.next().await,
                None => return None,
            };

            match next {
                Some(Ok(bytes)) => {
                    crate::stream_trace!("Read {} bytes from stream", bytes.as_ref().len());
                    self.buffer.extend_from_slice(bytes.as_ref());
                }
                Some(Err(e)) => {
                    self.source = None;
                    self.buffer.clear();
                    self.scanned = 0;
                    log::error!("Stream read failed: {}", e);
                    return Some(Err(LlmError::Stream(e.to_string())));
                }
                None => {
                    self.source = None;
                    self.scanned = 0;
                    let rest = std::mem::take(&mut self.buffer);
                    let text = String::from_utf8_lossy(&rest);
                    let text = text.trim();
                    if text.is_empty() {
                        crate::stream_debug!("Stream ended cleanly");
                        return None;
                    }

                    // Nothing can follow to repair a bad final fragment.
                    return Some(serde_json::from_str::<T>(text).map_err(|e| {
                        log::error!("Error parsing final JSON chunk {:?}: {}", text, e);
                        LlmError::Decode(e.to_string())
                    }));
                }
            }
        }
    }
}

/// Decode an NDJSON byte stream into records of type `T`.
///
/// The returned stream is finite and not restartable. Malformed lines in the
/// middle of the stream are logged and skipped; a malformed trailing fragment
/// (no newline before end of input) fails the stream with
/// [`LlmError::Decode`]. A read error ends the stream with
/// [`LlmError::Stream`]. Dropping the returned stream drops the source.
pub fn decode_ndjson<T, S, B, E>(source: S) -> impl Stream<Item = Result<T, LlmError>> + Send
where
    T: DeserializeOwned + Send,
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    stream::unfold(NdjsonDecoder::new(source), |mut decoder| async move {
        let record = decoder.next_record::<T>().await?;
        Some((record, decoder))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    type Read = Result<Vec<u8>, std::io::Error>;

    async fn decode_reads(reads: Vec<Read>) -> Vec<Result<Value, LlmError>> {
        decode_ndjson::<Value, _, _, _>(stream::iter(reads)).collect().await
    }

    fn split_every(input: &[u8], size: usize) -> Vec<Read> {
        input.chunks(size).map(|c| Ok(c.to_vec())).collect()
    }

    const SAMPLE: &str = concat!(
        "{\"message\":{\"role\":\"assistant\",\"content\":\"h\u{e9}llo \"},\"done\":false}\n",
        "\n",
        "{\"message\":{\"role\":\"assistant\",\"content\":\"\u{65e5}\u{672c} \u{1f980}\"},\"done\":false}\r\n",
        "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
    );

    #[tokio::test]
    async fn test_whole_input() {
        let records = decode_reads(vec![Ok(SAMPLE.as_bytes().to_vec())]).await;
        assert_eq!(records.len(), 3);
        let values: Vec<Value> = records.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values[0]["message"]["content"], "h\u{e9}llo ");
        assert_eq!(values[1]["message"]["content"], "\u{65e5}\u{672c} \u{1f980}");
        assert_eq!(values[2]["done"], true);
    }

    #[tokio::test]
    async fn test_split_invariance() {
        let bytes = SAMPLE.as_bytes();
        let expected: Vec<Value> = decode_reads(vec![Ok(bytes.to_vec())])
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        for size in 1..=bytes.len() {
            let got: Vec<Value> = decode_reads(split_every(bytes, size))
                .await
                .into_iter()
                .map(|r| r.unwrap())
                .collect();
            assert_eq!(got, expected, "read size {}", size);
        }
    }

    #[tokio::test]
    async fn test_irregular_boundaries_and_empty_reads() {
        let bytes = SAMPLE.as_bytes();
        let mut reads: Vec<Read> = Vec::new();
        let cuts = [0usize, 3, 3, 17, 18, 60, 61, 62, 100, bytes.len()];
        for pair in cuts.windows(2) {
            reads.push(Ok(bytes[pair[0]..pair[1]].to_vec()));
        }

        let got = decode_reads(reads).await;
        assert_eq!(got.len(), 3);
        assert!(got.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_malformed_mid_stream_line_is_skipped() {
        let input = "{\"a\":1}\n{not json\n{\"a\":2}\n";
        let got = decode_reads(vec![Ok(input.as_bytes().to_vec())]).await;
        let values: Vec<Value> = got.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[tokio::test]
    async fn test_final_fragment_without_newline_is_parsed() {
        let got = decode_reads(split_every(b"{\"a\":1}\n{\"a\":2}", 4)).await;
        let values: Vec<Value> = got.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[tokio::test]
    async fn test_invalid_final_fragment_fails() {
        let got = decode_reads(vec![Ok(b"{\"a\":1}\n{\"a\":".to_vec())]).await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].as_ref().unwrap(), &json!({"a": 1}));
        assert!(matches!(got[1], Err(LlmError::Decode(_))));
    }

    #[tokio::test]
    async fn test_whitespace_final_fragment_completes_cleanly() {
        let got = decode_reads(vec![Ok(b"{\"a\":1}\n  \r\n ".to_vec())]).await;
        assert_eq!(got.len(), 1);
        assert!(got[0].is_ok());

        let empty = decode_reads(vec![]).await;
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_read_error_ends_stream() {
        let reads: Vec<Read> = vec![
            Ok(b"{\"a\":1}\n{\"a\"".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(b":2}\n".to_vec()),
        ];
        let got = decode_reads(reads).await;
        assert_eq!(got.len(), 2);
        assert!(got[0].is_ok());
        assert!(matches!(&got[1], Err(LlmError::Stream(msg)) if msg.contains("reset")));
    }

    #[tokio::test]
    async fn test_early_drop_releases_source() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(dropped.clone());
        let source = stream::iter(vec![Ok::<_, std::io::Error>(b"{\"a\":1}\n{\"a\":2}\n".to_vec())])
            .map(move |read| {
                let _keep = &flag;
                read
            });

        let mut records = Box::pin(decode_ndjson::<Value, _, _, _>(source));
        assert!(records.next().await.unwrap().is_ok());
        assert!(!dropped.load(Ordering::SeqCst));
        drop(records);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_decodes_http_body_chunks() {
        let reads: Vec<Result<bytes::Bytes, std::io::Error>> = vec![
            Ok(bytes::Bytes::from_static(b"{\"done\":fal")),
            Ok(bytes::Bytes::from_static(b"se}\n{\"done\":true}")),
        ];
        let got: Vec<Result<Value, LlmError>> =
            decode_ndjson(stream::iter(reads)).collect().await;

        assert_eq!(got.len(), 2);
        assert_eq!(got[0].as_ref().unwrap(), &json!({"done": false}));
        assert_eq!(got[1].as_ref().unwrap(), &json!({"done": true}));
    }

    #[tokio::test]
    async fn test_long_record_in_small_reads() {
        use futures_util::FutureExt;
        use tokio::sync::mpsc;

        let content = "x".repeat(64 * 1024);
        let line = format!("{}\n{{\"done\":true}}\n", json!({"content": content}));
        let bytes = line.as_bytes();
        let first_newline = bytes.iter().position(|b| *b == b'\n').unwrap();

        let (tx, rx) = mpsc::unbounded_channel::<Read>();
        let source = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|r| (r, rx)) });
        let mut decoder = NdjsonDecoder::new(source);

        for read in bytes[..first_newline].chunks(7) {
            tx.send(Ok(read.to_vec())).unwrap();
        }
        assert!(decoder.next_record::<Value>().now_or_never().is_none());
        assert_eq!(decoder.buffer.len(), first_newline);
        assert_eq!(decoder.scanned, first_newline);

        for read in bytes[first_newline..].chunks(7) {
            tx.send(Ok(read.to_vec())).unwrap();
        }
        drop(tx);

        let first = decoder.next_record::<Value>().await.unwrap().unwrap();
        assert_eq!(first["content"].as_str().map(str::len), Some(64 * 1024));
        assert_eq!(decoder.scanned, 0);

        let second = decoder.next_record::<Value>().await.unwrap().unwrap();
        assert_eq!(second, json!({"done": true}));
        assert!(decoder.next_record::<Value>().await.is_none());
    }
}
