//! Record splitter for child-process output.
//!
//! FFmpeg rewrites its status line with bare carriage returns. A plain
//! `lines()` reader would only surface those updates once a `\n` arrives,
//! which can be minutes apart, and the stall watchdog would misfire. Records
//! here end at either `\r` or `\n`.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound for a single record; longer runs are split.
const MAX_RECORD_LEN: usize = 64 * 1024;

/// Yields trimmed, non-empty text records delimited by `\r` or `\n`.
pub struct OutputRecordReader<R> {
    inner: R,
    buf: Vec<u8>,
    eof: bool,
}

impl<R> OutputRecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
            eof: false,
        }
    }

    /// Returns the next record, or `None` at end of stream.
    ///
    /// Cancel-safe: bytes already read stay buffered if the future is dropped.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(record) = self.take_record() {
                return Ok(Some(record));
            }
            if self.eof {
                return Ok(self.take_tail());
            }

            let mut chunk = [0u8; 4096];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    fn take_record(&mut self) -> Option<String> {
        loop {
            let cut = match self.buf.iter().position(|&b| b == b'\n' || b == b'\r') {
                Some(idx) => idx,
                None if self.buf.len() >= MAX_RECORD_LEN => MAX_RECORD_LEN,
                None => return None,
            };
            let record: Vec<u8> = self.buf.drain(..cut).collect();
            let delimiters = self
                .buf
                .iter()
                .take_while(|&&b| b == b'\n' || b == b'\r')
                .count();
            self.buf.drain(..delimiters);

            let text = String::from_utf8_lossy(&record).trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }

    fn take_tail(&mut self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        (!text.is_empty()).then_some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn collect(input: &'static [u8]) -> Vec<String> {
        let (mut tx, rx) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = tx.write_all(input).await;
        });

        let mut reader = OutputRecordReader::new(rx);
        let mut records = Vec::new();
        while let Some(record) = reader.next_record().await.unwrap() {
            records.push(record);
        }
        records
    }

    #[tokio::test]
    async fn splits_on_cr_and_lf() {
        assert_eq!(
            collect(b"one\rtwo\nthree\r\nfour").await,
            vec!["one", "two", "three", "four"]
        );
    }

    #[tokio::test]
    async fn skips_blank_records() {
        assert_eq!(collect(b"\r\n  \n\ra\r\r\rb\n").await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn status_rewrites_arrive_individually() {
        let records = collect(
            b"Duration: 00:00:10.00, start: 0.0\nsize=1kB time=00:00:01.00\rsize=2kB time=00:00:02.00\r",
        )
        .await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[2], "size=2kB time=00:00:02.00");
    }
}
