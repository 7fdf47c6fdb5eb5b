use std::io;

use bytes::{Bytes, BytesMut};
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Result of reading a length-prefixed data block.
#[derive(Debug, Eq, PartialEq)]
pub enum Chunk {
    /// The block, without its trailing CRLF.
    Data(Bytes),
    /// `n` bytes arrived but the two after them were not CRLF. Both the data
    /// and those two bytes have been consumed.
    MissingCrlf,
}

/// Reads CRLF-terminated command lines and the raw data blocks that follow
/// some of them.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Stores data that's been read in but not yet handed out.
    buf: BytesMut,
    /// Index in buf from which a valid CRLF pair may appear (and before which
    /// a CRLF sequence hasn't been seen).
    maybe_crlf_from: usize,
    /// Data source
    reader: T,
    /// On a reading error, this field is set and its value returned once the
    /// buffer is drained of pending lines.
    pending_error: Option<io::Error>,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    /// Reads a line from the internal buffer and/or reader. On an end-of-stream
    /// condition, returns a None result, discarding any partly-read line in the
    /// internal buffer.
    ///
    /// This function is cancel-safe: its only async operation is a `read_buf`
    /// against the internal `reader`, and so it has the same guarantees:
    /// either a complete read occurs and is processed, or this is cancelled.
    ///
    /// On a read error, the error value is returned after processing all
    /// pending lines in the internal buffer, but calling `read_line` again will
    /// attempt a new read safely.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // Scan from one byte before the newest data, in case a \r ended
            // the previous read and its \n starts this one. Lines already
            // buffered are returned before any further read.
            if let Some(eoc) = self
                .buf
                .iter()
                .skip(self.maybe_crlf_from)
                .tuple_windows::<(_, _)>()
                .position(|x| x == (&b'\r', &b'\n'))
            {
                let line =
                    self.buf.split_to(self.maybe_crlf_from + eoc + 2).freeze();

                // Drop trailing b"\r\n".
                let line = line.slice(0..line.len() - 2);

                self.maybe_crlf_from = 0;

                return Ok(Some(line));
            }

            let n_bytes_read = self.fill().await;

            // Point maybe_crlf_from at the byte before the ones just read
            // (and 0 if buf was empty).
            self.maybe_crlf_from =
                self.buf.len().saturating_sub(n_bytes_read + 1);

            // Reading nothing means the stream is done; a partial line can
            // never complete.
            if n_bytes_read == 0 {
                return self.finish();
            }
        }
    }

    /// Reads an `n`-byte data block and its CRLF terminator. Data in the
    /// block is taken verbatim, CRLFs included. Returns None if the stream
    /// ends first.
    ///
    /// Not cancel-safe in the sense of `read_line`: a cancelled call leaves
    /// the partial block buffered, to be read as a line.
    pub async fn read_chunk(&mut self, n: usize) -> io::Result<Option<Chunk>> {
        let want = n + 2;

        while self.buf.len() < want {
            if self.fill().await == 0 {
                return self.finish();
            }
        }

        let mut data = self.buf.split_to(want).freeze();
        let trailer = data.split_off(n);
        self.maybe_crlf_from = 0;

        if trailer[..] == b"\r\n"[..] {
            Ok(Some(Chunk::Data(data)))
        } else {
            Ok(Some(Chunk::MissingCrlf))
        }
    }

    /// Reads once into the buffer. Errors are parked in `pending_error` and
    /// reported as a zero-byte read.
    async fn fill(&mut self) -> usize {
        match self.reader.read_buf(&mut self.buf).await {
            Ok(n) => n,
            Err(e) => {
                self.pending_error = Some(e);
                0
            },
        }
    }

    fn finish<R>(&mut self) -> io::Result<Option<R>> {
        match self.pending_error.take() {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_crlf_from: 0,
            reader: value,
            pending_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{self, AsyncWriteExt};
    use tokio::task::yield_now;

    /// Feeds `parts` into a duplex pipe one write at a time, then closes it.
    fn feed(parts: &'static [&'static [u8]]) -> io::DuplexStream {
        // Set the buffer large enough that our tests will never overflow it.
        // We can ensure correct fragmentation of reads by explicitly yielding
        // between each.
        let (mut client, server) = io::duplex(4096);

        tokio::spawn(async move {
            for buf in parts {
                client.write_all(buf).await.unwrap();
                yield_now().await;
            }
        });

        server
    }

    #[tokio::test]
    async fn test_lines() {
        // When properly read, each nth line should read b"test:{n}".
        let server = feed(&[
            // Simple reassembly
            b"test:",
            b"1\r\n",
            // Split LF
            b"test:",
            b"2\r",
            b"\n",
            // Split CRLF
            b"test:",
            b"3",
            b"\r",
            b"\n",
            // Pipelined commands
            b"test:4\r\ntest:5\r\n",
            b"test:6\r",
            b"\ntest:7\r\n",
            b"test:8",
            b"\r\ntest:9\r\n",
        ]);

        let mut lr: LineReader<_> = server.into();

        for n in 1..=9 {
            assert_eq!(
                lr.read_line().await.unwrap().unwrap(),
                format!("test:{n}")
            );
        }

        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chunks_between_lines() {
        let server = feed(&[
            b"submit u1 - - 6\r\nab\r",
            b"\ncd\r\n",
            b"stats\r\n",
            b"submit u1 - - 2\r\nxyz\r\n",
            b"quit\r\n",
        ]);

        let mut lr: LineReader<_> = server.into();

        assert_eq!(lr.read_line().await.unwrap().unwrap(), "submit u1 - - 6");
        // The block may itself contain CRLF.
        assert_eq!(
            lr.read_chunk(6).await.unwrap(),
            Some(Chunk::Data(Bytes::from_static(b"ab\r\ncd")))
        );
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "stats");

        assert_eq!(lr.read_line().await.unwrap().unwrap(), "submit u1 - - 2");
        assert_eq!(lr.read_chunk(2).await.unwrap(), Some(Chunk::MissingCrlf));
        // "z\r" went with the bad block, leaving a stray "\n".
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "\nquit");

        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chunk_cut_short() {
        let server = feed(&[b"abc"]);
        let mut lr: LineReader<_> = server.into();

        assert_eq!(lr.read_chunk(10).await.unwrap(), None);
    }
}
