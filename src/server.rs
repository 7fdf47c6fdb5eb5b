//! TCP front end speaking the line-based control protocol.
use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{StatusError, SubmitError};
use crate::line_reader::{Chunk, LineReader};
use crate::parser::ParsingError;
use crate::queue::JobQueue;
use crate::status::StatusStore;
use crate::types::job::{JobId, UploadPayload};
use crate::types::protocol::{Command, Response};
use crate::types::serialisable::WireSerialisable;
use crate::util::bytes_to_human_str;

#[derive(Clone)]
pub struct ControlServer {
    queue: JobQueue,
    status: StatusStore,
}

impl ControlServer {
    pub fn new(queue: JobQueue, status: StatusStore) -> Self {
        Self { queue, status }
    }

    /// Accepts connections until `cancel` fires, handling each as its own
    /// task. Each task holds a clone of `shutdown_hold` until it finishes.
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
        shutdown_hold: mpsc::Sender<()>,
    ) -> Result<()> {
        info!(addr = %listener.local_addr()?, "listening");

        loop {
            let conn = match select! {
                accept = listener.accept() => accept,
                _ = cancel.cancelled() => break,
            } {
                Ok((conn, _)) => conn,
                Err(error) => {
                    warn!(%error, "failed to accept connection");
                    continue;
                },
            };

            let server = self.clone();
            let cancel = cancel.clone();
            let hold = shutdown_hold.clone();
            tokio::spawn(async move {
                server.begin_handle(cancel, hold, conn).await
            });
        }

        Ok(())
    }

    #[instrument(
        name = "handle",
        err,
        fields(peer = %conn.peer_addr()?),
        skip_all
    )]
    async fn begin_handle(
        &self,
        cancel: CancellationToken,
        _shutdown_hold: mpsc::Sender<()>,
        mut conn: TcpStream,
    ) -> Result<()> {
        debug!("accepted connection");

        conn.set_nodelay(true).context("setting NODELAY")?;

        let ret = self.handle_conn(cancel, &mut conn).await;

        conn.shutdown().await.context("during shutdown")?;

        debug!("closed connection");

        ret
    }

    /// Serves one client until it quits, disconnects, or `cancel` fires.
    pub async fn handle_conn<S>(
        &self,
        cancel: CancellationToken,
        conn: S,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (r, mut w) = tokio::io::split(conn);
        let mut r: LineReader<_> = r.into();

        loop {
            let line = select!(
               x = r.read_line() => match x? {
                    Some(x) => x,
                    None => return Ok(()),
               },
               _ = cancel.cancelled() => return Ok(()),
            );

            trace!(line = bytes_to_human_str(&line), "processing command");

            let cmd: Result<Command, ParsingError> =
                (&line as &[u8]).try_into();

            let resp = match cmd {
                Ok(Command::Quit) => return Ok(()),
                Ok(Command::Submit {
                    owner,
                    category,
                    label,
                    n_bytes,
                }) => {
                    let n_bytes = n_bytes as usize;
                    if n_bytes > self.queue.config().max_image_size {
                        // The body can't be skipped cheaply; drop the client.
                        let resp = Response::JobTooBig.serialise_wire();
                        w.write_all(&resp).await?;
                        w.flush().await?;
                        return Ok(());
                    }

                    let data = select! {
                        x = r.read_chunk(n_bytes) => x?,
                        _ = cancel.cancelled() => return Ok(()),
                    };
                    let resp = match data {
                        None => return Ok(()),
                        Some(Chunk::MissingCrlf) => Response::ExpectedCRLF,
                        Some(Chunk::Data(image)) => {
                            self.submit(owner, category, label, image)
                        },
                    };
                    resp.serialise_wire()
                },
                Ok(cmd) => self.query(cmd).serialise_wire(),
                Err(error) => error.serialise_wire(),
            };

            // Slightly convoluted, but ensures we write out the buffer properly
            // with cancel safety.
            select! {
                x = w.write_all(&resp) => x?,
                _ = cancel.cancelled() => return Ok(()),
            };
            select! {
                x = w.flush() => x?,
                _ = cancel.cancelled() => return Ok(()),
            };
        }
    }

    fn submit(
        &self,
        owner: Vec<u8>,
        category: Option<Vec<u8>>,
        label: Option<Vec<u8>>,
        image: Bytes,
    ) -> Response {
        // Name tokens are validated as ASCII by the parser.
        let text = |v: Vec<u8>| String::from_utf8_lossy(&v).into_owned();

        let mut payload = UploadPayload::new(text(owner), image);
        payload.category = category.map(text);
        payload.label = label.map(text);

        match self.queue.submit(payload) {
            Ok(id) => Response::Inserted { id },
            Err(SubmitError::ImageTooLarge { .. }) => Response::JobTooBig,
            Err(SubmitError::ShuttingDown) => Response::Draining,
            Err(error) => Response::BadUpload {
                reason: error.to_string(),
            },
        }
    }

    fn query(&self, cmd: Command) -> Response {
        match cmd {
            Command::JobStatus { id } => match self.status.job(JobId(id)) {
                Ok(data) => Response::OkJob { data },
                Err(StatusError::NotFound(_)) => Response::NotFound,
            },
            Command::QueueStatus => Response::OkQueue {
                data: self.status.queue(),
            },
            Command::RateStatus => Response::OkRate {
                data: self.status.rate_limit(),
            },
            Command::Stats => Response::OkStats {
                data: self.status.snapshot(),
            },
            // Handled by the connection loop.
            Command::Submit { .. } | Command::Quit => Response::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{self, DuplexStream};

    use super::*;
    use crate::config::QueueConfig;
    use crate::testing::{self, Fakes};

    struct Client {
        r: LineReader<io::ReadHalf<DuplexStream>>,
        w: io::WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, raw: &[u8]) {
            self.w.write_all(raw).await.unwrap();
        }

        async fn line(&mut self) -> String {
            let line = self.r.read_line().await.unwrap().unwrap();
            String::from_utf8(line.to_vec()).unwrap()
        }

        /// Reads an `OK <n>` response and returns its body.
        async fn ok_body(&mut self) -> String {
            let header = self.line().await;
            let n: usize = header.strip_prefix("OK ").unwrap().parse().unwrap();
            match self.r.read_chunk(n).await.unwrap() {
                Some(Chunk::Data(body)) => {
                    String::from_utf8(body.to_vec()).unwrap()
                },
                other => panic!("bad body: {other:?}"),
            }
        }
    }

    /// Returns a client and the queue behind it, plus the queue's shutdown
    /// token. The connection itself is never cancelled.
    fn start(config: QueueConfig) -> (Client, JobQueue, CancellationToken) {
        let fakes = Fakes::default();
        let limiter = testing::limiter();
        let cancel = CancellationToken::new();
        let queue = JobQueue::new(
            fakes.pipeline(Arc::clone(&limiter), &config),
            config,
            cancel.clone(),
        );
        let status = StatusStore::new(queue.clone(), limiter);
        let server = ControlServer::new(queue.clone(), status);

        let (client, conn) = io::duplex(64 * 1024);
        tokio::spawn(async move {
            server
                .handle_conn(CancellationToken::new(), conn)
                .await
                .unwrap()
        });

        let (r, w) = io::split(client);
        (Client { r: r.into(), w }, queue, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_and_poll() {
        let (mut c, queue, _cancel) = start(QueueConfig::default());

        c.send(b"submit user-1 shoes - 5\r\nimage\r\n").await;
        assert_eq!(c.line().await, "INSERTED 1");

        queue.wait_terminal(JobId(1)).await.unwrap();

        c.send(b"job-status 1\r\n").await;
        let body = c.ok_body().await;
        assert!(body.contains("status: completed"), "{body}");
        assert!(body.contains("category: Shoes"), "{body}");
        assert!(body.contains("retry-count: 0"), "{body}");

        c.send(b"job-status 2\r\n").await;
        assert_eq!(c.line().await, "NOT_FOUND");

        c.send(b"queue-status\r\nrate-status\r\nstats\r\n").await;
        assert!(c.ok_body().await.contains("completed: 1"));
        assert!(c.ok_body().await.contains("calls-in-window: 2"));
        let stats = c.ok_body().await;
        assert!(stats.contains("queue:") && stats.contains("rate-limit:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_errors() {
        let (mut c, queue, _cancel) = start(QueueConfig {
            max_image_size: 8,
            ..Default::default()
        });

        c.send(b"put 0 0 0 1\r\n").await;
        assert_eq!(c.line().await, "UNKNOWN_COMMAND");

        c.send(b"job-status x\r\n").await;
        assert_eq!(c.line().await, "BAD_FORMAT");

        c.send(b"submit u1 - - 3\r\nabcde\r\n").await;
        assert_eq!(c.line().await, "EXPECTED_CRLF");
        // "de" went with the bad block; the CRLF left over is an empty line.
        assert_eq!(c.line().await, "BAD_FORMAT");

        c.send(b"submit u1 - - 0\r\n\r\n").await;
        assert_eq!(c.line().await, "BAD_UPLOAD no image uploaded");
        assert_eq!(queue.queue_status().length, 0);

        c.send(b"submit u1 - - 9\r\n").await;
        assert_eq!(c.line().await, "JOB_TOO_BIG");
        assert!(c.r.read_line().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quit() {
        let (mut c, _queue, _cancel) = start(QueueConfig::default());

        c.send(b"quit\r\nstats\r\n").await;
        assert!(c.r.read_line().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_while_draining() {
        let (mut c, queue, cancel) = start(QueueConfig::default());
        cancel.cancel();

        c.send(b"submit u1 - - 3\r\nabc\r\n").await;
        assert_eq!(c.line().await, "DRAINING");

        // Queries keep working.
        c.send(b"queue-status\r\n").await;
        assert!(c.ok_body().await.contains("length: 0"));
        assert_eq!(queue.queue_status().length, 0);
    }
}
