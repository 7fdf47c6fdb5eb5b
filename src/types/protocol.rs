use serde::Serialize;
use tracing::error;

use super::job::{JobId, JobStatusView};
use super::serialisable::WireSerialisable;
use crate::queue::QueueStatus;
use crate::rate_limiter::RateLimitStatus;
use crate::status::SystemStatus;

/// A command sent by a client of the control protocol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Queues an upload. The line is followed by `n_bytes` of image data and
    /// a CRLF. `-` in place of the category or label means "not given".
    ///
    /// On the wire: `submit <owner> <category> <label> <n_bytes>`
    Submit {
        owner: Vec<u8>,
        category: Option<Vec<u8>>,
        label: Option<Vec<u8>>,
        n_bytes: u32,
    },
    /// Returns the status of one job as a YAML dictionary, or `NOT_FOUND`.
    ///
    /// On the wire: `job-status <id>`
    JobStatus { id: u64 },
    /// Returns queue length, whether the drain loop is running, and job
    /// counts by status.
    ///
    /// On the wire: `queue-status`
    QueueStatus,
    /// Returns the state of the shared external-API rate window.
    ///
    /// On the wire: `rate-status`
    RateStatus,
    /// Returns both of the above in one document.
    ///
    /// On the wire: `stats`
    Stats,
    /// Requests that the server close this connection.
    ///
    /// On the wire: `quit`
    Quit,
}

/// All possible responses to a `Command`.
#[derive(Debug)]
pub enum Response {
    /// Indicates a server bug. Can be sent in response to any command.
    ///
    /// On the wire: `INTERNAL_ERROR`.
    InternalError,
    /// The command line was malformed.
    ///
    /// On the wire: `BAD_FORMAT`.
    BadFormat,
    /// The command verb is not recognised.
    ///
    /// On the wire: `UNKNOWN_COMMAND`.
    UnknownCommand,
    /// In response to a `submit`, the upload was queued under this id.
    ///
    /// On the wire: `INSERTED <id>`.
    Inserted { id: JobId },
    /// In response to a `submit`, the image data was not followed by CRLF.
    ///
    /// On the wire: `EXPECTED_CRLF`.
    ExpectedCRLF,
    /// In response to a `submit`, the image exceeds the configured limit.
    ///
    /// On the wire: `JOB_TOO_BIG`.
    JobTooBig,
    /// In response to a `submit`, the upload was rejected without queueing.
    ///
    /// On the wire: `BAD_UPLOAD <reason>`.
    BadUpload { reason: String },
    /// In response to a `submit`, the server is shutting down.
    ///
    /// On the wire: `DRAINING`.
    Draining,
    /// In response to a `job-status`, the id is unknown or was evicted.
    ///
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// On the wire: `OK <n_bytes>` plus a YAML dictionary.
    OkJob { data: JobStatusView },
    /// On the wire: `OK <n_bytes>` plus a YAML dictionary.
    OkQueue { data: QueueStatus },
    /// On the wire: `OK <n_bytes>` plus a YAML dictionary.
    OkRate { data: RateLimitStatus },
    /// On the wire: `OK <n_bytes>` plus a YAML dictionary.
    OkStats { data: SystemStatus },
}

/// Frames a YAML document as `OK <n_bytes>\r\n<data>\r\n`.
fn ok_yaml<T: Serialize>(data: &T) -> Vec<u8> {
    match serde_yaml::to_string(data) {
        Ok(data) => format!("OK {}\r\n{data}\r\n", data.len()).into(),
        Err(error) => {
            error!(%error, "failed to serialise response");
            b"INTERNAL_ERROR\r\n".to_vec()
        },
    }
}

impl WireSerialisable for Response {
    fn serialise_wire(&self) -> Vec<u8> {
        use Response::*;

        match self {
            InternalError => b"INTERNAL_ERROR\r\n".to_vec(),
            BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
            Inserted { id } => format!("INSERTED {id}\r\n").into(),
            ExpectedCRLF => b"EXPECTED_CRLF\r\n".to_vec(),
            JobTooBig => b"JOB_TOO_BIG\r\n".to_vec(),
            // Reasons come from our own error messages; keep them one line.
            BadUpload { reason } => {
                let reason = reason.replace(['\r', '\n'], " ");
                format!("BAD_UPLOAD {reason}\r\n").into()
            },
            Draining => b"DRAINING\r\n".to_vec(),
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            OkJob { data } => ok_yaml(data),
            OkQueue { data } => ok_yaml(data),
            OkRate { data } => ok_yaml(data),
            OkStats { data } => ok_yaml(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::StatusCounts;

    #[test]
    fn test_simple_responses() {
        assert_eq!(
            Response::Inserted { id: JobId(42) }.serialise_wire(),
            b"INSERTED 42\r\n"
        );
        assert_eq!(Response::NotFound.serialise_wire(), b"NOT_FOUND\r\n");
        assert_eq!(
            Response::BadUpload {
                reason: "no image\r\nuploaded".into()
            }
            .serialise_wire(),
            b"BAD_UPLOAD no image  uploaded\r\n"
        );
    }

    #[test]
    fn test_yaml_response_is_length_prefixed() {
        let resp = Response::OkQueue {
            data: QueueStatus {
                length: 2,
                is_processing: true,
                current: Some(JobId(7)),
                counts_by_status: StatusCounts {
                    pending: 2,
                    processing: 1,
                    completed: 0,
                    failed: 0,
                },
            },
        };

        let raw = String::from_utf8(resp.serialise_wire()).unwrap();
        let (header, rest) = raw.split_once("\r\n").unwrap();
        let body = rest.strip_suffix("\r\n").unwrap();

        assert_eq!(header, format!("OK {}", body.len()));
        assert!(body.contains("length: 2"));
        assert!(body.contains("current: 7"));
        assert!(body.contains("processing: 1"));
    }
}
