use std::{error, fmt};

use bytes::Bytes;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// A request sent by a client or worker to the coordinator.
///
/// On the wire, a request is a string-keyed map carrying a `method` field
/// naming the operation plus that method's parameters. Exactly one request is
/// served per connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Request {
    /// Health check; always answered with an ok status.
    ///
    /// On the wire: `{method: "ping"}`
    Ping,
    /// Allocates a fresh worker id. Workers call this once per process
    /// lifetime, before their first `get_work`.
    ///
    /// On the wire: `{method: "worker_init"}`
    WorkerInit,
    /// Fetches a job's entire scene bundle (`blend.tar.gz`), verbatim.
    ///
    /// On the wire: `{method: "download_blend", job_id}`
    DownloadBlend { job_id: String },
    /// Fetches one rendered frame as JPEG bytes.
    ///
    /// On the wire: `{method: "download_render", job_id, frame}`
    DownloadRender { job_id: String, frame: u32 },
    /// Asks the scheduler for a batch of frames to render. Answered with a
    /// job id and frame list, or a `no_work` status.
    ///
    /// On the wire: `{method: "get_work", worker_id}`
    GetWork { worker_id: u32 },
    /// Delivers one rendered frame. Workers upload a batch one frame at a
    /// time; the batch-size controller is debounced accordingly.
    ///
    /// On the wire: `{method: "upload_render", worker_id, job_id, frame, data}`
    UploadRender {
        worker_id: u32,
        job_id: String,
        frame: u32,
        data: Bytes,
    },
    /// Asserts mid-batch liveness for in-flight frames, deferring the stall
    /// sweep for them.
    ///
    /// On the wire: `{method: "status_update", job_id, frames}`
    StatusUpdate { job_id: String, frames: Vec<u32> },
    /// Creates a render job from a scene bundle and a set of frame numbers.
    /// `is_tar` indicates the blob is already a `.tar.gz` archive; a raw
    /// scene file is transcoded into a one-entry archive.
    ///
    /// On the wire: `{method: "create_job", blend, frames, is_tar}`
    CreateJob {
        blend: Bytes,
        frames: Vec<u32>,
        is_tar: bool,
    },
    /// Reports a job's progress: frames completed so far, and the full frame
    /// set requested at creation.
    ///
    /// On the wire: `{method: "job_status", job_id}`
    JobStatus { job_id: String },
}

impl Request {
    pub fn method(&self) -> &'static str {
        use Request::*;

        match self {
            Ping => "ping",
            WorkerInit => "worker_init",
            DownloadBlend { .. } => "download_blend",
            DownloadRender { .. } => "download_render",
            GetWork { .. } => "get_work",
            UploadRender { .. } => "upload_render",
            StatusUpdate { .. } => "status_update",
            CreateJob { .. } => "create_job",
            JobStatus { .. } => "job_status",
        }
    }
}

// Requests are serialized by the in-crate test client; the coordinator only
// ever decodes them.
impl Serialize for Request {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use Request::*;

        let n_fields = match self {
            Ping | WorkerInit => 1,
            DownloadBlend { .. } | GetWork { .. } | JobStatus { .. } => 2,
            DownloadRender { .. } | StatusUpdate { .. } => 3,
            CreateJob { .. } => 4,
            UploadRender { .. } => 5,
        };

        let mut map = serializer.serialize_map(Some(n_fields))?;
        map.serialize_entry("method", self.method())?;

        match self {
            Ping | WorkerInit => {},
            DownloadBlend { job_id } | JobStatus { job_id } => {
                map.serialize_entry("job_id", job_id)?;
            },
            DownloadRender { job_id, frame } => {
                map.serialize_entry("job_id", job_id)?;
                map.serialize_entry("frame", frame)?;
            },
            GetWork { worker_id } => {
                map.serialize_entry("worker_id", worker_id)?;
            },
            UploadRender {
                worker_id,
                job_id,
                frame,
                data,
            } => {
                map.serialize_entry("worker_id", worker_id)?;
                map.serialize_entry("job_id", job_id)?;
                map.serialize_entry("frame", frame)?;
                map.serialize_entry("data", serde_bytes::Bytes::new(data))?;
            },
            StatusUpdate { job_id, frames } => {
                map.serialize_entry("job_id", job_id)?;
                map.serialize_entry("frames", frames)?;
            },
            CreateJob {
                blend,
                frames,
                is_tar,
            } => {
                map.serialize_entry("blend", serde_bytes::Bytes::new(blend))?;
                map.serialize_entry("frames", frames)?;
                map.serialize_entry("is_tar", is_tar)?;
            },
        }

        map.end()
    }
}

/// All possible responses to a [Request].
///
/// Every response carries a `status` field: `"ok"` on success, a descriptive
/// string otherwise.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Response {
    /// Success with no further fields.
    ///
    /// On the wire: `{status: "ok"}`
    Ok,
    /// In response to a `worker_init`, the allocated id.
    ///
    /// On the wire: `{status: "ok", worker_id}`
    WorkerInit { worker_id: u32 },
    /// In response to a `download_blend` or `download_render`, the file
    /// contents.
    ///
    /// On the wire: `{status: "ok", data}`
    Blob { data: Bytes },
    /// In response to a `get_work`, the dispatched batch.
    ///
    /// On the wire: `{status: "ok", job_id, frames}`
    Work { job_id: String, frames: Vec<u32> },
    /// In response to a `create_job`, the allocated job id.
    ///
    /// On the wire: `{status: "ok", job_id}`
    JobCreated { job_id: String },
    /// In response to a `job_status`, completed frames in completion order
    /// and the requested frame set in ascending order.
    ///
    /// On the wire: `{status: "ok", frames_done, frames_requested}`
    JobStatus {
        frames_done: Vec<u32>,
        frames_requested: Vec<u32>,
    },
    /// In response to a `get_work`, indicates no job currently has
    /// dispatchable frames.
    ///
    /// On the wire: `{status: "no_work"}`
    NoWork,
    /// The referenced job or frame does not exist on disk.
    ///
    /// On the wire: `{status: "not_found"}`
    NotFound,
    /// The method was unknown, a required field was missing or mistyped, or
    /// the job's status record failed its integrity checks.
    ///
    /// On the wire: `{status: "invalid_request"}`
    InvalidRequest,
    /// Indicates a coordinator-side failure; the request may be retried.
    ///
    /// On the wire: `{status: "internal_error"}`
    InternalError,
}

impl Response {
    pub fn status(&self) -> &'static str {
        use Response::*;

        match self {
            Ok
            | WorkerInit { .. }
            | Blob { .. }
            | Work { .. }
            | JobCreated { .. }
            | JobStatus { .. } => "ok",
            NoWork => "no_work",
            NotFound => "not_found",
            InvalidRequest => "invalid_request",
            InternalError => "internal_error",
        }
    }
}

impl Serialize for Response {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use Response::*;

        let n_fields = match self {
            Ok | NoWork | NotFound | InvalidRequest | InternalError => 1,
            WorkerInit { .. } | Blob { .. } | JobCreated { .. } => 2,
            Work { .. } | JobStatus { .. } => 3,
        };

        let mut map = serializer.serialize_map(Some(n_fields))?;
        map.serialize_entry("status", self.status())?;

        match self {
            Ok | NoWork | NotFound | InvalidRequest | InternalError => {},
            WorkerInit { worker_id } => {
                map.serialize_entry("worker_id", worker_id)?;
            },
            Blob { data } => {
                map.serialize_entry("data", serde_bytes::Bytes::new(data))?;
            },
            Work { job_id, frames } => {
                map.serialize_entry("job_id", job_id)?;
                map.serialize_entry("frames", frames)?;
            },
            JobCreated { job_id } => {
                map.serialize_entry("job_id", job_id)?;
            },
            JobStatus {
                frames_done,
                frames_requested,
            } => {
                map.serialize_entry("frames_done", frames_done)?;
                map.serialize_entry("frames_requested", frames_requested)?;
            },
        }

        map.end()
    }
}

/// Why a frame payload could not be turned into a [Request].
///
/// [NotARequest](DecodeError::NotARequest) means the peer is not speaking the
/// protocol at all (the payload is not a map, or has no usable `method`), so
/// no response can be addressed to it; the connection is dropped. The other
/// variants carry a parseable method and are answered with an
/// `invalid_request` status.
#[derive(Debug)]
pub enum DecodeError {
    NotARequest,
    UnknownMethod(String),
    BadParams {
        method: &'static str,
        source: rmp_serde::decode::Error,
    },
}

impl error::Error for DecodeError {}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotARequest => {
                write!(f, "payload is not a map with a method field")
            },
            Self::UnknownMethod(m) => write!(f, "unknown method {m:?}"),
            Self::BadParams { method, source } => {
                write!(f, "bad parameters for {method}: {source}")
            },
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    method: String,
}

#[derive(Deserialize)]
struct JobIdParams {
    job_id: String,
}

#[derive(Deserialize)]
struct FrameParams {
    job_id: String,
    frame: u32,
}

#[derive(Deserialize)]
struct WorkerParams {
    worker_id: u32,
}

#[derive(Deserialize)]
struct UploadParams {
    worker_id: u32,
    job_id: String,
    frame: u32,
    data: ByteBuf,
}

#[derive(Deserialize)]
struct LivenessParams {
    job_id: String,
    frames: Vec<u32>,
}

#[derive(Deserialize)]
struct CreateParams {
    blend: ByteBuf,
    frames: Vec<u32>,
    is_tar: bool,
}

/// Decodes one frame payload into a [Request].
pub fn decode_request(payload: &[u8]) -> Result<Request, DecodeError> {
    // Struct deserialization would happily accept a positional array here, so
    // require a MessagePack map marker up front: fixmap, map 16, or map 32.
    match payload.first() {
        Some(&(0x80..=0x8f | 0xde | 0xdf)) => {},
        _ => return Err(DecodeError::NotARequest),
    }

    let envelope: Envelope =
        rmp_serde::from_slice(payload).map_err(|_| DecodeError::NotARequest)?;

    fn params<'a, T: Deserialize<'a>>(
        method: &'static str,
        payload: &'a [u8],
    ) -> Result<T, DecodeError> {
        rmp_serde::from_slice(payload)
            .map_err(|source| DecodeError::BadParams { method, source })
    }

    Ok(match envelope.method.as_str() {
        "ping" => Request::Ping,
        "worker_init" => Request::WorkerInit,
        "download_blend" => {
            let p: JobIdParams = params("download_blend", payload)?;
            Request::DownloadBlend { job_id: p.job_id }
        },
        "download_render" => {
            let p: FrameParams = params("download_render", payload)?;
            Request::DownloadRender {
                job_id: p.job_id,
                frame: p.frame,
            }
        },
        "get_work" => {
            let p: WorkerParams = params("get_work", payload)?;
            Request::GetWork {
                worker_id: p.worker_id,
            }
        },
        "upload_render" => {
            let p: UploadParams = params("upload_render", payload)?;
            Request::UploadRender {
                worker_id: p.worker_id,
                job_id: p.job_id,
                frame: p.frame,
                data: p.data.into_vec().into(),
            }
        },
        "status_update" => {
            let p: LivenessParams = params("status_update", payload)?;
            Request::StatusUpdate {
                job_id: p.job_id,
                frames: p.frames,
            }
        },
        "create_job" => {
            let p: CreateParams = params("create_job", payload)?;
            Request::CreateJob {
                blend: p.blend.into_vec().into(),
                frames: p.frames,
                is_tar: p.is_tar,
            }
        },
        "job_status" => {
            let p: JobIdParams = params("job_status", payload)?;
            Request::JobStatus { job_id: p.job_id }
        },
        _ => return Err(DecodeError::UnknownMethod(envelope.method)),
    })
}
