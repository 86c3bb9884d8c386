use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::sink::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::select;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Level};

use crate::jobs::store::{self, JobStore};
use crate::sched::{self, Scheduler, Tunables};
use crate::wire::protocol::{decode_request, DecodeError, Request, Response};
use crate::wire;
use crate::workers::WorkerRegistry;

/// The shared state every request handler works against: the job store, the
/// scheduler wrapped around it, and the worker-id registry.
pub struct Coordinator {
    store: Arc<JobStore>,
    sched: Scheduler,
    workers: WorkerRegistry,
}

impl Coordinator {
    pub fn new(
        root: impl Into<PathBuf>,
        tunables: Tunables,
    ) -> io::Result<Self> {
        let store = Arc::new(JobStore::open(root)?);

        Ok(Self {
            sched: Scheduler::new(store.clone(), tunables),
            store,
            workers: WorkerRegistry::new(),
        })
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }
}

/// The coordinator's TCP frontend: an accept loop spawning one handler task
/// per connection, each serving a single request.
pub struct Server {
    listener: TcpListener,
    coord: Arc<Coordinator>,
    cancel: CancellationToken,
    max_frame: u32,
}

impl Server {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        coord: Arc<Coordinator>,
        max_frame: u32,
    ) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            coord,
            cancel: CancellationToken::new(),
            max_frame,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A handle that stops the server when cancelled; remains valid after
    /// [serve](Self::serve) consumes it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops accepting connections. In-flight handlers run to completion;
    /// calling this more than once is harmless.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Accepts and serves connections until stopped, then drains in-flight
    /// handlers before returning. Consumes the server so the listening
    /// socket closes on exit.
    pub async fn serve(self) -> Result<()> {
        info!(addr = %self.listener.local_addr()?, "listening");

        let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

        loop {
            match select! {
                accept = self.listener.accept() => accept,
                _ = self.cancel.cancelled() => break,
            } {
                Ok((conn, _)) => {
                    tokio::spawn(handle_conn(
                        self.cancel.clone(),
                        shutdown_hold.clone(),
                        conn,
                        self.coord.clone(),
                        self.max_frame,
                    ));
                },
                Err(error) => {
                    warn!(%error, "failed to accept connection");
                    continue;
                },
            };
        }

        // Handlers hold clones of the sender; recv yields None once the
        // last one is dropped.
        drop(shutdown_hold);
        shutdown_wait.recv().await;

        Ok(())
    }
}

#[instrument(name = "client_conn", err(level = Level::WARN), fields(peer = %conn.peer_addr()?), skip_all)]
async fn handle_conn(
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    conn: TcpStream,
    coord: Arc<Coordinator>,
    max_frame: u32,
) -> Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;

    let mut framed = wire::framed_with_limit(conn, max_frame);

    let payload = select! {
        x = framed.next() => match x {
            None => {
                debug!("connection dropped before a request");
                return Ok(());
            },
            Some(Ok(payload)) => payload,
            Some(Err(error)) => {
                return Err(error).context("reading request frame");
            },
        },
        _ = cancel.cancelled() => return Ok(()),
    };

    let resp = match decode_request(&payload) {
        Ok(req) => {
            debug!(method = req.method(), "handling request");
            dispatch(&coord, req).await
        },
        Err(error @ DecodeError::NotARequest) => {
            // There is no method to address a response to, so there is no
            // response; hang up.
            bail!("client sent a malformed request: {error}");
        },
        Err(error) => {
            warn!(%error, "rejecting request");
            Response::InvalidRequest
        },
    };

    select! {
        x = framed.send(resp) => x.context("sending response")?,
        _ = cancel.cancelled() => return Ok(()),
    }

    framed
        .into_inner()
        .shutdown()
        .await
        .context("during shutdown")?;

    Ok(())
}

async fn dispatch(coord: &Coordinator, req: Request) -> Response {
    use Request::*;

    match req {
        Ping => Response::Ok,
        WorkerInit => Response::WorkerInit {
            worker_id: coord.workers.allocate(),
        },
        DownloadBlend { job_id } => {
            match coord.store.read_blend(&job_id).await {
                Ok(data) => Response::Blob { data },
                Err(error) => store_error(error),
            }
        },
        DownloadRender { job_id, frame } => {
            match coord.store.read_render(&job_id, frame).await {
                Ok(data) => Response::Blob { data },
                Err(error) => store_error(error),
            }
        },
        GetWork { worker_id } => {
            match coord.sched.get_work(worker_id).await {
                Ok(Some((job_id, frames))) => {
                    Response::Work { job_id, frames }
                },
                Ok(None) => Response::NoWork,
                Err(error) => sched_error(error),
            }
        },
        UploadRender {
            worker_id,
            job_id,
            frame,
            data,
        } => {
            match coord
                .sched
                .upload_render(worker_id, &job_id, frame, &data)
                .await
            {
                Ok(()) => Response::Ok,
                Err(error) => sched_error(error),
            }
        },
        StatusUpdate { job_id, frames } => {
            match coord.sched.status_update(&job_id, &frames).await {
                Ok(()) => Response::Ok,
                Err(error) => sched_error(error),
            }
        },
        CreateJob {
            blend,
            frames,
            is_tar,
        } => {
            match coord.store.create_job(blend, frames, is_tar).await {
                Ok(job_id) => Response::JobCreated { job_id },
                Err(error) => store_error(error),
            }
        },
        JobStatus { job_id } => {
            match coord.sched.job_status(&job_id).await {
                Ok((frames_done, frames_requested)) => Response::JobStatus {
                    frames_done,
                    frames_requested,
                },
                Err(error) => sched_error(error),
            }
        },
    }
}

fn store_error(error: store::Error) -> Response {
    match error {
        store::Error::NotFound => Response::NotFound,
        error @ store::Error::Corrupt(_) => {
            warn!(%error, "status record failed to load");
            Response::InvalidRequest
        },
        error => {
            error!(%error, "store operation failed");
            Response::InternalError
        },
    }
}

fn sched_error(error: sched::Error) -> Response {
    match error {
        sched::Error::Store(error) => store_error(error),
        sched::Error::Integrity(error) => {
            warn!(%error, "status record failed integrity checks");
            Response::InvalidRequest
        },
    }
}
