use std::path::{Path, PathBuf};
use std::{error, fmt, io};

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::lock::JobLocks;
use super::status::JobStatus;

pub const BUNDLE_FILE: &str = "blend.tar.gz";
pub const STATUS_FILE: &str = "status.mpk";
pub const DONE_MARKER: &str = "done.txt";
pub const RENDERS_DIR: &str = "renders";

/// Filesystem-backed job state, one directory per job under a root owned by
/// the coordinator process:
///
/// ```text
/// <root>/<job_id>/blend.tar.gz     scene bundle, verbatim
/// <root>/<job_id>/status.mpk       serialized JobStatus
/// <root>/<job_id>/renders/<f>.jpg  rendered frames
/// <root>/<job_id>/done.txt         presence flag: no todo frames remain
/// ```
///
/// Status commits are whole-file replacements via a sibling temp file and
/// atomic rename, so readers outside the job lock (`list_active`,
/// `job_status`) always observe a complete record.
pub struct JobStore {
    root: PathBuf,
    locks: JobLocks,
    create_lock: Mutex<()>,
}

impl JobStore {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            locks: JobLocks::new(),
            create_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Acquires the named lock serializing mutations of this job.
    pub async fn lock(&self, job_id: &str) -> OwnedMutexGuard<()> {
        self.locks.acquire(job_id).await
    }

    // Job ids are decimal strings; anything else cannot name a job
    // directory and must not escape the root.
    fn job_dir(&self, job_id: &str) -> Result<PathBuf, Error> {
        if job_id.is_empty() || !job_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::NotFound);
        }

        Ok(self.root.join(job_id))
    }

    /// Creates a job directory, bundle, initial status record, and renders
    /// directory, returning the allocated id.
    ///
    /// A raw scene blob (`is_tar == false`) is transcoded into a one-entry
    /// `main.blend` archive so workers only ever see `.tar.gz` bundles.
    pub async fn create_job(
        &self,
        blend: Bytes,
        frames: Vec<u32>,
        is_tar: bool,
    ) -> Result<String, Error> {
        // Id allocation scans the root for max+1, so concurrent creations
        // must not interleave between the scan and the mkdir.
        let _create = self.create_lock.lock().await;

        let job_id = self.next_id().await?;
        let dir = self.root.join(&job_id);
        tokio::fs::create_dir(&dir).await?;

        let _guard = self.lock(&job_id).await;

        let bundle = if is_tar {
            blend
        } else {
            let out = tokio::task::spawn_blocking(move || {
                bundle_from_scene(&blend)
            })
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
            out.into()
        };

        tokio::fs::write(dir.join(BUNDLE_FILE), &bundle).await?;
        self.write_status(&job_id, &JobStatus::new(frames)).await?;
        tokio::fs::create_dir(dir.join(RENDERS_DIR)).await?;

        debug!(%job_id, "created job");
        Ok(job_id)
    }

    async fn next_id(&self) -> Result<String, Error> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut next = 0u64;

        while let Some(entry) = entries.next_entry().await? {
            if let Some(n) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            {
                next = next.max(n + 1);
            }
        }

        Ok(next.to_string())
    }

    pub async fn read_status(&self, job_id: &str) -> Result<JobStatus, Error> {
        let path = self.job_dir(job_id)?.join(STATUS_FILE);
        let raw = tokio::fs::read(path).await.map_err(io_not_found)?;

        rmp_serde::from_slice(&raw).map_err(Error::Corrupt)
    }

    /// Commits a status record: serialize, write a sibling temp file,
    /// rename over the old record.
    pub async fn write_status(
        &self,
        job_id: &str,
        status: &JobStatus,
    ) -> Result<(), Error> {
        let raw = rmp_serde::to_vec_named(status).map_err(Error::Encode)?;

        let path = self.job_dir(job_id)?.join(STATUS_FILE);
        let tmp = path.with_extension("mpk.tmp");

        tokio::fs::write(&tmp, &raw).await.map_err(io_not_found)?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok(())
    }

    /// Enumerates jobs that still have frames to hand out: no done marker
    /// and a non-empty `todo`. A markerless job whose `todo` has drained
    /// gets its marker written here as a side effect, sealing it against
    /// future scans.
    pub async fn list_active(&self) -> Result<Vec<String>, Error> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let Some(job_id) = entry
                .file_name()
                .to_str()
                .filter(|name| name.parse::<u64>().is_ok())
                .map(ToOwned::to_owned)
            else {
                continue;
            };

            let marker = entry.path().join(DONE_MARKER);
            if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
                continue;
            }

            match self.read_status(&job_id).await {
                Ok(status) if !status.todo.is_empty() => ids.push(job_id),
                Ok(_) => {
                    tokio::fs::write(&marker, b"").await?;
                    debug!(%job_id, "job has no todo frames, marked done");
                },
                Err(error) => {
                    warn!(%job_id, %error, "skipping unreadable status record");
                },
            }
        }

        ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));
        Ok(ids)
    }

    pub async fn read_blend(&self, job_id: &str) -> Result<Bytes, Error> {
        let path = self.job_dir(job_id)?.join(BUNDLE_FILE);
        let raw = tokio::fs::read(path).await.map_err(io_not_found)?;

        Ok(raw.into())
    }

    pub async fn read_render(
        &self,
        job_id: &str,
        frame: u32,
    ) -> Result<Bytes, Error> {
        let path = self
            .job_dir(job_id)?
            .join(RENDERS_DIR)
            .join(format!("{frame}.jpg"));
        let raw = tokio::fs::read(path).await.map_err(io_not_found)?;

        Ok(raw.into())
    }

    pub async fn write_render(
        &self,
        job_id: &str,
        frame: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        let path = self
            .job_dir(job_id)?
            .join(RENDERS_DIR)
            .join(format!("{frame}.jpg"));

        tokio::fs::write(path, data).await.map_err(io_not_found)
    }
}

/// Wraps raw scene bytes into a gzipped tar archive whose single entry is
/// `main.blend`, matching what clients upload when `is_tar` is set.
fn bundle_from_scene(scene: &[u8]) -> io::Result<Vec<u8>> {
    let enc = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = tar::Builder::new(enc);

    let mut header = tar::Header::new_gnu();
    header.set_size(scene.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, "main.blend", scene)?;

    tar.into_inner()?.finish()
}

fn io_not_found(error: io::Error) -> Error {
    if error.kind() == io::ErrorKind::NotFound {
        Error::NotFound
    } else {
        Error::IO(error)
    }
}

#[derive(Debug)]
pub enum Error {
    /// The referenced job or frame does not exist on disk.
    NotFound,
    /// The status record did not decode; the job directory has likely been
    /// tampered with or truncated outside the coordinator.
    Corrupt(rmp_serde::decode::Error),
    Encode(rmp_serde::encode::Error),
    IO(io::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "no such job or frame"),
            Self::Corrupt(e) => write!(f, "undecodable status record: {e}"),
            Self::Encode(e) => write!(f, "unencodable status record: {e}"),
            Self::IO(e) => write!(f, "{e}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn store() -> (tempfile::TempDir, JobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path().join("jobs")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let (_dir, store) = store();

        let id = store
            .create_job(Bytes::from_static(b"archive"), vec![3, 1, 1, 2], true)
            .await
            .unwrap();
        assert_eq!(id, "0");

        let status = store.read_status("0").await.unwrap();
        assert_eq!(status.todo, [1, 2, 3]);
        assert!(status.done.is_empty());

        // The bundle is stored verbatim when the client sent an archive.
        assert_eq!(store.read_blend("0").await.unwrap(), &b"archive"[..]);

        // Ids count up from the highest existing directory.
        let id = store
            .create_job(Bytes::from_static(b"x"), vec![0], true)
            .await
            .unwrap();
        assert_eq!(id, "1");
    }

    #[tokio::test]
    async fn test_raw_scene_is_transcoded() {
        let (_dir, store) = store();

        let scene = b"BLENDER-v300 scene bytes";
        store
            .create_job(Bytes::from_static(scene), vec![7], false)
            .await
            .unwrap();

        let bundle = store.read_blend("0").await.unwrap();
        let gz = flate2::read::GzDecoder::new(&bundle[..]);
        let mut archive = tar::Archive::new(gz);

        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("main.blend"));

        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, scene);

        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn test_list_active_seals_drained_jobs() {
        let (_dir, store) = store();

        store
            .create_job(Bytes::from_static(b"a"), vec![0, 1], true)
            .await
            .unwrap();
        store
            .create_job(Bytes::from_static(b"b"), vec![5], true)
            .await
            .unwrap();

        assert_eq!(store.list_active().await.unwrap(), ["0", "1"]);

        // Drain job 1's todo; the next scan writes its done marker and
        // stops yielding it.
        let mut status = store.read_status("1").await.unwrap();
        let frame = status.todo.remove(0);
        status.done.push(frame);
        store.write_status("1", &status).await.unwrap();

        assert_eq!(store.list_active().await.unwrap(), ["0"]);
        assert!(store.root().join("1").join(DONE_MARKER).exists());
        assert_eq!(store.list_active().await.unwrap(), ["0"]);
    }

    #[tokio::test]
    async fn test_status_commit_leaves_no_temp_file() {
        let (_dir, store) = store();

        store
            .create_job(Bytes::from_static(b"a"), vec![0], true)
            .await
            .unwrap();

        let dir = store.root().join("0");
        let names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{names:?}");
    }

    #[tokio::test]
    async fn test_renders_roundtrip() {
        let (_dir, store) = store();

        store
            .create_job(Bytes::from_static(b"a"), vec![4], true)
            .await
            .unwrap();

        assert!(matches!(
            store.read_render("0", 4).await,
            Err(Error::NotFound)
        ));

        store.write_render("0", 4, b"\xff\xd8jpeg").await.unwrap();
        assert_eq!(store.read_render("0", 4).await.unwrap(), &b"\xff\xd8jpeg"[..]);
    }

    #[tokio::test]
    async fn test_rejects_non_numeric_ids() {
        let (_dir, store) = store();

        assert!(matches!(
            store.read_status("../escape").await,
            Err(Error::NotFound)
        ));
        assert!(matches!(store.read_blend("").await, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_missing_job_is_not_found() {
        let (_dir, store) = store();

        assert!(matches!(store.read_status("9").await, Err(Error::NotFound)));
        assert!(matches!(store.read_blend("9").await, Err(Error::NotFound)));
    }
}
