//! Artifact downloads.
//!
//! The artifact is streamed into a temp file next to its destination and
//! renamed into place only after the transfer completed and its size (and
//! digest, when published) checked out. A failed or interrupted transfer
//! leaves nothing at the destination path.

use crate::config::DownloadConfig;
use crate::error::{Result, UpdraftError};
use crate::progress::{ProgressCallback, ProgressEvent, emit};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Read buffer size.
const CHUNK_SIZE: usize = 64 * 1024;

/// Emit a progress event at most once per this many bytes.
const PROGRESS_STEP: u64 = 512 * 1024;

/// What the downloaded bytes must match.
#[derive(Debug, Clone, Copy, Default)]
pub struct Expected<'a> {
    /// Exact byte count (from `Content-Length`).
    pub length: Option<u64>,
    /// Lowercase hex SHA-256 digest.
    pub sha256: Option<&'a str>,
}

/// One artifact to fetch.
#[derive(Debug, Clone, Copy)]
pub struct DownloadRequest<'a> {
    pub url: &'a str,
    pub dest: &'a Path,
    /// Size advertised by the manifest, used to scale the timeout and check
    /// free space.
    pub expected_size: Option<u64>,
    /// Digest advertised by the manifest.
    pub sha256: Option<&'a str>,
}

impl<'a> DownloadRequest<'a> {
    #[must_use]
    pub fn new(url: &'a str, dest: &'a Path) -> Self {
        Self {
            url,
            dest,
            expected_size: None,
            sha256: None,
        }
    }
}

/// Downloads artifacts with integrity checks.
pub struct ArtifactFetcher {
    config: DownloadConfig,
    user_agent: String,
}

impl ArtifactFetcher {
    #[must_use]
    pub fn new(config: &DownloadConfig, user_agent: impl Into<String>) -> Self {
        Self {
            config: config.clone(),
            user_agent: user_agent.into(),
        }
    }

    /// Download `url` to `dest`.
    ///
    /// # Errors
    ///
    /// See [`ArtifactFetcher::fetch`].
    pub fn download(&self, url: &str, dest: &Path) -> Result<PathBuf> {
        self.fetch(&DownloadRequest::new(url, dest), None, None)
    }

    /// Download an artifact, reporting progress and honouring cancellation.
    ///
    /// # Errors
    ///
    /// - [`UpdraftError::Network`] if the request fails or the transfer breaks
    /// - [`UpdraftError::Integrity`] on a size or digest mismatch
    /// - [`UpdraftError::Cancelled`] if `cancel` fires mid-transfer
    /// - [`UpdraftError::Io`] if the destination cannot be written or there is
    ///   not enough free space
    pub fn fetch(
        &self,
        request: &DownloadRequest<'_>,
        progress: Option<&ProgressCallback>,
        cancel: Option<&CancellationToken>,
    ) -> Result<PathBuf> {
        let dir = parent_dir(request.dest)?;
        std::fs::create_dir_all(&dir)?;

        if let Some(size) = request.expected_size {
            ensure_free_space(&dir, size, self.config.disk_headroom_bytes)?;
        }

        let timeout = self.config.timeout_for(request.expected_size);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(self.config.connect_timeout_secs.max(1)))
            .timeout(timeout)
            .build();

        tracing::info!(url = request.url, timeout_secs = timeout.as_secs(), "downloading artifact");
        let resp = agent
            .get(request.url)
            .set("User-Agent", &self.user_agent)
            .call()
            .map_err(|e| UpdraftError::Network(format!("download failed: {e}")))?;

        let content_length = resp
            .header("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());

        emit(
            progress,
            ProgressEvent::DownloadStarted {
                url: request.url.to_owned(),
                total_bytes: content_length.or(request.expected_size),
            },
        );

        let expected = Expected {
            length: content_length.or(request.expected_size),
            sha256: request.sha256,
        };
        let bytes = receive_into(resp.into_reader(), request.dest, expected, progress, cancel)?;

        tracing::info!(
            path = %request.dest.display(),
            bytes,
            "artifact downloaded"
        );
        emit(
            progress,
            ProgressEvent::DownloadComplete {
                path: request.dest.to_path_buf(),
                bytes,
            },
        );
        Ok(request.dest.to_path_buf())
    }
}

/// Stream `reader` into a temp file beside `dest`, verify it, then rename it
/// onto `dest`.
///
/// On any error the temp file is removed and `dest` is untouched.
pub(crate) fn receive_into<R: Read>(
    mut reader: R,
    dest: &Path,
    expected: Expected<'_>,
    progress: Option<&ProgressCallback>,
    cancel: Option<&CancellationToken>,
) -> Result<u64> {
    let dir = parent_dir(dest)?;
    let mut part = tempfile::Builder::new()
        .prefix(".updraft-download-")
        .suffix(".part")
        .tempfile_in(&dir)?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; CHUNK_SIZE];
    let mut total: u64 = 0;
    let mut next_report = PROGRESS_STEP;

    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(UpdraftError::Cancelled(
                "download cancelled before completion".to_owned(),
            ));
        }

        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // The body ended before the advertised length.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                let message = match expected.length {
                    Some(length) => format!("received {total} bytes, expected {length}"),
                    None => format!("body ended early after {total} bytes: {e}"),
                };
                return Err(UpdraftError::Integrity(message));
            }
            Err(e) => {
                return Err(UpdraftError::Network(format!(
                    "transfer interrupted after {total} bytes: {e}"
                )));
            }
        };

        part.write_all(&buf[..n])?;
        hasher.update(&buf[..n]);
        total += n as u64;

        if total >= next_report {
            next_report = total + PROGRESS_STEP;
            emit(
                progress,
                ProgressEvent::DownloadProgress {
                    bytes_downloaded: total,
                    total_bytes: expected.length,
                },
            );
        }
    }

    if let Some(length) = expected.length
        && total != length
    {
        return Err(UpdraftError::Integrity(format!(
            "received {total} bytes, expected {length}"
        )));
    }

    if let Some(want) = expected.sha256 {
        let got = format!("{:x}", hasher.finalize());
        if !got.eq_ignore_ascii_case(want) {
            return Err(UpdraftError::Integrity(format!(
                "sha256 mismatch: expected {want}, got {got}"
            )));
        }
    }

    part.flush()?;
    part.as_file().sync_all()?;
    part.persist(dest).map_err(|e| UpdraftError::Io(e.error))?;
    Ok(total)
}

fn parent_dir(dest: &Path) -> Result<PathBuf> {
    match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => Ok(p.to_path_buf()),
        Some(_) => Ok(PathBuf::from(".")),
        None => Err(UpdraftError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("download destination has no parent: {}", dest.display()),
        ))),
    }
}

fn ensure_free_space(dir: &Path, required: u64, headroom: u64) -> Result<()> {
    let free = available_disk_space(dir)?;
    let needed = required.saturating_add(headroom);
    if free < needed {
        return Err(UpdraftError::Io(std::io::Error::new(
            std::io::ErrorKind::StorageFull,
            format!(
                "not enough free space in {}: {free} bytes free, {needed} needed",
                dir.display()
            ),
        )));
    }
    Ok(())
}

/// Query available disk space at `path`.
///
/// On Unix, uses `statvfs` to get the free blocks available to unprivileged
/// users. On other platforms, returns `u64::MAX` (skipping the check).
///
/// # Errors
///
/// Returns an error if the filesystem stats cannot be retrieved.
#[cfg(unix)]
pub fn available_disk_space(path: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| {
        UpdraftError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid path for statvfs: {e}"),
        ))
    })?;

    // SAFETY: `stat` is a plain C struct, zero is a valid bit pattern, and
    // `c_path` is a NUL-terminated string that outlives the call.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(UpdraftError::Io(std::io::Error::last_os_error()));
    }

    // Field widths differ between Linux and macOS.
    let bavail: u64 = stat.f_bavail as _;
    let frsize: u64 = stat.f_frsize as _;
    Ok(bavail.saturating_mul(frsize))
}

/// Fallback for non-Unix platforms.
#[cfg(not(unix))]
pub fn available_disk_space(_path: &Path) -> Result<u64> {
    Ok(u64::MAX)
}
