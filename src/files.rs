// (c) 2025 Ross Younger

//! The file-store seam.
//!
//! The session layer never touches the filesystem directly: it reads
//! outgoing data through [`SendFile`], writes incoming data through
//! [`RecvFile`], and asks a [`FileStore`] to open either on behalf of a
//! peer's request. Spool layout, permission policy and quota decisions all
//! live behind these traits; a refusal surfaces as a [`TransferFailure`],
//! which is what travels back to the peer in an `SN`/`RN` reply.
//!
//! [`FsStore`] is the plain local-filesystem implementation: it receives
//! into a `.part` file alongside the destination and renames it into place
//! on commit, so a torn transfer never leaves a half-written target.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::session::TransferRequest;

/// Why a transfer request could not be honored.
///
/// Maps onto the refusal sub-codes of the session command grammar: for a
/// send request, `SN2`/`SN4`/`SN6`/`SN`; for a receive request, `RN2`/`RN6`/`RN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TransferFailure {
    /// Permission denied, or the file does not exist.
    Permission,
    /// Work files could not be created. Worth retrying later.
    WorkSpace,
    /// The file exceeds what the receiving side will accept. Worth
    /// retrying later.
    Size,
    /// Anything else.
    Other,
}

impl TransferFailure {
    /// Whether the refusal leaves the work record in place for a later
    /// retry, rather than discarding it.
    #[must_use]
    pub fn retriable(self) -> bool {
        matches!(self, TransferFailure::WorkSpace | TransferFailure::Size)
    }
}

/// A file being sent to the peer.
#[async_trait]
pub trait SendFile: Send {
    /// Reads the next chunk, directly into the link's packet buffer.
    /// 0 means end of file.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A file being received from the peer.
///
/// Data lands somewhere temporary until [`commit`](Self::commit) moves it
/// to its final location; a commit failure is reported to the peer as
/// `CN5`.
#[async_trait]
pub trait RecvFile: Send {
    /// Appends a chunk at the current position.
    async fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Repositions the file, as directed by an SPOS packet.
    async fn set_pos(&mut self, pos: u64) -> io::Result<()>;

    /// Finalizes the file: flush, apply `mode`, move into place.
    async fn commit(self: Box<Self>, mode: u32) -> io::Result<()>;

    /// Abandons the transfer and cleans up the temporary.
    async fn discard(self: Box<Self>);
}

/// An opened send file plus the metadata the request replies need.
pub struct SendHandle {
    /// The file itself.
    pub file: Box<dyn SendFile>,
    /// Its size in bytes, quoted in size-bearing requests.
    pub size: u64,
    /// Its permission bits, quoted in `RY 0mode` replies.
    pub mode: u32,
}

/// Opens files on behalf of transfer requests.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Opens the file named by a request we are to send from.
    async fn open_send(&self, req: &TransferRequest) -> Result<SendHandle, TransferFailure>;

    /// Opens a destination for a request we are to receive into.
    ///
    /// `req.size`, when present, is the announced size of the incoming
    /// file; the store may refuse it with [`TransferFailure::Size`].
    async fn open_recv(&self, req: &TransferRequest) -> Result<Box<dyn RecvFile>, TransferFailure>;
}

/// Local-filesystem [`FileStore`].
#[derive(Debug, Default)]
pub struct FsStore {
    /// Largest incoming file we will accept, if bounded.
    pub max_receive_size: Option<u64>,
}

fn failure_from_io(e: &io::Error) -> TransferFailure {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => TransferFailure::Permission,
        io::ErrorKind::StorageFull => TransferFailure::Size,
        _ => TransferFailure::Other,
    }
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt as _;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn mode_of(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

#[async_trait]
impl FileStore for FsStore {
    async fn open_send(&self, req: &TransferRequest) -> Result<SendHandle, TransferFailure> {
        let file = File::open(&req.from)
            .await
            .map_err(|e| failure_from_io(&e))?;
        let meta = file.metadata().await.map_err(|e| failure_from_io(&e))?;
        if meta.is_dir() {
            return Err(TransferFailure::Permission);
        }
        debug!("opened {} to send ({} bytes)", req.from, meta.len());
        Ok(SendHandle {
            size: meta.len(),
            mode: mode_of(&meta),
            file: Box::new(FsSendFile(file)),
        })
    }

    async fn open_recv(&self, req: &TransferRequest) -> Result<Box<dyn RecvFile>, TransferFailure> {
        if let (Some(limit), Some(size)) = (self.max_receive_size, req.size) {
            if size > limit {
                return Err(TransferFailure::Size);
            }
        }
        let final_path = PathBuf::from(&req.to);
        let temp_path = temp_name(&final_path);
        let file = File::create(&temp_path).await.map_err(|e| {
            let failure = failure_from_io(&e);
            if failure == TransferFailure::Other {
                TransferFailure::WorkSpace
            } else {
                failure
            }
        })?;
        debug!("receiving into {}", temp_path.display());
        Ok(Box::new(FsRecvFile {
            file,
            temp_path,
            final_path,
        }))
    }
}

fn temp_name(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(std::ffi::OsString::new, std::ffi::OsStr::to_os_string);
    name.push(".part");
    path.with_file_name(name)
}

struct FsSendFile(File);

#[async_trait]
impl SendFile for FsSendFile {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).await
    }
}

struct FsRecvFile {
    file: File,
    temp_path: PathBuf,
    final_path: PathBuf,
}

#[async_trait]
impl RecvFile for FsRecvFile {
    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf).await
    }

    async fn set_pos(&mut self, pos: u64) -> io::Result<()> {
        let _ = self.file.seek(io::SeekFrom::Start(pos)).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>, mode: u32) -> io::Result<()> {
        let mut this = *self;
        this.file.flush().await?;
        this.file.sync_all().await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            this.file
                .set_permissions(std::fs::Permissions::from_mode(mode & 0o777))
                .await?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        drop(this.file);
        tokio::fs::rename(&this.temp_path, &this.final_path).await
    }

    async fn discard(self: Box<Self>) {
        let this = *self;
        drop(this.file);
        if let Err(e) = tokio::fs::remove_file(&this.temp_path).await {
            warn!("could not remove {}: {e}", this.temp_path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FileStore as _, FsStore, TransferFailure, temp_name};
    use crate::session::TransferRequest;
    use littertray::LitterTray;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn req(from: &str, to: &str) -> TransferRequest {
        TransferRequest {
            from: from.to_string(),
            to: to.to_string(),
            user: "tester".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn temp_names_stay_in_directory() {
        assert_eq!(
            temp_name(Path::new("/spool/incoming/data.bin")),
            Path::new("/spool/incoming/data.bin.part")
        );
        assert_eq!(temp_name(Path::new("plain")), Path::new("plain.part"));
    }

    #[tokio::test]
    async fn open_send_reports_size_and_missing_files() {
        LitterTray::try_with_async(async |tray| {
            let _ = tray.create_text("exists.txt", "hello")?;
            let store = FsStore::default();
            let handle = store.open_send(&req("exists.txt", "out")).await.unwrap();
            assert_eq!(handle.size, 5);

            let missing = store.open_send(&req("nope.txt", "out")).await;
            assert!(matches!(missing, Err(TransferFailure::Permission)));
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn receive_commits_via_rename() {
        LitterTray::try_with_async(async |_tray| {
            let store = FsStore::default();
            let mut file = store.open_recv(&req("src", "dest.bin")).await.unwrap();
            file.write(b"payload").await.unwrap();
            file.commit(0o644).await.unwrap();

            assert_eq!(std::fs::read("dest.bin").unwrap(), b"payload");
            assert!(!std::fs::exists("dest.bin.part").unwrap());
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn discard_removes_partial() {
        LitterTray::try_with_async(async |_tray| {
            let store = FsStore::default();
            let mut file = store.open_recv(&req("src", "dest.bin")).await.unwrap();
            file.write(b"junk").await.unwrap();
            file.discard().await;
            assert!(!std::fs::exists("dest.bin").unwrap());
            assert!(!std::fs::exists("dest.bin.part").unwrap());
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn size_limit_refuses_large_announcements() {
        let store = FsStore {
            max_receive_size: Some(100),
        };
        let mut r = req("src", "dest");
        r.size = Some(101);
        assert!(matches!(
            store.open_recv(&r).await,
            Err(TransferFailure::Size)
        ));
    }
}
