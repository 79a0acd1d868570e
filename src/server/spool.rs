use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static SPOOL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// On-disk scratch file holding exactly one inbound request body.
///
/// The session owns the spool while the body is being received; ownership
/// moves to the handler on dispatch and, unless the file was claimed with
/// [`BodySpool::into_path`], the file is unlinked when the last owner drops
/// it. There is never more than one owner.
#[derive(Debug)]
pub struct BodySpool {
    path: PathBuf,
    writer: Option<File>,
    len: u64,
}

impl BodySpool {
    pub fn create() -> io::Result<Self> {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let counter = SPOOL_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut path = std::env::temp_dir();
        path.push(format!("webserv_body_{}_{}_{}", std::process::id(), epoch, counter));

        let writer = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;

        Ok(Self { path, writer: Some(writer), len: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends body bytes as they arrive off the socket.
    pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "spool already finished"))?;
        writer.write_all(bytes)?;
        self.len += bytes.len() as u64;
        Ok(())
    }

    /// Closes the write handle once the body is complete. Reads stay
    /// possible through [`BodySpool::open_reader`].
    pub fn finish(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Opens an independent read handle, used to stream the body into a
    /// CGI child without disturbing ownership of the file itself.
    pub fn open_reader(&self) -> io::Result<File> {
        File::open(&self.path)
    }

    pub fn read_to_vec(&self) -> io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }

    /// Transfers ownership of the on-disk file to the caller; the spool
    /// will no longer unlink it. Used when an upload handler renames the
    /// file into its final place.
    pub fn into_path(mut self) -> PathBuf {
        self.writer = None;
        std::mem::take(&mut self.path)
    }
}

impl Drop for BodySpool {
    fn drop(&mut self) {
        self.writer = None;
        if !self.path.as_os_str().is_empty() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spool_round_trips_bytes() {
        let mut spool = BodySpool::create().expect("create");
        spool.write_all(b"HELLO").expect("write");
        spool.write_all(b" WORLD").expect("write");
        spool.finish().expect("finish");

        assert_eq!(spool.len(), 11);
        assert_eq!(spool.read_to_vec().expect("read"), b"HELLO WORLD");
    }

    #[test]
    fn spool_is_deleted_on_drop() {
        let path = {
            let mut spool = BodySpool::create().expect("create");
            spool.write_all(b"x").expect("write");
            spool.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn into_path_disarms_the_unlink() {
        let mut spool = BodySpool::create().expect("create");
        spool.write_all(b"keep me").expect("write");
        spool.finish().expect("finish");

        let path = spool.into_path();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).expect("read"), b"keep me");
        std::fs::remove_file(&path).expect("cleanup");
    }

    #[test]
    fn paths_are_unique_per_spool() {
        let a = BodySpool::create().expect("a");
        let b = BodySpool::create().expect("b");
        assert_ne!(a.path(), b.path());
        let name = a.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("webserv_body_"), "unexpected spool name {name}");
    }
}
