use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

use crate::{Error, Result};

const TMP_SUFFIX: &str = ".tmp";

/// Durable named blobs. Names are relative, `/`-separated paths.
///
/// `write_atomic` must leave either the previous complete contents or the new
/// complete contents visible, never a mix. `append_durable` must not return
/// `Ok` before the bytes are on stable storage.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;
    async fn write_atomic(&self, name: &str, data: &[u8]) -> Result<()>;
    async fn append_durable(&self, name: &str, data: &[u8]) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn remove(&self, name: &str) -> Result<()>;
}

#[derive(Debug)]
pub struct FsStorage {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FsStorage {
    /// Opens (creating if needed) a storage root and sweeps temp files left by interrupted writes.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let storage = Self {
            root,
            tmp_counter: AtomicU64::new(0),
        };
        for name in storage.walk("").await? {
            if name.ends_with(TMP_SUFFIX) {
                warn!("Removing leftover temp file {}", name);
                fs::remove_file(storage.path(&name)).await?;
            }
        }
        Ok(storage)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn walk(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let relative = path
                    .strip_prefix(&self.root)
                    .map_err(|e| Error::Storage(e.to_string()))?
                    .to_string_lossy()
                    .replace('\\', "/");
                if relative.starts_with(prefix) {
                    names.push(relative);
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl Storage for FsStorage {
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(name)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomic(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path(name);
        let parent = path
            .parent()
            .ok_or_else(|| Error::Storage(format!("No parent for {name}")))?
            .to_path_buf();
        fs::create_dir_all(&parent).await?;

        let seq = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_file_name(format!(
            ".{}.{}.{}{}",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            std::process::id(),
            seq,
            TMP_SUFFIX
        ));

        {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await?;
        }

        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        sync_dir(&parent).await?;
        debug!("Atomically wrote {} ({} bytes)", name, data.len());
        Ok(())
    }

    async fn append_durable(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path(name);
        let parent = path
            .parent()
            .ok_or_else(|| Error::Storage(format!("No parent for {name}")))?
            .to_path_buf();
        fs::create_dir_all(&parent).await?;

        let (mut file, created) = match fs::OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => (file, true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                (fs::OpenOptions::new().append(true).open(&path).await?, false)
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_data().await?;
        // The first frame is only durable once the new directory entry is.
        if created {
            sync_dir(&parent).await?;
            debug!("Created {}", name);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .walk(prefix)
            .await?
            .into_iter()
            .filter(|name| !name.ends_with(TMP_SUFFIX))
            .collect())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process storage. Every write is trivially atomic; failures can be injected
/// to simulate a crash or a device that refuses to sync.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    data: DashMap<String, Vec<u8>>,
    fail_writes: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every write and append fails and leaves the stored bytes untouched.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Replaces raw bytes without any checks, for corruption tests.
    pub fn overwrite_raw(&self, name: &str, data: Vec<u8>) {
        self.data.insert(name.to_string(), data);
    }

    fn check_writable(&self, name: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("Injected write failure for {name}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(name).map(|v| v.clone()))
    }

    async fn write_atomic(&self, name: &str, data: &[u8]) -> Result<()> {
        self.check_writable(name)?;
        self.data.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn append_durable(&self, name: &str, data: &[u8]) -> Result<()> {
        self.check_writable(name)?;
        self.data
            .entry(name.to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.check_writable(name)?;
        self.data.remove(name);
        Ok(())
    }
}
