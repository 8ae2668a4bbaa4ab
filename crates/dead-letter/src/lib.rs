use anyhow::Context;
use chrono::{DateTime, SubsecRound, Utc};
use mail_message::Message;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub mod artifact;

pub use artifact::{parse_artifact, StoredContent};

/// Upper bound on the `-2`, `-3`, ... serials tried when the
/// preferred artifact name is taken. Hitting it means something is
/// generating collisions far faster than the naming scheme expects.
const MAX_NAME_SERIAL: u32 = 100;

/// A message preserved on disk after delivery failed everywhere.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoredMessageRecord {
    pub file_name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Flat-directory store for undeliverable messages. One file per
/// message, written atomically via a temp file rename so a crash
/// never leaves a partial artifact behind. The directory is created
/// on first use; construction never touches the filesystem.
#[derive(Debug, Clone)]
pub struct DeadLetterStore {
    dir: PathBuf,
}

impl DeadLetterStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `message` as an artifact file. Never replaces an
    /// existing file: a same-second collision gets a serial-suffixed
    /// alternate name instead.
    pub async fn persist(&self, message: &Message) -> anyhow::Result<StoredMessageRecord> {
        // Whole seconds only; the file name can't encode more
        let created_at = Utc::now().trunc_subsecs(0);
        let dir = self.dir.clone();
        let file_name = artifact::artifact_file_name(message.recipient(), created_at);
        let contents = artifact::format_artifact(message);

        let record = tokio::task::spawn_blocking(move || {
            write_artifact(&dir, &file_name, contents.as_bytes(), created_at)
        })
        .await??;

        tracing::info!(
            "recorded undeliverable message for {} as {}",
            message.recipient(),
            record.path.display()
        );
        Ok(record)
    }

    /// Enumerate stored artifacts, oldest first. Files in the
    /// directory that don't follow the artifact naming pattern are
    /// ignored. A store whose directory doesn't exist yet is empty,
    /// not an error.
    pub async fn list(&self) -> anyhow::Result<Vec<StoredMessageRecord>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || scan_dir(&dir)).await?
    }

    pub async fn load(&self, file_name: &str) -> anyhow::Result<String> {
        let path = self.dir.join(file_name);
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }

    pub async fn remove(&self, file_name: &str) -> anyhow::Result<()> {
        let path = self.dir.join(file_name);
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("removing {}", path.display()))
    }
}

fn write_artifact(
    dir: &Path,
    file_name: &str,
    contents: &[u8],
    created_at: DateTime<Utc>,
) -> anyhow::Result<StoredMessageRecord> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating dead letter directory {}", dir.display()))?;

    let mut temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    temp.write_all(contents)?;
    temp.flush()?;

    let mut name = file_name.to_string();
    let mut serial = 2;
    loop {
        let target = dir.join(&name);
        match temp.persist_noclobber(&target) {
            Ok(_) => {
                return Ok(StoredMessageRecord {
                    file_name: name,
                    path: target,
                    created_at,
                    size_bytes: contents.len() as u64,
                });
            }
            Err(err)
                if err.error.kind() == std::io::ErrorKind::AlreadyExists
                    && serial <= MAX_NAME_SERIAL =>
            {
                temp = err.file;
                name = artifact::disambiguated(file_name, serial);
                serial += 1;
            }
            Err(err) => {
                return Err(err.error).with_context(|| format!("persisting {}", target.display()));
            }
        }
    }
}

fn scan_dir(dir: &Path) -> anyhow::Result<Vec<StoredMessageRecord>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };

    let mut records = vec![];
    for entry in entries {
        let entry = entry?;
        let file_name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        let Some(created_at) = artifact::artifact_timestamp(&file_name) else {
            continue;
        };
        let metadata = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        records.push(StoredMessageRecord {
            path: entry.path(),
            file_name,
            created_at,
            size_bytes: metadata.len(),
        });
    }

    // File names begin with the timestamp, so this is oldest-first
    records.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(records)
}
