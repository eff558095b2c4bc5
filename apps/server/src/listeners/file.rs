//! File poller
//!
//! Picks up files matching a name pattern from an inbox directory. A file is
//! claimed by renaming it into the processing directory and committed by
//! renaming it into the archive (acknowledged) or error directory (dead
//! letter or quarantine) once the pipeline reports its outcome. Files still
//! in the processing directory at startup were claimed by a run that never
//! committed them and go back to the inbox.

use crate::config::FileSourceConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::pipeline::{InboundUnit, Intake, IntakeError};
use bytes::Bytes;
use chrono::Utc;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Where a polled file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileDisposition {
    Archived(PathBuf),
    Failed(PathBuf),
    /// Same name and content already archived
    Duplicate,
    /// Outcome not known; the file stays claimed until the next start
    Held,
}

/// Translate a `*`/`?` file-name glob into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// `name` with a UTC timestamp before its extension.
fn timestamped(name: &str) -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}.{}.{}", stem, stamp, ext),
        _ => format!("{}.{}", name, stamp),
    }
}

pub struct FilePoller {
    route: String,
    inbox: PathBuf,
    processing: PathBuf,
    archive: PathBuf,
    errors: PathBuf,
    pattern: Regex,
    content_type: Option<String>,
    poll_interval: Duration,
    outcome_timeout: Duration,
    intake: Intake,
}

impl FilePoller {
    pub fn new(route: &str, config: &FileSourceConfig, intake: Intake) -> Result<Self> {
        let pattern = glob_to_regex(&config.pattern).map_err(|e| {
            Error::Config(format!(
                "route '{}': invalid file pattern '{}': {}",
                route, config.pattern, e
            ))
        })?;
        Ok(Self {
            route: route.to_string(),
            inbox: config.directory.clone(),
            processing: config.processing_directory(),
            archive: config.archive_directory.clone(),
            errors: config.error_directory.clone(),
            pattern,
            content_type: config.content_type.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            outcome_timeout: Duration::from_secs(config.outcome_timeout_secs),
            intake,
        })
    }

    /// Create the working directories and return claimed-but-uncommitted
    /// files to the inbox. Returns how many were recovered.
    pub async fn prepare(&self) -> Result<usize> {
        for dir in [&self.inbox, &self.processing, &self.archive, &self.errors] {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut recovered = 0;
        for name in self.list(&self.processing).await? {
            tokio::fs::rename(self.processing.join(&name), self.inbox.join(&name)).await?;
            recovered += 1;
        }
        if recovered > 0 {
            tracing::warn!(
                route = %self.route,
                recovered,
                "Returned uncommitted files to the inbox"
            );
        }
        Ok(recovered)
    }

    /// Regular files in `dir` whose names match the pattern, sorted.
    async fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if self.pattern.is_match(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Process every file currently in the inbox, one at a time.
    pub async fn poll_once(&self) -> Result<Vec<(String, FileDisposition)>> {
        let mut processed = Vec::new();
        for name in self.list(&self.inbox).await? {
            let claimed = self.processing.join(&name);
            match tokio::fs::rename(self.inbox.join(&name), &claimed).await {
                Ok(()) => {}
                // Claimed by someone else between listing and rename
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            match self.process(&name, &claimed).await {
                Ok(disposition) => processed.push((name, disposition)),
                Err(Error::Intake(e)) => {
                    // Refused: give the file back and try again next poll.
                    tokio::fs::rename(&claimed, self.inbox.join(&name)).await?;
                    tracing::warn!(route = %self.route, file = %name, error = %e, "Intake refused file");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(processed)
    }

    async fn process(&self, name: &str, claimed: &Path) -> Result<FileDisposition> {
        let data = tokio::fs::read(claimed).await?;
        let digest = sha256_hex(&data);

        let archived = self.archive.join(name);
        if let Ok(existing) = tokio::fs::read(&archived).await {
            if sha256_hex(&existing) == digest {
                tracing::info!(route = %self.route, file = %name, sha256 = %digest, "File already archived, skipping");
                tokio::fs::remove_file(claimed).await?;
                return Ok(FileDisposition::Duplicate);
            }
        }

        let (unit, reply) = InboundUnit::new(
            self.route.clone(),
            format!("file:{}", self.inbox.join(name).display()),
            Bytes::from(data),
        )
        .content_type(self.content_type.clone())
        .annotate("file_name", name)
        .annotate("sha256", digest.clone())
        .with_reply();

        if let Err(e) = self.intake.submit(unit).await {
            let reason = match e {
                IntakeError::Busy => "busy",
                IntakeError::Closed => "closed",
            };
            metrics::MESSAGES_REFUSED
                .with_label_values(&[&self.route, reason])
                .inc();
            return Err(e.into());
        }
        metrics::MESSAGES_RECEIVED
            .with_label_values(&[&self.route, "file"])
            .inc();

        let outcome = match tokio::time::timeout(self.outcome_timeout, reply).await {
            Ok(Ok(outcome)) if !outcome.abandoned => outcome,
            Ok(_) => {
                tracing::warn!(route = %self.route, file = %name, "Processing interrupted, file stays claimed");
                return Ok(FileDisposition::Held);
            }
            Err(_) => {
                tracing::warn!(
                    route = %self.route,
                    file = %name,
                    timeout_secs = self.outcome_timeout.as_secs(),
                    "No outcome in time, file stays claimed"
                );
                return Ok(FileDisposition::Held);
            }
        };

        let target_dir = if outcome.is_acknowledged() {
            &self.archive
        } else {
            &self.errors
        };
        let target = commit_path(target_dir, name).await;
        tokio::fs::rename(claimed, &target).await?;

        tracing::info!(
            route = %self.route,
            file = %name,
            message_id = %outcome.message_id,
            status = %outcome.status,
            target = %target.display(),
            "File committed"
        );
        Ok(if outcome.is_acknowledged() {
            FileDisposition::Archived(target)
        } else {
            FileDisposition::Failed(target)
        })
    }

    /// Recover, then poll every `poll_interval` until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        if let Err(e) = self.prepare().await {
            tracing::error!(route = %self.route, error = %e, "File poller setup failed");
            return;
        }
        tracing::info!(route = %self.route, inbox = %self.inbox.display(), "File poller started");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.poll_once().await {
                tracing::error!(route = %self.route, error = %e, "File poll failed");
            }
        }
        tracing::info!(route = %self.route, "File poller stopped");
    }
}

/// `dir/name`, or a timestamped variant when that name is taken.
async fn commit_path(dir: &Path, name: &str) -> PathBuf {
    let plain = dir.join(name);
    match tokio::fs::try_exists(&plain).await {
        Ok(false) => plain,
        _ => dir.join(timestamped(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_patterns() {
        let re = glob_to_regex("*.hl7").unwrap();
        assert!(re.is_match("adt_001.hl7"));
        assert!(!re.is_match("adt_001.hl7.tmp"));
        assert!(!re.is_match("adt_001.txt"));

        let re = glob_to_regex("ADT_??.txt").unwrap();
        assert!(re.is_match("ADT_01.txt"));
        assert!(!re.is_match("ADT_001.txt"));

        let re = glob_to_regex("a+b(1).json").unwrap();
        assert!(re.is_match("a+b(1).json"));
        assert!(!re.is_match("aab(1).json"));
    }

    #[test]
    fn test_timestamped_keeps_extension() {
        let name = timestamped("lab.hl7");
        assert!(name.starts_with("lab."));
        assert!(name.ends_with(".hl7"));
        assert_ne!(name, "lab.hl7");

        assert!(timestamped("README").starts_with("README."));
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_prepare_recovers_claimed_files() {
        let root = tempfile::tempdir().unwrap();
        let config = FileSourceConfig {
            directory: root.path().join("in"),
            pattern: "*.hl7".to_string(),
            poll_interval_ms: 50,
            archive_directory: root.path().join("archive"),
            error_directory: root.path().join("error"),
            processing_directory: None,
            outcome_timeout_secs: 1,
            content_type: None,
        };
        let (intake, _rx) = Intake::channel(4, Duration::from_millis(10));
        let poller = FilePoller::new("lab", &config, intake).unwrap();

        tokio::fs::create_dir_all(config.processing_directory()).await.unwrap();
        tokio::fs::write(config.processing_directory().join("a.hl7"), b"MSH|")
            .await
            .unwrap();

        assert_eq!(poller.prepare().await.unwrap(), 1);
        assert!(config.directory.join("a.hl7").exists());
        assert!(!config.processing_directory().join("a.hl7").exists());
    }
}
