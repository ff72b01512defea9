//! Archive acquisition: download a zip over HTTP and unpack it.

use crate::error::StripError;
use crate::persistence::tmp_path;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use walkdir::WalkDir;

const FALLBACK_ARCHIVE_NAME: &str = "archive.zip";

/// A downloaded and extracted archive.
#[derive(Debug, Clone)]
pub struct FetchedArchive {
    pub archive_path: PathBuf,
    /// Extracted regular files, in archive order.
    pub files: Vec<PathBuf>,
    /// Whether an archive already on disk was used instead of downloading.
    pub reused: bool,
}

impl FetchedArchive {
    /// Find an extracted file by its file name.
    pub fn find(&self, file_name: &str) -> Option<&Path> {
        self.files
            .iter()
            .find(|p| p.file_name().is_some_and(|n| n == file_name))
            .map(PathBuf::as_path)
    }
}

/// Downloads zip archives.
pub struct ArchiveFetcher {
    client: reqwest::Client,
    reuse_existing: bool,
}

impl ArchiveFetcher {
    pub fn new(timeout: Duration, reuse_existing: bool) -> Result<Self, StripError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("graphstrip/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            reuse_existing,
        })
    }

    /// Download `url` into `dest_dir` and extract it there.
    pub async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<FetchedArchive, StripError> {
        std::fs::create_dir_all(dest_dir)?;
        let archive_path = dest_dir.join(archive_file_name(url));

        let reused = self.reuse_existing && archive_path.exists();
        if reused {
            info!(archive = %archive_path.display(), "Reusing downloaded archive");
        } else {
            self.download(url, &archive_path).await?;
        }

        let files = extract_zip(&archive_path, dest_dir)?;
        info!(
            archive = %archive_path.display(),
            files = files.len(),
            "Archive extracted"
        );
        Ok(FetchedArchive {
            archive_path,
            files,
            reused,
        })
    }

    async fn download(&self, url: &str, target: &Path) -> Result<(), StripError> {
        info!(url, target = %target.display(), "Downloading archive");
        let response = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| StripError::fetch(format!("{url}: {e}")))?;

        let tmp = tmp_path(target);
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, target).await?;

        debug!(bytes = written, "Download complete");
        Ok(())
    }
}

/// Last path segment of `url`, or `archive.zip` when there is none.
pub fn archive_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    match path.split_once('/') {
        Some((_, rest)) => rest
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(FALLBACK_ARCHIVE_NAME)
            .to_string(),
        None => FALLBACK_ARCHIVE_NAME.to_string(),
    }
}

/// Extract every entry of `archive` under `dest_dir`.
///
/// Fails without writing anything if an entry name would land outside
/// `dest_dir`.
pub fn extract_zip(archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, StripError> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| StripError::archive(format!("{}: {e}", archive.display())))?;

    let mut entries = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip.by_index_raw(i)?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            StripError::archive(format!("unsafe entry name '{}'", entry.name()))
        })?;
        entries.push((relative, entry.is_dir()));
    }

    std::fs::create_dir_all(dest_dir)?;
    let mut files = Vec::new();
    for (i, (relative, is_dir)) in entries.into_iter().enumerate() {
        let out_path = dest_dir.join(&relative);
        if is_dir {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut entry = zip.by_index(i)?;
        let mut out = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)?;
        debug!(file = %relative.display(), "Extracted");
        files.push(out_path);
    }
    Ok(files)
}

/// Search `dir` recursively for a file called `file_name`.
pub fn locate_file(dir: &Path, file_name: &str) -> Result<PathBuf, StripError> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .find(|e| e.file_name() == file_name)
        .map(|e| e.into_path())
        .ok_or_else(|| {
            StripError::not_found(format!("'{file_name}' under {}", dir.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_archive_file_name() {
        assert_eq!(
            archive_file_name("https://host/models/ssd_mobilenet.zip"),
            "ssd_mobilenet.zip"
        );
        assert_eq!(archive_file_name("https://host/a/b.zip?sig=1"), "b.zip");
        assert_eq!(archive_file_name("https://host/"), "archive.zip");
        assert_eq!(archive_file_name("https://host"), "archive.zip");
    }

    #[test]
    fn test_extract_nested_entries() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("a.zip");
        write_zip(
            &archive,
            &[("model/graph.pb", b"graph"), ("model/labels.txt", b"cat\ndog")],
        );

        let dest = dir.path().join("out");
        let files = extract_zip(&archive, &dest).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(std::fs::read(dest.join("model/graph.pb")).unwrap(), b"graph");

        let found = locate_file(&dest, "labels.txt").unwrap();
        assert_eq!(found, dest.join("model/labels.txt"));
        assert!(matches!(
            locate_file(&dest, "missing.pb"),
            Err(StripError::NotFound(_))
        ));
    }

    #[test]
    fn test_extract_rejects_escaping_entries() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("ok.txt", b"ok"), ("../escape.txt", b"bad")]);

        let dest = dir.path().join("out");
        let err = extract_zip(&archive, &dest).unwrap_err();
        assert!(matches!(err, StripError::Archive(_)));
        assert!(!dir.path().join("escape.txt").exists());
        assert!(!dest.join("ok.txt").exists());
    }

    #[test]
    fn test_extract_invalid_zip() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("broken.zip");
        std::fs::write(&archive, b"not a zip").unwrap();
        assert!(matches!(
            extract_zip(&archive, dir.path()),
            Err(StripError::Archive(_))
        ));
    }

    #[test]
    fn test_fetched_archive_find() {
        let fetched = FetchedArchive {
            archive_path: PathBuf::from("/m/a.zip"),
            files: vec![PathBuf::from("/m/x/graph.pb"), PathBuf::from("/m/x/labels.txt")],
            reused: false,
        };
        assert_eq!(fetched.find("graph.pb"), Some(Path::new("/m/x/graph.pb")));
        assert_eq!(fetched.find("graph"), None);
    }
}
