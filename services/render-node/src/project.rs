//! Project bundle retrieval.
//!
//! A project is either a directory used in place (`file:///dir`) or an
//! archive (`s3://bucket/proj.tar.gz`, `file:///srv/proj.zip`) that is
//! downloaded and unpacked below the work directory:
//!
//! ```text
//! WORK_DIR/
//!   framefarm-project.tmp/         current extraction, plus <archive>.etag
//!   framefarm-project.pre.tmp/     staging area, removed after every fetch
//! ```
//!
//! The archive is only downloaded again when its ETag changed.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use framefarm_cloud::{open_location, FetchOutcome, ObjectLocation, StoreOptions};
use framefarm_retry::RetryExecutor;
use tracing::{debug, info, warn};

use crate::error::NodeError;

pub const PROJECT_DIR: &str = "framefarm-project.tmp";
pub const STAGING_DIR: &str = "framefarm-project.pre.tmp";

/// Where and how to fetch the project.
#[derive(Debug, Clone)]
pub struct ProjectSource {
    pub url: String,
    pub work_dir: PathBuf,
    pub always_refetch: bool,
    pub store: StoreOptions,
}

/// Make the project available locally and return the directory renders
/// run from.
pub async fn get_project(source: &ProjectSource, retry: &RetryExecutor) -> Result<PathBuf, NodeError> {
    if let Some(path) = source.url.strip_prefix("file://") {
        let path = Path::new(path);
        if path.is_dir() {
            info!(project = %path.display(), "Using project directory in place");
            return Ok(path.to_path_buf());
        }
        if !path.is_file() {
            return Err(NodeError::Project(format!(
                "{} does not point to a directory or archive",
                source.url
            )));
        }
    }

    retry.run(|| fetch_project(source)).await?;
    top_dir(&source.work_dir.join(PROJECT_DIR))
}

/// Download and unpack the archive unless it is unchanged.
async fn fetch_project(source: &ProjectSource) -> Result<(), NodeError> {
    let location = ObjectLocation::parse(&source.url)?;
    let file_name = location
        .file_name()
        .ok_or_else(|| NodeError::Project(format!("{} names no file", source.url)))?
        .to_string();
    let store = open_location(location.store_location(), &source.store).await?;

    let project_dir = source.work_dir.join(PROJECT_DIR);
    let staging = source.work_dir.join(STAGING_DIR);
    let etag_name = format!("{file_name}.etag");

    let etag = if source.always_refetch {
        None
    } else {
        std::fs::read_to_string(project_dir.join(&etag_name))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    remove_dir_if_present(&staging)?;
    std::fs::create_dir_all(&staging).map_err(|e| NodeError::io(&staging, e))?;

    let result: Result<(), NodeError> = async {
        let archive = staging.join(&file_name);
        match store
            .fetch_parallel(&source.url, &archive, etag.as_deref())
            .await?
        {
            FetchOutcome::Unchanged => {
                info!(url = %source.url, "Retaining previous project download");
            }
            FetchOutcome::Downloaded { len, etag } => {
                info!(url = %source.url, bytes = len, "Downloaded project");
                std::fs::write(staging.join(&etag_name), format!("{etag}\n"))
                    .map_err(|e| NodeError::io(staging.join(&etag_name), e))?;

                let (archive_path, dest) = (archive.clone(), staging.clone());
                tokio::task::spawn_blocking(move || extract(&archive_path, &dest))
                    .await
                    .map_err(|e| NodeError::Project(format!("extraction task failed: {e}")))??;
                std::fs::remove_file(&archive).map_err(|e| NodeError::io(&archive, e))?;

                remove_dir_if_present(&project_dir)?;
                std::fs::rename(&staging, &project_dir)
                    .map_err(|e| NodeError::io(&project_dir, e))?;
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = remove_dir_if_present(&staging) {
        warn!(error = %e, "Failed to remove project staging directory");
    }
    result
}

fn remove_dir_if_present(path: &Path) -> Result<(), NodeError> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(NodeError::io(path, e)),
        _ => Ok(()),
    }
}

fn archive_error(archive: &Path, e: impl std::fmt::Display) -> NodeError {
    NodeError::Project(format!("failed to unpack {}: {e}", archive.display()))
}

/// Unpack `archive` into `dest`, choosing the format by extension.
fn extract(archive: &Path, dest: &Path) -> Result<(), NodeError> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let file = File::open(archive).map_err(|e| NodeError::io(archive, e))?;
    debug!(archive = %archive.display(), dest = %dest.display(), "Unpacking project");

    if name.ends_with(".zip") {
        zip::ZipArchive::new(file)
            .and_then(|mut zip| zip.extract(dest))
            .map_err(|e| archive_error(archive, e))
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        tar::Archive::new(GzDecoder::new(file))
            .unpack(dest)
            .map_err(|e| archive_error(archive, e))
    } else {
        tar::Archive::new(file)
            .unpack(dest)
            .map_err(|e| archive_error(archive, e))
    }
}

fn ignored(name: &str) -> bool {
    name == "lost+found" || name.starts_with('.') || name.ends_with(".etag")
}

/// The single top-level directory of `dir`, if that is all it holds
/// (ignoring `lost+found`, dot-files and ETag files), otherwise `dir`.
pub fn top_dir(dir: &Path) -> Result<PathBuf, NodeError> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| NodeError::io(dir, e))? {
        let entry = entry.map_err(|e| NodeError::io(dir, e))?;
        let name = entry.file_name();
        if ignored(&name.to_string_lossy()) {
            continue;
        }
        let file_type = entry.file_type().map_err(|e| NodeError::io(entry.path(), e))?;
        if !file_type.is_dir() {
            return Ok(dir.to_path_buf());
        }
        dirs.push(entry.path());
    }

    match <[PathBuf; 1]>::try_from(dirs) {
        Ok([only]) => Ok(only),
        Err(_) => Ok(dir.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use framefarm_retry::RetryPolicy;

    use super::*;

    fn tarball(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn source(url: String, work_dir: &Path) -> ProjectSource {
        ProjectSource {
            url,
            work_dir: work_dir.to_path_buf(),
            always_refetch: false,
            store: StoreOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_directory_used_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("file://{}", dir.path().display());
        let project = get_project(
            &source(url, dir.path()),
            &RetryExecutor::new(RetryPolicy::immediate(1)),
        )
        .await
        .unwrap();
        assert_eq!(project, dir.path());
    }

    #[tokio::test]
    async fn test_missing_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("file://{}", dir.path().join("nope").display());
        let result = get_project(
            &source(url, dir.path()),
            &RetryExecutor::new(RetryPolicy::immediate(1)),
        )
        .await;
        assert!(matches!(result, Err(NodeError::Project(_))));
    }

    #[tokio::test]
    async fn test_archive_fetched_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("shot.tar.gz");
        tarball(&archive, &[("shot/scene.blend", b"scene")]);

        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();
        let src = source(format!("file://{}", archive.display()), &work);
        let retry = RetryExecutor::new(RetryPolicy::immediate(1));

        let project = get_project(&src, &retry).await.unwrap();
        assert_eq!(project, work.join(PROJECT_DIR).join("shot"));
        assert_eq!(std::fs::read(project.join("scene.blend")).unwrap(), b"scene");
        assert!(work.join(PROJECT_DIR).join("shot.tar.gz.etag").exists());
        assert!(!work.join(STAGING_DIR).exists());

        // Same archive: the previous extraction is kept.
        std::fs::write(project.join("marker"), b"kept").unwrap();
        let again = get_project(&src, &retry).await.unwrap();
        assert_eq!(again, project);
        assert!(again.join("marker").exists());
        assert!(!work.join(STAGING_DIR).exists());
    }

    #[tokio::test]
    async fn test_zip_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("proj.zip");
        {
            let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
            zip.start_file("render.sh", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"echo hi").unwrap();
            zip.finish().unwrap();
        }

        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();
        let project = get_project(
            &source(format!("file://{}", archive.display()), &work),
            &RetryExecutor::new(RetryPolicy::immediate(1)),
        )
        .await
        .unwrap();
        assert_eq!(project, work.join(PROJECT_DIR));
        assert!(project.join("render.sh").exists());
    }

    #[test]
    fn test_top_dir_rules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("lost+found")).unwrap();
        std::fs::create_dir(dir.path().join("project")).unwrap();
        std::fs::write(dir.path().join("proj.tar.etag"), "x").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();
        assert_eq!(top_dir(dir.path()).unwrap(), dir.path().join("project"));

        std::fs::write(dir.path().join("readme.txt"), "x").unwrap();
        assert_eq!(top_dir(dir.path()).unwrap(), dir.path());
    }

    #[test]
    fn test_top_dir_with_two_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        assert_eq!(top_dir(dir.path()).unwrap(), dir.path());
    }
}
