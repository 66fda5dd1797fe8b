//! Multi-file artifact bundling (§4.4: "for adapters that produce multiple
//! files it MAY bundle them (e.g. zip) before returning one artifact path").
//! `twmd`/`pinterest-dl` can each leave dozens to hundreds of files in a
//! job's work directory; returning only the newest one and then letting the
//! supervisor `remove_dir_all` the rest would silently discard the others.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use super::ytdlp::collect_single_file;
use crate::supervisor::adapter::Artifact;

/// Collect every regular file directly inside `work_dir`. A single file is
/// returned as-is; more than one is zipped into `<bundle_stem>.zip` so the
/// supervisor still has exactly one artifact path to finalize.
pub fn collect_bundle(work_dir: &Path, bundle_stem: &str) -> anyhow::Result<Artifact> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(work_dir)? {
        let entry = entry?;
        if entry.metadata()?.is_file() {
            files.push(entry.path());
        }
    }
    if files.is_empty() {
        anyhow::bail!("no output files produced in {work_dir:?}");
    }
    if files.len() == 1 {
        return collect_single_file(work_dir);
    }

    let zip_path = work_dir.join(format!("{bundle_stem}.zip"));
    write_zip(&files, &zip_path)?;
    let size = std::fs::metadata(&zip_path)
        .with_context(|| format!("failed to stat archive {}", zip_path.display()))?
        .len();
    Ok(Artifact {
        filename: zip_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("bundle.zip")
            .to_string(),
        path: zip_path,
        size: Some(size),
    })
}

fn write_zip(files: &[PathBuf], zip_path: &Path) -> anyhow::Result<()> {
    let out = File::create(zip_path)
        .with_context(|| format!("failed to create archive {}", zip_path.display()))?;
    let mut writer = ZipWriter::new(out);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut buf = Vec::new();
    for path in files {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("file").to_string();
        writer
            .start_file(&name, options)
            .with_context(|| format!("failed to start zip entry {name}"))?;
        buf.clear();
        File::open(path)
            .with_context(|| format!("failed to open {} for archiving", path.display()))?
            .read_to_end(&mut buf)
            .with_context(|| format!("failed to read {} for archiving", path.display()))?;
        writer
            .write_all(&buf)
            .with_context(|| format!("failed to write zip entry {name}"))?;
    }
    writer
        .finish()
        .with_context(|| format!("failed to finalize archive {}", zip_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_file_is_returned_unbundled() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"data").unwrap();
        let artifact = collect_bundle(dir.path(), "twitter-media").unwrap();
        assert_eq!(artifact.filename, "a.jpg");
    }

    #[test]
    fn multiple_files_are_zipped_into_one_artifact() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"one").unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"two").unwrap();
        let artifact = collect_bundle(dir.path(), "pinterest-media").unwrap();
        assert_eq!(artifact.filename, "pinterest-media.zip");
        let contents = std::fs::read(&artifact.path).unwrap();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(contents)).unwrap();
        assert_eq!(archive.len(), 2);
    }

    #[test]
    fn empty_work_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_bundle(dir.path(), "twitter-media").is_err());
    }
}
