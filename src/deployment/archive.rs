//! Release archive extraction with persistent file preservation.

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tokio::task::spawn_blocking;
use tracing::debug;

use crate::types::UpdateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn from_content_type(content_type: &str) -> Self {
        let content_type = content_type.to_lowercase();
        if content_type.contains("gzip") || content_type.contains("tar") {
            ArchiveFormat::TarGz
        } else {
            ArchiveFormat::Zip
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }
}

/// Replace `install_dir` with the contents of `release_file`, carrying the
/// listed persistent files across through `persist_dir`.
pub async fn extract_release(
    install_dir: &Path,
    persist_dir: &Path,
    release_file: &Path,
    persistent_files: &[String],
    format: ArchiveFormat,
) -> Result<(), UpdateError> {
    let install_dir = install_dir.to_owned();
    let persist_dir = persist_dir.to_owned();
    let release_file = release_file.to_owned();
    let persistent_files = persistent_files.to_vec();
    spawn_blocking(move || {
        extract_release_sync(
            &install_dir,
            &persist_dir,
            &release_file,
            &persistent_files,
            format,
        )
    })
    .await
    .map_err(|err| UpdateError::Update(format!("Extraction task failed: {err}")))?
}

fn extract_release_sync(
    install_dir: &Path,
    persist_dir: &Path,
    release_file: &Path,
    persistent_files: &[String],
    format: ArchiveFormat,
) -> Result<(), UpdateError> {
    fs::create_dir_all(persist_dir)?;
    if install_dir.is_dir() {
        for relative in persistent_files {
            let source = install_dir.join(relative);
            if source.exists() {
                move_path(&source, &persist_dir.join(relative))?;
            }
        }
        fs::remove_dir_all(install_dir)?;
    }
    fs::create_dir_all(install_dir)?;

    let file = File::open(release_file)?;
    match format {
        ArchiveFormat::Zip => zip::ZipArchive::new(file)?.extract(install_dir)?,
        ArchiveFormat::TarGz => tar::Archive::new(GzDecoder::new(file)).unpack(install_dir)?,
    }
    debug!(path = %install_dir.display(), ?format, "Extracted release");

    for relative in persistent_files {
        let source = persist_dir.join(relative);
        if !source.exists() {
            continue;
        }
        let destination = install_dir.join(relative);
        remove_path(&destination)?;
        move_path(&source, &destination)?;
    }
    Ok(())
}

/// Rename, falling back to copy and delete across filesystems.
fn move_path(source: &Path, destination: &Path) -> Result<(), UpdateError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    copy_recursive(source, destination)?;
    remove_path(source)
}

fn copy_recursive(source: &Path, destination: &Path) -> Result<(), UpdateError> {
    if source.is_dir() {
        fs::create_dir_all(destination)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            let target: PathBuf = destination.join(entry.file_name());
            copy_recursive(&entry.path(), &target)?;
        }
    } else {
        fs::copy(source, destination)?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<(), UpdateError> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let mut writer = zip::ZipWriter::new(File::create(path).expect("create"));
        for (name, contents) in files {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .expect("start file");
            writer.write_all(contents.as_bytes()).expect("write");
        }
        writer.finish().expect("finish");
    }

    #[tokio::test]
    async fn zip_release_keeps_persistent_files() {
        let work = TempDir::new().expect("tempdir");
        let install = work.path().join("mainsail");
        fs::create_dir_all(install.join("config")).expect("mkdir");
        fs::write(install.join("index.html"), "old").expect("write");
        fs::write(install.join("stale.js"), "old").expect("write");
        fs::write(install.join("config/settings.json"), "mine").expect("write");

        let release = work.path().join("mainsail.zip");
        write_zip(
            &release,
            &[("index.html", "new"), ("config/settings.json", "default")],
        );

        extract_release(
            &install,
            &work.path().join("persist"),
            &release,
            &["config/settings.json".to_string()],
            ArchiveFormat::Zip,
        )
        .await
        .expect("extract");

        assert_eq!(fs::read_to_string(install.join("index.html")).expect("read"), "new");
        assert!(!install.join("stale.js").exists());
        assert_eq!(
            fs::read_to_string(install.join("config/settings.json")).expect("read"),
            "mine"
        );
    }

    #[tokio::test]
    async fn tar_gz_release_into_missing_directory() {
        let work = TempDir::new().expect("tempdir");
        let source = work.path().join("src");
        fs::create_dir_all(&source).expect("mkdir");
        fs::write(source.join("index.html"), "fluidd").expect("write");

        let release = work.path().join("fluidd.tar.gz");
        let encoder = GzEncoder::new(File::create(&release).expect("create"), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder
            .append_path_with_name(source.join("index.html"), "index.html")
            .expect("append");
        builder.into_inner().expect("tar").finish().expect("gzip");

        let install = work.path().join("fluidd");
        extract_release(
            &install,
            &work.path().join("persist"),
            &release,
            &[],
            ArchiveFormat::from_content_type("application/gzip"),
        )
        .await
        .expect("extract");
        assert_eq!(fs::read_to_string(install.join("index.html")).expect("read"), "fluidd");
    }

    #[test]
    fn format_follows_content_type() {
        assert_eq!(ArchiveFormat::from_content_type("application/zip"), ArchiveFormat::Zip);
        assert_eq!(
            ArchiveFormat::from_content_type("application/x-gzip"),
            ArchiveFormat::TarGz
        );
        assert_eq!(ArchiveFormat::from_content_type("?"), ArchiveFormat::Zip);
    }
}
