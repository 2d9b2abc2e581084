//! Turning a local source into the files of an upload batch

use std::fs::File;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::types::UploadType;

/// A local file and where it lands on the platform
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    /// Local file
    pub local_path: PathBuf,
    /// Destination path in the project namespace
    pub object_path: String,
}

/// Files of one upload batch
#[derive(Clone, Debug)]
pub struct Discovered {
    /// How the batch is registered
    pub upload_type: UploadType,
    /// Files to upload
    pub files: Vec<SourceFile>,
    /// Archive created for a compressed folder upload
    pub archive: Option<PathBuf>,
    /// Destination folder node of the batch
    pub folder_node: String,
}

/// Collect the files under `source`.
///
/// A file uploads on its own. A folder uploads every regular file beneath it,
/// or a single `<folder>.zip` when `compress_zip` is set. Tags only apply to
/// single items, so a tagged uncompressed folder is rejected.
///
/// Destination paths are `target_folder/` followed by the path relative to
/// the source's parent directory.
pub fn discover(
    source: &Path,
    target_folder: &str,
    compress_zip: bool,
    tagged: bool,
) -> Result<Discovered> {
    let metadata = std::fs::metadata(source)?;
    let base = source.parent().unwrap_or(Path::new(""));
    let target_folder = target_folder.trim_matches('/');

    if !metadata.is_dir() {
        return Ok(Discovered {
            upload_type: UploadType::AsFile,
            files: vec![SourceFile {
                local_path: source.to_path_buf(),
                object_path: object_path(target_folder, &relative(source, base)?),
            }],
            archive: None,
            folder_node: target_folder.to_string(),
        });
    }

    let folder_node = object_path(target_folder, &relative(source, base)?);
    if compress_zip {
        let archive = zip_folder(source)?;
        return Ok(Discovered {
            upload_type: UploadType::AsFile,
            files: vec![SourceFile {
                object_path: object_path(target_folder, &relative(&archive, base)?),
                local_path: archive.clone(),
            }],
            archive: Some(archive),
            folder_node: target_folder.to_string(),
        });
    }
    if tagged {
        return Err(Error::config(
            "tags cannot be attached to a folder upload",
            "tags",
        ));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        files.push(SourceFile {
            object_path: object_path(target_folder, &relative(entry.path(), base)?),
            local_path: entry.into_path(),
        });
    }
    tracing::debug!(source = %source.display(), files = files.len(), "Folder discovered");

    Ok(Discovered {
        upload_type: UploadType::AsFolder,
        files,
        archive: None,
        folder_node,
    })
}

/// Compress `folder` into `<folder>.zip` next to it.
///
/// Entries are named relative to the folder's parent, so the archive
/// unpacks into a folder of the same name.
pub fn zip_folder(folder: &Path) -> Result<PathBuf> {
    let name = folder
        .file_name()
        .ok_or_else(|| Error::Other(format!("{} has no folder name", folder.display())))?;
    let mut archive_name = name.to_os_string();
    archive_name.push(".zip");
    let archive = folder.with_file_name(archive_name);
    let base = folder.parent().unwrap_or(Path::new(""));

    tracing::info!(folder = %folder.display(), archive = %archive.display(), "Compressing folder");
    let mut writer = zip::ZipWriter::new(File::create(&archive)?);
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in WalkDir::new(folder).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        writer.start_file(relative(entry.path(), base)?, options)?;
        std::io::copy(&mut File::open(entry.path())?, &mut writer)?;
    }
    writer.finish()?;
    Ok(archive)
}

fn relative(path: &Path, base: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(base)
        .map_err(|_| Error::Other(format!("{} is outside {}", path.display(), base.display())))?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

fn object_path(target_folder: &str, relative: &str) -> String {
    if target_folder.is_empty() {
        relative.to_string()
    } else {
        format!("{target_folder}/{relative}")
    }
}
