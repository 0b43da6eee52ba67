//! Resource upload/list/delete helper (§6 "Upload request", §4.1 dispatch
//! table). Files live under `<storage_location>/.untethered/resources/`.

use std::path::Path;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

const RESOURCES_SUBDIR: &str = ".untethered/resources";

pub struct UploadedResource {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
}

pub struct ResourceEntry {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
}

fn resources_dir(storage_location: &str) -> PathBuf {
    Path::new(storage_location).join(RESOURCES_SUBDIR)
}

/// Split `filename` into `(stem, extension_with_dot)`. A filename with no
/// extension gets an empty suffix.
fn split_name(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(0) | None => (filename, ""),
        Some(idx) => (&filename[..idx], &filename[idx..]),
    }
}

/// Decode `content` (base64) and write it under `storage_location`'s
/// resources directory. On a name collision the second upload is renamed
/// to `<stem>-<YYYYMMDDhhmmss>.<ext>` (§6).
pub fn upload(
    storage_location: &str,
    filename: &str,
    content: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> crate::error::Result<UploadedResource> {
    let dir = resources_dir(storage_location);
    std::fs::create_dir_all(&dir)?;

    let bytes = BASE64
        .decode(content)
        .map_err(|e| crate::error::CoreErr::Protocol(format!("invalid base64 content: {e}")))?;

    let mut target_name = filename.to_string();
    let mut target_path = dir.join(&target_name);
    if target_path.exists() {
        let (stem, ext) = split_name(filename);
        target_name = format!("{stem}-{}{ext}", now.format("%Y%m%d%H%M%S"));
        target_path = dir.join(&target_name);
    }

    std::fs::write(&target_path, &bytes)?;

    Ok(UploadedResource {
        filename: target_name,
        size: bytes.len() as u64,
        path: target_path,
    })
}

pub fn list(storage_location: &str) -> crate::error::Result<Vec<ResourceEntry>> {
    let dir = resources_dir(storage_location);
    let mut entries = Vec::new();
    let read_dir = match std::fs::read_dir(&dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e.into()),
    };
    for entry in read_dir {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let metadata = entry.metadata()?;
        entries.push(ResourceEntry {
            filename: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path(),
            size: metadata.len(),
        });
    }
    Ok(entries)
}

pub fn delete(storage_location: &str, filename: &str) -> crate::error::Result<()> {
    let path = resources_dir(storage_location).join(filename);
    std::fs::remove_file(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> chrono::DateTime<chrono::Utc> {
        #[allow(clippy::unwrap_used)]
        chrono::Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap()
    }

    #[test]
    fn upload_writes_decoded_content_under_the_resources_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let storage_location = dir.path().to_str().unwrap();
        let content = base64::engine::general_purpose::STANDARD.encode("hello");

        let uploaded = upload(storage_location, "a.txt", &content, fixed_now()).unwrap();

        assert_eq!(uploaded.filename, "a.txt");
        assert_eq!(uploaded.size, 5);
        assert!(uploaded.path.starts_with(dir.path().join(".untethered/resources")));
        assert_eq!(std::fs::read_to_string(&uploaded.path).unwrap(), "hello");
    }

    #[test]
    fn collision_renames_with_a_timestamp_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let storage_location = dir.path().to_str().unwrap();
        let content = base64::engine::general_purpose::STANDARD.encode("v1");

        let first = upload(storage_location, "a.txt", &content, fixed_now()).unwrap();
        let second = upload(storage_location, "a.txt", &content, fixed_now()).unwrap();

        assert_eq!(first.filename, "a.txt");
        assert_eq!(second.filename, "a-20260727120000.txt");
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage_location = dir.path().to_str().unwrap();
        let result = upload(storage_location, "a.txt", "not base64 !!!", fixed_now());
        assert!(result.is_err());
    }

    #[test]
    fn list_on_a_directory_that_was_never_created_is_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage_location = dir.path().to_str().unwrap();
        let entries = list(storage_location).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn delete_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage_location = dir.path().to_str().unwrap();
        let content = base64::engine::general_purpose::STANDARD.encode("x");
        upload(storage_location, "a.txt", &content, fixed_now()).unwrap();

        delete(storage_location, "a.txt").unwrap();
        assert!(list(storage_location).unwrap().is_empty());
    }
}
