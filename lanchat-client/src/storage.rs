//! Where received files end up on disk.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::NaiveDateTime;
use lanchat_core::{FileKind, FileTransfer};

const MAX_FILE_NAME_BYTES: usize = 128;

pub fn kind_dir(kind: FileKind) -> &'static str {
    match kind {
        FileKind::Image => "Pictures",
        FileKind::Video => "Videos",
        FileKind::Audio => "Music",
        FileKind::Text | FileKind::Document | FileKind::Other => "Documents",
    }
}

pub fn sanitize_file_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return "file.bin".to_owned();
    }

    let mut out = String::with_capacity(trimmed.len());
    for ch in trimmed.chars() {
        if matches!(ch, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || ch.is_control() {
            out.push('_');
        } else {
            out.push(ch);
        }
    }
    if out.len() > MAX_FILE_NAME_BYTES {
        let mut cut = MAX_FILE_NAME_BYTES;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    if out.chars().all(|ch| ch == '.') {
        return "file.bin".to_owned();
    }
    out
}

/// Writes `file` below `download_dir` and returns the path used. An existing
/// file is never overwritten: the name gets a timestamp, then a counter.
/// Each candidate is claimed with `create_new`, so concurrent saves of the
/// same name end up in different files.
pub fn save_received_file(
    download_dir: &Path,
    file: &FileTransfer,
    now: NaiveDateTime,
) -> io::Result<PathBuf> {
    let dir = download_dir.join(kind_dir(file.kind));
    fs::create_dir_all(&dir)?;

    let safe = sanitize_file_name(&file.filename);
    for dest in candidates(&dir, &safe, now) {
        match OpenOptions::new().write(true).create_new(true).open(&dest) {
            Ok(mut out) => {
                out.write_all(&file.data)?;
                return Ok(dest);
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free file name for {safe} in {}", dir.display()),
    ))
}

/// The plain name, then `stem_<stamp>.ext`, then `stem_<stamp>_1.ext` up to `_200`.
fn candidates(dir: &Path, safe: &str, now: NaiveDateTime) -> Vec<PathBuf> {
    let safe_path = Path::new(safe);
    let stem = safe_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = safe_path.extension().and_then(|s| s.to_str());
    let stamp = now.format("%Y%m%d_%H%M%S");
    let named = |suffix: &str| match ext {
        Some(ext) => dir.join(format!("{stem}_{stamp}{suffix}.{ext}")),
        None => dir.join(format!("{stem}_{stamp}{suffix}")),
    };

    let mut out = vec![dir.join(safe), named("")];
    out.extend((1..=200).map(|i| named(&format!("_{i}"))));
    out
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::NaiveDate;

    use super::*;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|day| day.and_hms_opt(9, 30, 15))
            .expect("valid date")
    }

    fn transfer(name: &str, kind: FileKind, data: &'static [u8]) -> FileTransfer {
        FileTransfer::new("bob", name, kind, data.len() as u64, Bytes::from_static(data))
    }

    #[test]
    fn reserved_characters_are_replaced() {
        assert_eq!(sanitize_file_name("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_file_name("a:b*c?.txt"), "a_b_c_.txt");
        assert_eq!(sanitize_file_name("   "), "file.bin");
        assert_eq!(sanitize_file_name(".."), "file.bin");
    }

    #[test]
    fn long_names_are_cut_on_a_char_boundary() {
        let name = "文".repeat(100);
        let safe = sanitize_file_name(&name);
        assert!(safe.len() <= MAX_FILE_NAME_BYTES);
        assert!(safe.chars().all(|ch| ch == '文'));
    }

    #[test]
    fn files_are_sorted_by_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = save_received_file(dir.path(), &transfer("cat.png", FileKind::Image, b"png"), at())
            .expect("save image");
        assert_eq!(image, dir.path().join("Pictures").join("cat.png"));

        let doc = save_received_file(dir.path(), &transfer("a.txt", FileKind::Document, b"abc"), at())
            .expect("save document");
        assert_eq!(fs::read(doc).expect("read back"), b"abc");
    }

    #[test]
    fn existing_names_get_timestamp_then_counter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = transfer("report.pdf", FileKind::Document, b"1");

        let first = save_received_file(dir.path(), &file, at()).expect("first");
        let second = save_received_file(dir.path(), &file, at()).expect("second");
        let third = save_received_file(dir.path(), &file, at()).expect("third");

        let docs = dir.path().join("Documents");
        assert_eq!(first, docs.join("report.pdf"));
        assert_eq!(second, docs.join("report_20240501_093015.pdf"));
        assert_eq!(third, docs.join("report_20240501_093015_1.pdf"));
    }

    #[test]
    fn concurrent_saves_of_one_name_never_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let contents: Vec<Vec<u8>> = (0..8_u8).map(|i| vec![i; 1024]).collect();

        let saved: Vec<PathBuf> = std::thread::scope(|scope| {
            let handles: Vec<_> = contents
                .iter()
                .map(|data| {
                    let root = dir.path();
                    scope.spawn(move || {
                        let file = FileTransfer::new(
                            "bob",
                            "same.bin",
                            FileKind::Other,
                            data.len() as u64,
                            Bytes::copy_from_slice(data),
                        );
                        save_received_file(root, &file, at()).expect("save")
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("saver thread"))
                .collect()
        });

        let mut unique = saved.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), contents.len());
        for (path, data) in saved.iter().zip(&contents) {
            assert_eq!(&fs::read(path).expect("read back"), data);
        }
    }
}
