//! Stable archive builder.
//!
//! Produces byte-identical tar archives for identical logical content.
//! Entry metadata is canonicalized (uid/gid 0, owner `root`, mtime 0),
//! real files are written in sorted destination order followed by sorted
//! symlinks, and the archive is padded to whole 10240-byte records. The
//! header layout is GNU tar, so the resulting digests are reproducible by
//! any conforming GNU tar writer given the same input.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use strata_core::error::{Result, StrataError};
use tar::{Builder, EntryType, Header};

/// Size of one tar block.
const BLOCK_SIZE: u64 = 512;

/// Archives are zero-padded to a multiple of this many bytes.
const RECORD_SIZE: u64 = 20 * BLOCK_SIZE;

/// Longest name or link target that fits in a header without a long-link entry.
const NAME_FIELD_LEN: usize = 100;

/// Canonical owner for every entry.
const CANONICAL_OWNER: &str = "root";

/// Permission bits used for symlink entries.
const SYMLINK_MODE: u32 = 0o644;

/// Name of the pseudo-entry carrying an over-long name or link target.
const LONG_LINK_NAME: &[u8] = b"././@LongLink";

/// Map every regular file under `source_dir` to its destination inside the archive.
///
/// The destination is `tar_root` joined with the file's path relative to
/// `source_dir`; `tar_root` may be empty, `/`, or an absolute directory.
/// Symlinked files resolve to their real path. Directories (including
/// empty ones and symlinked ones) contribute no entries of their own.
pub fn map_source_dir(source_dir: &Path, tar_root: &str) -> Result<BTreeMap<String, PathBuf>> {
    let mut mapping = BTreeMap::new();
    walk_source_dir(source_dir, source_dir, tar_root, &mut mapping)?;
    Ok(mapping)
}

fn walk_source_dir(
    root: &Path,
    current: &Path,
    tar_root: &str,
    mapping: &mut BTreeMap<String, PathBuf>,
) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| StrataError::SourceUnavailable {
        path: current.display().to_string(),
        message: format!("Failed to read directory: {}", e),
    })?;

    for entry in read_dir {
        let entry = entry.map_err(|e| StrataError::SourceUnavailable {
            path: current.display().to_string(),
            message: format!("Failed to read directory entry: {}", e),
        })?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| StrataError::SourceUnavailable {
            path: path.display().to_string(),
            message: format!("Failed to read file type: {}", e),
        })?;

        if file_type.is_dir() {
            walk_source_dir(root, &path, tar_root, mapping)?;
            continue;
        }

        let source = if file_type.is_symlink() {
            let real = std::fs::canonicalize(&path).map_err(|e| StrataError::SourceUnavailable {
                path: path.display().to_string(),
                message: format!("Failed to resolve symlink: {}", e),
            })?;
            if real.is_dir() {
                continue;
            }
            real
        } else {
            path.clone()
        };

        let relative = path.strip_prefix(root).map_err(|e| {
            StrataError::ArchiveError(format!(
                "Failed to compute relative path for {}: {}",
                path.display(),
                e
            ))
        })?;
        mapping.insert(destination_path(tar_root, relative)?, source);
    }

    Ok(())
}

fn destination_path(tar_root: &str, relative: &Path) -> Result<String> {
    let parts = relative
        .components()
        .map(|c| {
            c.as_os_str().to_str().ok_or_else(|| {
                StrataError::ArchiveError(format!(
                    "Path is not valid UTF-8: {}",
                    relative.display()
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let relative = parts.join("/");

    Ok(if tar_root.is_empty() {
        relative
    } else if tar_root.ends_with('/') {
        format!("{}{}", tar_root, relative)
    } else {
        format!("{}/{}", tar_root, relative)
    })
}

/// Write a stable archive to `tar_path`.
///
/// `files` maps archive destination to source file; `symlinks` maps archive
/// destination to link target. Symlink targets are stored verbatim and never
/// checked against the filesystem.
pub fn create_stable_tar(
    tar_path: &Path,
    files: &BTreeMap<String, PathBuf>,
    symlinks: &BTreeMap<String, String>,
) -> Result<PathBuf> {
    let file = File::create(tar_path).map_err(|e| {
        StrataError::ArchiveError(format!(
            "Failed to create archive {}: {}",
            tar_path.display(),
            e
        ))
    })?;
    let mut builder = Builder::new(BufWriter::new(file));

    // BTreeMap iteration is the sorted destination order.
    for (destination, source) in files {
        append_file(&mut builder, destination, source)?;
    }
    for (destination, target) in symlinks {
        append_symlink(&mut builder, destination, target)?;
    }

    let mut writer = builder
        .into_inner()
        .map_err(|e| StrataError::ArchiveError(format!("Failed to finalize archive: {}", e)))?;
    let written = writer.stream_position()?;
    let remainder = written % RECORD_SIZE;
    if remainder != 0 {
        writer.write_all(&vec![0u8; (RECORD_SIZE - remainder) as usize])?;
    }
    writer.flush()?;

    tracing::debug!(
        path = %tar_path.display(),
        files = files.len(),
        symlinks = symlinks.len(),
        "Wrote stable archive"
    );
    Ok(tar_path.to_path_buf())
}

/// Walk `source_dir`, then write a stable archive rooted at `tar_root`.
pub fn create_stable_tar_from_directory(
    source_dir: &Path,
    tar_root: &str,
    tar_path: &Path,
    symlinks: &BTreeMap<String, String>,
) -> Result<PathBuf> {
    let files = map_source_dir(source_dir, tar_root)?;
    create_stable_tar(tar_path, &files, symlinks)
}

fn append_file<W: Write>(builder: &mut Builder<W>, destination: &str, source: &Path) -> Result<()> {
    let unavailable = |e: std::io::Error| StrataError::SourceUnavailable {
        path: source.display().to_string(),
        message: e.to_string(),
    };
    let file = File::open(source).map_err(unavailable)?;
    let metadata = file.metadata().map_err(unavailable)?;

    let name = entry_name(destination);
    append_long_link_if_needed(builder, EntryType::GNULongName, name)?;

    let mut header = canonical_header(EntryType::Regular, file_mode(&metadata), metadata.len())?;
    copy_truncated(&mut header.as_old_mut().name, name);
    write_checksum(&mut header);

    // The entry body must match the header size whether the file grows or shrinks.
    builder
        .append(&header, ExactLen::new(file, metadata.len()))
        .map_err(|e| StrataError::SourceUnavailable {
            path: source.display().to_string(),
            message: format!("Failed to add {} to archive: {}", destination, e),
        })
}

/// Reader yielding exactly `remaining` bytes of `inner`, failing with
/// `UnexpectedEof` if `inner` ends first.
struct ExactLen<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> ExactLen<R> {
    fn new(inner: R, len: u64) -> Self {
        Self {
            inner,
            remaining: len,
        }
    }
}

impl<R: Read> Read for ExactLen<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("file shrank while archiving, {} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn append_symlink<W: Write>(builder: &mut Builder<W>, destination: &str, target: &str) -> Result<()> {
    let name = entry_name(destination);
    append_long_link_if_needed(builder, EntryType::GNULongName, name)?;
    append_long_link_if_needed(builder, EntryType::GNULongLink, target.as_bytes())?;

    let mut header = canonical_header(EntryType::Symlink, SYMLINK_MODE, 0)?;
    copy_truncated(&mut header.as_old_mut().name, name);
    copy_truncated(&mut header.as_old_mut().linkname, target.as_bytes());
    write_checksum(&mut header);

    builder
        .append(&header, std::io::empty())
        .map_err(|e| StrataError::ArchiveError(format!("Failed to add symlink {}: {}", destination, e)))
}

/// Emit a `././@LongLink` entry when `value` does not fit in a header field.
fn append_long_link_if_needed<W: Write>(
    builder: &mut Builder<W>,
    kind: EntryType,
    value: &[u8],
) -> Result<()> {
    if value.len() <= NAME_FIELD_LEN {
        return Ok(());
    }

    let mut payload = value.to_vec();
    payload.push(0);

    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(payload.len() as u64);
    set_device_numbers(&mut header)?;
    copy_truncated(&mut header.as_old_mut().name, LONG_LINK_NAME);
    write_checksum(&mut header);

    builder
        .append(&header, payload.as_slice())
        .map_err(|e| StrataError::ArchiveError(format!("Failed to add long-link entry: {}", e)))
}

fn canonical_header(kind: EntryType, mode: u32, size: u64) -> Result<Header> {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode & 0o7777);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(size);
    header
        .set_username(CANONICAL_OWNER)
        .and_then(|_| header.set_groupname(CANONICAL_OWNER))
        .map_err(|e| StrataError::ArchiveError(format!("Failed to set entry owner: {}", e)))?;
    set_device_numbers(&mut header)?;
    Ok(header)
}

fn set_device_numbers(header: &mut Header) -> Result<()> {
    header
        .set_device_major(0)
        .and_then(|_| header.set_device_minor(0))
        .map_err(|e| StrataError::ArchiveError(format!("Failed to set device numbers: {}", e)))
}

/// Header checksum: six octal digits, NUL, space.
fn write_checksum(header: &mut Header) {
    let bytes = header.as_mut_bytes();
    bytes[148..156].fill(b' ');
    let sum: u32 = bytes.iter().map(|&b| u32::from(b)).sum();
    bytes[148..156].copy_from_slice(format!("{:06o}\0 ", sum).as_bytes());
}

/// Archive member names are relative to the archive root.
fn entry_name(destination: &str) -> &[u8] {
    destination.trim_start_matches('/').as_bytes()
}

fn copy_truncated(field: &mut [u8], value: &[u8]) {
    let n = value.len().min(field.len());
    field[..n].copy_from_slice(&value[..n]);
    field[n..].fill(0);
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_file;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const DIGEST_WITHOUT_SYMLINK: &str =
        "aeb2e9a07236f596375e21684e00e9adddbdac3a9e7414511a3e23647786b536";
    const DIGEST_WITH_SYMLINK: &str =
        "83b1d7da9b321e3a5033af2e238b2809f97d0901430df0105b61c837e836ab46";

    fn make_source_file(root: &Path, relpath: &str, content: &str) -> PathBuf {
        let path = root.join(relpath);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        path
    }

    fn setup_source() -> (TempDir, PathBuf, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let a = make_source_file(tmp.path(), "a/b/c.txt", "bar");
        let b = make_source_file(tmp.path(), "B/c/d.txt", "foo");
        // Must be ignored entirely
        fs::create_dir_all(tmp.path().join("empty")).unwrap();
        (tmp, a, b)
    }

    fn entry_names(tar_path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(File::open(tar_path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    // --- map_source_dir ---

    #[test]
    fn test_map_source_dir_with_app_root() {
        let (tmp, a, b) = setup_source();
        let mapping = map_source_dir(tmp.path(), "/data/app").unwrap();

        let expected: BTreeMap<String, PathBuf> = [
            ("/data/app/a/b/c.txt".to_string(), a),
            ("/data/app/B/c/d.txt".to_string(), b),
        ]
        .into_iter()
        .collect();
        assert_eq!(mapping, expected);
    }

    #[test]
    fn test_map_source_dir_with_slash_root() {
        let (tmp, _, _) = setup_source();
        let mapping = map_source_dir(tmp.path(), "/").unwrap();
        let keys: Vec<_> = mapping.keys().cloned().collect();
        assert_eq!(keys, vec!["/B/c/d.txt", "/a/b/c.txt"]);
    }

    #[test]
    fn test_map_source_dir_with_empty_root() {
        let (tmp, _, _) = setup_source();
        let mapping = map_source_dir(tmp.path(), "").unwrap();
        let keys: Vec<_> = mapping.keys().cloned().collect();
        assert_eq!(keys, vec!["B/c/d.txt", "a/b/c.txt"]);
    }

    #[test]
    fn test_map_source_dir_resolves_symlinked_file() {
        let (tmp, _, b) = setup_source();
        std::os::unix::fs::symlink(&b, tmp.path().join("link.txt")).unwrap();

        let mapping = map_source_dir(tmp.path(), "").unwrap();
        assert_eq!(mapping["link.txt"], fs::canonicalize(&b).unwrap());
    }

    #[test]
    fn test_map_source_dir_missing() {
        let result = map_source_dir(Path::new("/nonexistent/source"), "/data/app");
        assert!(matches!(result, Err(StrataError::SourceUnavailable { .. })));
    }

    // --- create_stable_tar ---

    #[test]
    fn test_create_stable_tar_contents_and_digest() {
        let (src, _, _) = setup_source();
        let out = TempDir::new().unwrap();
        let tar_path = out.path().join("test.tar");

        let files = map_source_dir(src.path(), "/data/app").unwrap();
        create_stable_tar(&tar_path, &files, &BTreeMap::new()).unwrap();

        assert_eq!(
            entry_names(&tar_path),
            vec!["data/app/B/c/d.txt", "data/app/a/b/c.txt"]
        );
        assert_eq!(digest_file(&tar_path).unwrap().hex(), DIGEST_WITHOUT_SYMLINK);
    }

    #[test]
    fn test_create_stable_tar_with_symlink_digest() {
        let (src, _, _) = setup_source();
        let out = TempDir::new().unwrap();
        let tar_path = out.path().join("test.tar");

        let files = map_source_dir(src.path(), "/data/app").unwrap();
        let symlinks: BTreeMap<String, String> = [(
            "/data/app/symlink.jar".to_string(),
            "foo/bar/symlink.jar".to_string(),
        )]
        .into_iter()
        .collect();
        create_stable_tar(&tar_path, &files, &symlinks).unwrap();

        assert_eq!(
            entry_names(&tar_path),
            vec!["data/app/B/c/d.txt", "data/app/a/b/c.txt", "data/app/symlink.jar"]
        );
        assert_eq!(digest_file(&tar_path).unwrap().hex(), DIGEST_WITH_SYMLINK);
    }

    #[test]
    fn test_create_stable_tar_is_deterministic() {
        let (src, _, _) = setup_source();
        let out = TempDir::new().unwrap();
        let first = out.path().join("first.tar");
        let second = out.path().join("second.tar");

        create_stable_tar_from_directory(src.path(), "/data/app", &first, &BTreeMap::new())
            .unwrap();
        // Touch a file's mtime; canonical metadata must hide it
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(3600);
        File::options()
            .write(true)
            .open(src.path().join("a/b/c.txt"))
            .unwrap()
            .set_modified(later)
            .unwrap();
        create_stable_tar_from_directory(src.path(), "/data/app", &second, &BTreeMap::new())
            .unwrap();

        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[test]
    fn test_create_stable_tar_symlinks_after_files() {
        let (src, _, _) = setup_source();
        let out = TempDir::new().unwrap();
        let tar_path = out.path().join("test.tar");

        let files = map_source_dir(src.path(), "/").unwrap();
        let symlinks: BTreeMap<String, String> =
            [("/0-first.jar".to_string(), "/data/deps/x.jar".to_string())]
                .into_iter()
                .collect();
        create_stable_tar(&tar_path, &files, &symlinks).unwrap();

        assert_eq!(
            entry_names(&tar_path),
            vec!["B/c/d.txt", "a/b/c.txt", "0-first.jar"]
        );
    }

    #[test]
    fn test_create_stable_tar_canonical_metadata() {
        let (src, _, _) = setup_source();
        let out = TempDir::new().unwrap();
        let tar_path = out.path().join("test.tar");

        let symlinks: BTreeMap<String, String> =
            [("/data/app/x.jar".to_string(), "/data/deps/x.jar".to_string())]
                .into_iter()
                .collect();
        create_stable_tar_from_directory(src.path(), "/data/app", &tar_path, &symlinks).unwrap();

        let mut archive = tar::Archive::new(File::open(&tar_path).unwrap());
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.uid().unwrap(), 0);
            assert_eq!(header.gid().unwrap(), 0);
            assert_eq!(header.mtime().unwrap(), 0);
            assert_eq!(header.username().unwrap(), Some("root"));
            assert_eq!(header.groupname().unwrap(), Some("root"));
            assert_eq!(header.mode().unwrap(), 0o644);
            if header.entry_type() == EntryType::Symlink {
                assert_eq!(
                    header.link_name().unwrap().unwrap().to_string_lossy(),
                    "/data/deps/x.jar"
                );
                assert_eq!(header.size().unwrap(), 0);
            }
        }
    }

    #[test]
    fn test_create_stable_tar_record_padding() {
        let (src, _, _) = setup_source();
        let out = TempDir::new().unwrap();
        let tar_path = out.path().join("test.tar");

        create_stable_tar_from_directory(src.path(), "/data/app", &tar_path, &BTreeMap::new())
            .unwrap();
        assert_eq!(fs::metadata(&tar_path).unwrap().len() % RECORD_SIZE, 0);
    }

    #[test]
    fn test_create_stable_tar_preserves_mode() {
        let src = TempDir::new().unwrap();
        let script = make_source_file(src.path(), "bin/run.sh", "#!/bin/sh\n");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let out = TempDir::new().unwrap();
        let tar_path = out.path().join("test.tar");

        create_stable_tar_from_directory(src.path(), "", &tar_path, &BTreeMap::new()).unwrap();

        let mut archive = tar::Archive::new(File::open(&tar_path).unwrap());
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().mode().unwrap(), 0o755);
    }

    #[test]
    fn test_create_stable_tar_long_names() {
        let src = TempDir::new().unwrap();
        let long_rel = format!("{}/{}.txt", "d".repeat(60), "f".repeat(60));
        make_source_file(src.path(), &long_rel, "long");
        let out = TempDir::new().unwrap();
        let tar_path = out.path().join("test.tar");

        let long_target = format!("/data/deps/{}.jar", "t".repeat(120));
        let symlinks: BTreeMap<String, String> =
            [("/data/app/link.jar".to_string(), long_target.clone())]
                .into_iter()
                .collect();
        create_stable_tar_from_directory(src.path(), "/data/app", &tar_path, &symlinks).unwrap();

        let mut archive = tar::Archive::new(File::open(&tar_path).unwrap());
        let entries: Vec<_> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                let name = e.path().unwrap().to_string_lossy().into_owned();
                let link = e
                    .link_name()
                    .unwrap()
                    .map(|l| l.to_string_lossy().into_owned());
                (name, link)
            })
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, format!("data/app/{}", long_rel));
        assert_eq!(entries[1].0, "data/app/link.jar");
        assert_eq!(entries[1].1.as_deref(), Some(long_target.as_str()));
    }

    #[test]
    fn test_create_stable_tar_missing_source() {
        let out = TempDir::new().unwrap();
        let tar_path = out.path().join("test.tar");
        let files: BTreeMap<String, PathBuf> = [(
            "/data/app/gone.txt".to_string(),
            PathBuf::from("/nonexistent/gone.txt"),
        )]
        .into_iter()
        .collect();

        let result = create_stable_tar(&tar_path, &files, &BTreeMap::new());
        assert!(matches!(result, Err(StrataError::SourceUnavailable { .. })));
    }

    #[test]
    fn test_exact_len_stops_at_length() {
        let mut out = Vec::new();
        std::io::copy(&mut ExactLen::new(&b"abcdef"[..], 4), &mut out).unwrap();
        assert_eq!(out, b"abcd");
    }

    #[test]
    fn test_exact_len_short_source_is_error() {
        let mut out = Vec::new();
        let err = std::io::copy(&mut ExactLen::new(&b"abc"[..], 5), &mut out).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_shrunk_source_does_not_produce_short_entry() {
        let mut builder = Builder::new(Vec::new());
        let mut header = canonical_header(EntryType::Regular, 0o644, 5).unwrap();
        copy_truncated(&mut header.as_old_mut().name, b"data/app/a.txt");
        write_checksum(&mut header);

        let result = builder.append(&header, ExactLen::new(&b"abc"[..], 5));
        assert!(result.is_err());
    }
}
