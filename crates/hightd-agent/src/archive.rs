use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    Rar,
}

pub fn detect_kind(file_name: &str) -> Option<ArchiveKind> {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if lower.ends_with(".rar") {
        Some(ArchiveKind::Rar)
    } else {
        None
    }
}

/// `pack.zip` -> `pack`, `world.tar.gz` -> `world`.
pub fn derived_base_name(file_name: &str) -> String {
    let lower = file_name.to_ascii_lowercase();
    for ext in [".tar.gz", ".tgz", ".zip", ".rar"] {
        if lower.ends_with(ext) {
            return file_name[..file_name.len() - ext.len()].to_string();
        }
    }
    file_name.to_string()
}

/// Entry names come straight out of user-supplied archives: no `..`, no
/// absolute prefixes, nothing that would step outside the destination.
fn sanitize_entry(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    let trimmed = normalized.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }

    let mut out = PathBuf::new();
    for c in Path::new(trimmed).components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir | Component::Prefix(_) | Component::RootDir => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Whether every entry is the single top-level directory `top` or lies
/// within `top/`. Used with the archive's derived base name to decide
/// whether to strip that component on extraction.
pub fn single_top_level(entries: &[String], top: &str) -> bool {
    if entries.is_empty() || top.is_empty() {
        return false;
    }
    let prefix = format!("{top}/");
    entries.iter().all(|raw| {
        let e = raw.replace('\\', "/");
        let e = e.trim_start_matches('/').trim_end_matches('/');
        e == top || e.starts_with(&prefix)
    })
}

#[derive(Debug, Clone)]
pub struct EntryOutcome {
    pub entry: String,
    pub ok: bool,
    pub error: Option<String>,
}

pub fn list_entries(archive: &Path, kind: ArchiveKind) -> anyhow::Result<Vec<String>> {
    match kind {
        ArchiveKind::Zip => {
            let f = fs::File::open(archive)
                .with_context(|| format!("open archive {}", archive.display()))?;
            let mut zip = zip::ZipArchive::new(f).context("read zip archive")?;
            let mut out = Vec::with_capacity(zip.len());
            for i in 0..zip.len() {
                out.push(zip.by_index(i)?.name().to_string());
            }
            Ok(out)
        }
        ArchiveKind::TarGz => {
            let f = fs::File::open(archive)
                .with_context(|| format!("open archive {}", archive.display()))?;
            let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(f));
            let mut out = Vec::new();
            for entry in tar.entries().context("read tar archive")? {
                let entry = entry?;
                out.push(entry.path()?.to_string_lossy().into_owned());
            }
            Ok(out)
        }
        ArchiveKind::Rar => {
            let listing = unrar::Archive::new(archive)
                .open_for_listing()
                .map_err(|e| anyhow::anyhow!("open rar archive: {e}"))?;
            let mut out = Vec::new();
            for header in listing {
                let header = header.map_err(|e| anyhow::anyhow!("read rar header: {e}"))?;
                out.push(header.filename.to_string_lossy().into_owned());
            }
            Ok(out)
        }
    }
}

fn entry_destination(
    dest_root: &Path,
    raw_name: &str,
    strip_top: Option<&str>,
) -> Result<Option<PathBuf>, String> {
    let Some(rel) = sanitize_entry(raw_name) else {
        return Err("unsafe entry path".to_string());
    };

    let rel = match strip_top {
        Some(top) => match rel.strip_prefix(top) {
            // The top-level directory itself flattens away entirely.
            Ok(stripped) if stripped.as_os_str().is_empty() => return Ok(None),
            Ok(stripped) => stripped.to_path_buf(),
            Err(_) => rel,
        },
        None => rel,
    };

    let dest = dest_root.join(&rel);
    if !dest.starts_with(dest_root) {
        return Err("entry escapes the destination".to_string());
    }
    Ok(Some(dest))
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Extract an archive under `dest_root`, optionally stripping a single
/// top-level component. Every entry is sanitized; a bad entry is reported
/// and skipped rather than aborting the rest.
pub fn extract(
    archive: &Path,
    kind: ArchiveKind,
    dest_root: &Path,
    strip_top: Option<&str>,
) -> anyhow::Result<Vec<EntryOutcome>> {
    fs::create_dir_all(dest_root)
        .with_context(|| format!("create destination {}", dest_root.display()))?;
    match kind {
        ArchiveKind::Zip => extract_zip(archive, dest_root, strip_top),
        ArchiveKind::TarGz => extract_tar_gz(archive, dest_root, strip_top),
        ArchiveKind::Rar => extract_rar(archive, dest_root, strip_top),
    }
}

fn extract_zip(
    archive: &Path,
    dest_root: &Path,
    strip_top: Option<&str>,
) -> anyhow::Result<Vec<EntryOutcome>> {
    let f =
        fs::File::open(archive).with_context(|| format!("open archive {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(f).context("read zip archive")?;

    let mut results = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let mut file = zip.by_index(i)?;
        let name = file.name().to_string();
        let is_dir = name.ends_with('/');

        let dest = match entry_destination(dest_root, &name, strip_top) {
            Ok(Some(dest)) => dest,
            Ok(None) => continue,
            Err(reason) => {
                results.push(EntryOutcome {
                    entry: name,
                    ok: false,
                    error: Some(reason),
                });
                continue;
            }
        };

        let outcome = if is_dir {
            fs::create_dir_all(&dest).map_err(|e| e.to_string())
        } else {
            let write = (|| {
                ensure_parent(&dest)?;
                let mut out = fs::File::create(&dest)?;
                io::copy(&mut file, &mut out)?;
                Ok::<(), io::Error>(())
            })();
            write.map_err(|e| e.to_string())
        };
        results.push(EntryOutcome {
            entry: name,
            ok: outcome.is_ok(),
            error: outcome.err(),
        });
    }
    Ok(results)
}

fn extract_tar_gz(
    archive: &Path,
    dest_root: &Path,
    strip_top: Option<&str>,
) -> anyhow::Result<Vec<EntryOutcome>> {
    let f =
        fs::File::open(archive).with_context(|| format!("open archive {}", archive.display()))?;
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(f));

    let mut results = Vec::new();
    for entry in tar.entries().context("read tar archive")? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let entry_type = entry.header().entry_type();

        if !entry_type.is_file() && !entry_type.is_dir() {
            // Links and specials never land in a sandbox.
            results.push(EntryOutcome {
                entry: name,
                ok: false,
                error: Some("unsupported entry type".to_string()),
            });
            continue;
        }

        let dest = match entry_destination(dest_root, &name, strip_top) {
            Ok(Some(dest)) => dest,
            Ok(None) => continue,
            Err(reason) => {
                results.push(EntryOutcome {
                    entry: name,
                    ok: false,
                    error: Some(reason),
                });
                continue;
            }
        };

        let outcome = if entry_type.is_dir() {
            fs::create_dir_all(&dest).map_err(|e| e.to_string())
        } else {
            ensure_parent(&dest)
                .map_err(|e| e.to_string())
                .and_then(|_| entry.unpack(&dest).map(|_| ()).map_err(|e| e.to_string()))
        };
        results.push(EntryOutcome {
            entry: name,
            ok: outcome.is_ok(),
            error: outcome.err(),
        });
    }
    Ok(results)
}

fn extract_rar(
    archive: &Path,
    dest_root: &Path,
    strip_top: Option<&str>,
) -> anyhow::Result<Vec<EntryOutcome>> {
    let mut results = Vec::new();

    // A failed `extract_to` consumes the archive cursor, so isolating a bad
    // entry costs a reopen: fast-forward past everything already handled
    // and carry on with the remaining entries.
    let mut resume_at = 0usize;
    'archive: loop {
        let mut rar = unrar::Archive::new(archive)
            .open_for_processing()
            .map_err(|e| anyhow::anyhow!("open rar archive: {e}"))?;
        let mut index = 0usize;

        while let Some(header) = rar
            .read_header()
            .map_err(|e| anyhow::anyhow!("read rar header: {e}"))?
        {
            let position = index;
            index += 1;
            if position < resume_at {
                rar = header
                    .skip()
                    .map_err(|e| anyhow::anyhow!("skip rar entry: {e}"))?;
                continue;
            }
            resume_at = index;

            let name = header.entry().filename.to_string_lossy().into_owned();
            let is_file = header.entry().is_file();

            let dest = match entry_destination(dest_root, &name, strip_top) {
                Ok(Some(dest)) => Some(dest),
                Ok(None) => None,
                Err(reason) => {
                    results.push(EntryOutcome {
                        entry: name.clone(),
                        ok: false,
                        error: Some(reason),
                    });
                    None
                }
            };

            rar = match (dest, is_file) {
                (Some(dest), true) => {
                    if let Err(e) = ensure_parent(&dest) {
                        results.push(EntryOutcome {
                            entry: name,
                            ok: false,
                            error: Some(e.to_string()),
                        });
                        header
                            .skip()
                            .map_err(|e| anyhow::anyhow!("skip rar entry: {e}"))?
                    } else {
                        match header.extract_to(&dest) {
                            Ok(next) => {
                                results.push(EntryOutcome {
                                    entry: name,
                                    ok: true,
                                    error: None,
                                });
                                next
                            }
                            Err(e) => {
                                results.push(EntryOutcome {
                                    entry: name,
                                    ok: false,
                                    error: Some(e.to_string()),
                                });
                                continue 'archive;
                            }
                        }
                    }
                }
                (Some(dest), false) => {
                    let outcome = fs::create_dir_all(&dest).map_err(|e| e.to_string());
                    results.push(EntryOutcome {
                        entry: name,
                        ok: outcome.is_ok(),
                        error: outcome.err(),
                    });
                    header
                        .skip()
                        .map_err(|e| anyhow::anyhow!("skip rar entry: {e}"))?
                }
                (None, _) => header
                    .skip()
                    .map_err(|e| anyhow::anyhow!("skip rar entry: {e}"))?,
            };
        }
        break;
    }
    Ok(results)
}

fn add_path_to_zip<W: io::Write + io::Seek>(
    zip: &mut zip::ZipWriter<W>,
    abs: &Path,
    rel: &str,
) -> anyhow::Result<()> {
    let options = zip::write::SimpleFileOptions::default();
    let meta = fs::symlink_metadata(abs)
        .with_context(|| format!("stat {}", abs.display()))?;

    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.is_dir() {
        zip.add_directory(format!("{rel}/"), options)?;
        let mut children: Vec<_> = fs::read_dir(abs)?.flatten().collect();
        children.sort_by_key(|e| e.file_name());
        for child in children {
            let name = child.file_name().to_string_lossy().into_owned();
            add_path_to_zip(zip, &child.path(), &format!("{rel}/{name}"))?;
        }
        return Ok(());
    }

    zip.start_file(rel, options)?;
    let mut f = fs::File::open(abs).with_context(|| format!("open {}", abs.display()))?;
    io::copy(&mut f, zip).with_context(|| format!("archive {}", abs.display()))?;
    Ok(())
}

/// Build a zip from `(relative name, absolute path)` pairs; directories are
/// archived recursively.
pub fn create_zip(entries: &[(String, PathBuf)], out: &Path) -> anyhow::Result<()> {
    let f = fs::File::create(out)
        .with_context(|| format!("create archive {}", out.display()))?;
    let mut zip = zip::ZipWriter::new(f);
    for (rel, abs) in entries {
        add_path_to_zip(&mut zip, abs, rel)?;
    }
    zip.finish().context("finish archive")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_zip(dir: &Path, name: &str, entries: &[(&str, Option<&str>)]) -> PathBuf {
        let path = dir.join(name);
        let mut zip = zip::ZipWriter::new(fs::File::create(&path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        for (entry, contents) in entries {
            match contents {
                Some(data) => {
                    zip.start_file(*entry, options).unwrap();
                    zip.write_all(data.as_bytes()).unwrap();
                }
                None => {
                    zip.add_directory(*entry, options).unwrap();
                }
            }
        }
        zip.finish().unwrap();
        path
    }

    #[test]
    fn kind_detection_covers_all_supported_extensions() {
        assert_eq!(detect_kind("a.zip"), Some(ArchiveKind::Zip));
        assert_eq!(detect_kind("a.RAR"), Some(ArchiveKind::Rar));
        assert_eq!(detect_kind("a.tar.gz"), Some(ArchiveKind::TarGz));
        assert_eq!(detect_kind("a.tgz"), Some(ArchiveKind::TarGz));
        assert_eq!(detect_kind("a.7z"), None);
    }

    #[test]
    fn base_name_strips_the_archive_extension() {
        assert_eq!(derived_base_name("pack.zip"), "pack");
        assert_eq!(derived_base_name("world.tar.gz"), "world");
        assert_eq!(derived_base_name("w.tgz"), "w");
        assert_eq!(derived_base_name("plain"), "plain");
    }

    #[test]
    fn single_top_level_requires_every_entry_under_it() {
        let entries = vec![
            "pack/".to_string(),
            "pack/a.txt".to_string(),
            "pack/sub/b.txt".to_string(),
        ];
        assert!(single_top_level(&entries, "pack"));
        assert!(!single_top_level(&entries, "other"));

        let mixed = vec!["pack/a.txt".to_string(), "loose.txt".to_string()];
        assert!(!single_top_level(&mixed, "pack"));
        assert!(!single_top_level(&[], "pack"));
    }

    #[test]
    fn sanitize_rejects_escapes_and_absolutes() {
        assert!(sanitize_entry("../evil").is_none());
        assert!(sanitize_entry("a/../../evil").is_none());
        assert!(sanitize_entry("/").is_none());
        assert_eq!(
            sanitize_entry("/rooted/file"),
            Some(PathBuf::from("rooted/file"))
        );
        assert_eq!(sanitize_entry("a\\b"), Some(PathBuf::from("a/b")));
    }

    #[test]
    fn zip_extraction_with_flatten_strips_the_top_component() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = make_zip(
            tmp.path(),
            "pack.zip",
            &[
                ("pack/", None),
                ("pack/a.txt", Some("alpha")),
                ("pack/sub/b.txt", Some("beta")),
            ],
        );

        let entries = list_entries(&zip_path, ArchiveKind::Zip).unwrap();
        assert!(single_top_level(&entries, "pack"));

        let dest = tmp.path().join("x");
        let results = extract(&zip_path, ArchiveKind::Zip, &dest, Some("pack")).unwrap();
        assert!(results.iter().all(|r| r.ok));
        assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "alpha");
        assert_eq!(
            fs::read_to_string(dest.join("sub/b.txt")).unwrap(),
            "beta"
        );
        assert!(!dest.join("pack").exists());
    }

    #[test]
    fn zip_extraction_without_flatten_preserves_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = make_zip(
            tmp.path(),
            "pack.zip",
            &[("pack/a.txt", Some("alpha")), ("loose.txt", Some("l"))],
        );

        let dest = tmp.path().join("out");
        extract(&zip_path, ArchiveKind::Zip, &dest, None).unwrap();
        assert!(dest.join("pack/a.txt").exists());
        assert!(dest.join("loose.txt").exists());
    }

    #[test]
    fn malicious_zip_entries_are_reported_not_extracted() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = make_zip(tmp.path(), "evil.zip", &[("../escape.txt", Some("bad"))]);

        let dest = tmp.path().join("out");
        let results = extract(&zip_path, ArchiveKind::Zip, &dest, None).unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].ok);
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[test]
    fn tar_gz_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let tar_path = tmp.path().join("data.tar.gz");
        {
            let f = fs::File::create(&tar_path).unwrap();
            let enc = flate2::write::GzEncoder::new(f, flate2::Compression::default());
            let mut builder = tar::Builder::new(enc);
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "dir/file.txt", "hello".as_bytes())
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let entries = list_entries(&tar_path, ArchiveKind::TarGz).unwrap();
        assert_eq!(entries, vec!["dir/file.txt".to_string()]);

        let dest = tmp.path().join("out");
        let results = extract(&tar_path, ArchiveKind::TarGz, &dest, None).unwrap();
        assert!(results.iter().all(|r| r.ok));
        assert_eq!(
            fs::read_to_string(dest.join("dir/file.txt")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn rar_that_cannot_be_opened_is_an_error() {
        // The rar codec is extract-only, so a fixture cannot be authored
        // here; drive the path with an archive that fails to open.
        let tmp = tempfile::tempdir().unwrap();
        let rar_path = tmp.path().join("broken.rar");
        let mut bytes = b"Rar!\x1a\x07\x01\x00".to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        fs::write(&rar_path, &bytes).unwrap();

        assert!(list_entries(&rar_path, ArchiveKind::Rar).is_err());

        let dest = tmp.path().join("out");
        assert!(extract(&rar_path, ArchiveKind::Rar, &dest, None).is_err());
        // Nothing leaked into the destination.
        assert!(fs::read_dir(&dest).unwrap().next().is_none());
    }

    #[test]
    fn archive_then_unarchive_restores_the_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("top.txt"), "t").unwrap();
        fs::write(src.join("nested/deep.txt"), "d").unwrap();

        let out = tmp.path().join("backup.zip");
        create_zip(
            &[
                ("top.txt".to_string(), src.join("top.txt")),
                ("nested".to_string(), src.join("nested")),
            ],
            &out,
        )
        .unwrap();

        let dest = tmp.path().join("restored");
        let results = extract(&out, ArchiveKind::Zip, &dest, None).unwrap();
        assert!(results.iter().all(|r| r.ok));
        assert_eq!(fs::read_to_string(dest.join("top.txt")).unwrap(), "t");
        assert_eq!(
            fs::read_to_string(dest.join("nested/deep.txt")).unwrap(),
            "d"
        );
    }
}
