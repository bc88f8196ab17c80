//! Corpus synchronization: pull the seed archive at cycle start, push the
//! grown corpus at cycle end.
//!
//! The archive is a zip whose single top-level directory is
//! `<repo>_corpus/`, mirroring the on-disk layout
//! `<pkg>/testdata/fuzz/<Target>/<input-id>`.

use crate::config::ensure_dir;
use crate::storage::ObjectStore;
use anyhow::Context;
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

pub fn archive_key(repo: &str) -> String {
    format!("{}_corpus.zip", repo)
}

fn top_dir(repo: &str) -> String {
    format!("{}_corpus", repo)
}

/// Downloads the corpus archive into `corpus_dir`. A missing archive is
/// not an error: the cycle starts with an empty corpus. Returns the number
/// of extracted input files.
pub fn sync_in(
    store: &dyn ObjectStore,
    bucket: &str,
    repo: &str,
    corpus_dir: &Path,
) -> anyhow::Result<usize> {
    ensure_dir(corpus_dir)?;
    let key = archive_key(repo);
    let data = match store
        .fetch(bucket, &key)
        .with_context(|| format!("failed to fetch corpus archive {}/{}", bucket, key))?
    {
        Some(data) => data,
        None => {
            log::info!(
                "no corpus archive at {}/{}, starting with an empty corpus",
                bucket,
                key
            );
            return Ok(0);
        }
    };

    let n = unpack(&data, &top_dir(repo), corpus_dir)
        .with_context(|| format!("failed to unpack corpus archive {}/{}", bucket, key))?;
    log::info!("corpus sync in: {} input(s)", n);
    Ok(n)
}

/// Packages `corpus_dir` and uploads it. Returns the number of archived
/// input files.
pub fn sync_out(
    store: &dyn ObjectStore,
    bucket: &str,
    repo: &str,
    corpus_dir: &Path,
) -> anyhow::Result<usize> {
    let (data, n) = pack(corpus_dir, &top_dir(repo)).context("failed to package corpus")?;
    let key = archive_key(repo);
    store
        .put(bucket, &key, &data)
        .with_context(|| format!("failed to upload corpus archive {}/{}", bucket, key))?;
    log::info!("corpus sync out: {} input(s)", n);
    Ok(n)
}

/// Creates `<corpus_dir>/<pkg>/testdata/fuzz/<target>` for every target so
/// sandbox bind mounts always resolve.
pub fn ensure_target_dirs(
    corpus_dir: &Path,
    pkg: &str,
    targets: &[String],
) -> anyhow::Result<()> {
    let base = corpus_dir.join(pkg).join("testdata").join("fuzz");
    for target in targets {
        ensure_dir(&base.join(target))?;
    }
    Ok(())
}

/// Host directory of one package's corpus, the tree mounted read-write
/// into that package's sandboxes.
pub fn pkg_corpus_dir(corpus_dir: &Path, pkg: &str) -> PathBuf {
    corpus_dir.join(pkg).join("testdata").join("fuzz")
}

fn pack(dir: &Path, top: &str) -> anyhow::Result<(Vec<u8>, usize)> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default();
    let mut count = 0;
    add_dir(&mut zip, dir, Path::new(top), options, &mut count)?;
    let cursor = zip.finish().context("failed to finalize corpus archive")?;
    Ok((cursor.into_inner(), count))
}

fn add_dir(
    zip: &mut ZipWriter<Cursor<Vec<u8>>>,
    dir: &Path,
    prefix: &Path,
    options: FileOptions,
    count: &mut usize,
) -> anyhow::Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let name = prefix.join(entry.file_name());
        let name = name.to_string_lossy().replace('\\', "/");
        if path.is_dir() {
            zip.add_directory(format!("{}/", name), options)?;
            add_dir(zip, &path, &prefix.join(entry.file_name()), options, count)?;
        } else {
            zip.start_file(name, options)?;
            let data = fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            zip.write_all(&data)?;
            *count += 1;
        }
    }
    Ok(())
}

fn unpack(data: &[u8], top: &str, dest: &Path) -> anyhow::Result<usize> {
    let mut archive =
        ZipArchive::new(Cursor::new(data)).context("corpus archive is not a valid zip")?;
    let mut count = 0;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let Some(path) = file.enclosed_name().map(Path::to_path_buf) else {
            log::warn!("skipping corpus entry with unsafe path: {:?}", file.name());
            continue;
        };
        let Ok(rel) = path.strip_prefix(top) else {
            log::warn!(
                "skipping corpus entry outside {:?}: {}",
                top,
                path.display()
            );
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out_path = dest.join(rel);
        if file.is_dir() {
            ensure_dir(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            ensure_dir(parent)?;
        }
        let mut out = File::create(&out_path)
            .with_context(|| format!("failed to create {}", out_path.display()))?;
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)?;
        out.write_all(&buf)?;
        count += 1;
    }
    Ok(count)
}
