//! Streaming extraction of (possibly nested) zip archives into per-retailer raw files.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sepa_core::RetailerGroup;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use zip::ZipArchive;

const TABULAR_EXTENSIONS: [&str; 3] = ["csv", "txt", "tsv"];
const SEPA_CONTAINER_MARKER: &str = "comercio-sepa-";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("cannot open archive {path}: {reason}")]
    OpenArchive { path: String, reason: String },
    #[error("corrupt entry {entry}: {reason}")]
    CorruptEntry { entry: String, reason: String },
    #[error("entry {entry} nests containers more than one level deep")]
    NestedTooDeep { entry: String },
}

/// One tabular file spooled out of an archive, ready for normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFile {
    pub path: PathBuf,
    pub entry_name: String,
    pub container: Option<String>,
    pub retailer_group: RetailerGroup,
    pub chain_hint: Option<String>,
    pub byte_size: u64,
}

impl RawFile {
    /// Lowercased final path component of the entry (`productos.csv`).
    pub fn file_name(&self) -> String {
        entry_file_name(&self.entry_name)
    }

    pub fn label(&self) -> String {
        match &self.container {
            Some(container) => format!("{container}/{}", self.entry_name),
            None => self.entry_name.clone(),
        }
    }

    pub fn discard(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Chains to keep; empty keeps everything.
    pub allowed_chains: BTreeSet<String>,
}

impl ExtractOptions {
    fn allows(&self, chain_hint: Option<&str>) -> bool {
        match chain_hint {
            Some(chain) if !self.allowed_chains.is_empty() => self.allowed_chains.contains(chain),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractStats {
    pub entries_seen: usize,
    pub files_yielded: usize,
    pub containers_opened: usize,
    pub containers_skipped: usize,
    pub entries_skipped: usize,
    pub corrupt_entries: usize,
}

impl ExtractStats {
    pub fn merge(&mut self, other: &ExtractStats) {
        self.entries_seen += other.entries_seen;
        self.files_yielded += other.files_yielded;
        self.containers_opened += other.containers_opened;
        self.containers_skipped += other.containers_skipped;
        self.entries_skipped += other.entries_skipped;
        self.corrupt_entries += other.corrupt_entries;
    }
}

/// Parse the retailer id out of SEPA container names such as
/// `comercio-sepa-10_2024-10-17_09-05-12.zip`.
pub fn chain_hint_from_name(name: &str) -> Option<String> {
    let lower = name.to_ascii_lowercase();
    let start = lower.find(SEPA_CONTAINER_MARKER)? + SEPA_CONTAINER_MARKER.len();
    let digits: String = lower[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    (!digits.is_empty()).then_some(digits)
}

fn entry_file_name(entry_name: &str) -> String {
    entry_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(entry_name)
        .to_ascii_lowercase()
}

fn extension_of(file_name: &str) -> Option<&str> {
    file_name.rsplit_once('.').map(|(_, ext)| ext)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Outer,
    Inner,
}

#[derive(Debug)]
struct Settings {
    group: RetailerGroup,
    out_dir: PathBuf,
    options: ExtractOptions,
}

#[derive(Debug)]
struct InnerContainer {
    archive: ZipArchive<File>,
    next: usize,
    name: String,
    chain_hint: Option<String>,
    spool_path: PathBuf,
}

enum EntryOutcome {
    Yield(RawFile),
    Nested(InnerContainer),
    Skip,
    Fail(ExtractError),
}

/// Lazy, one-pass sequence of raw files inside an archive.
///
/// Nested containers are spooled to disk one at a time and removed once
/// exhausted. A bad entry yields an error item and the sequence moves on.
#[derive(Debug)]
pub struct ArchiveEntries {
    outer: ZipArchive<File>,
    next_outer: usize,
    inner: Option<InnerContainer>,
    settings: Settings,
    seq: usize,
    stats: ExtractStats,
}

pub fn extract_archive(
    archive_path: &Path,
    group: RetailerGroup,
    out_dir: &Path,
    options: ExtractOptions,
) -> Result<ArchiveEntries, ExtractError> {
    let open_error = |reason: String| ExtractError::OpenArchive {
        path: archive_path.display().to_string(),
        reason,
    };
    fs::create_dir_all(out_dir).map_err(|e| open_error(e.to_string()))?;
    let file = File::open(archive_path).map_err(|e| open_error(e.to_string()))?;
    let outer = ZipArchive::new(file).map_err(|e| open_error(e.to_string()))?;

    Ok(ArchiveEntries {
        outer,
        next_outer: 0,
        inner: None,
        settings: Settings {
            group,
            out_dir: out_dir.to_path_buf(),
            options,
        },
        seq: 0,
        stats: ExtractStats::default(),
    })
}

impl ArchiveEntries {
    pub fn stats(&self) -> &ExtractStats {
        &self.stats
    }

    fn record(&mut self, outcome: EntryOutcome) -> Option<Result<RawFile, ExtractError>> {
        match outcome {
            EntryOutcome::Yield(file) => {
                self.stats.files_yielded += 1;
                Some(Ok(file))
            }
            EntryOutcome::Nested(container) => {
                self.stats.containers_opened += 1;
                debug!(container = %container.name, "descending into nested container");
                self.inner = Some(container);
                None
            }
            EntryOutcome::Skip => None,
            EntryOutcome::Fail(err) => {
                self.stats.corrupt_entries += 1;
                warn!(error = %err, "skipping unreadable archive entry");
                Some(Err(err))
            }
        }
    }

    fn finish_inner(&mut self) {
        if let Some(container) = self.inner.take() {
            let spool_path = container.spool_path.clone();
            drop(container);
            if let Err(err) = fs::remove_file(&spool_path) {
                warn!(path = %spool_path.display(), error = %err, "could not remove spooled container");
            }
        }
    }
}

impl Iterator for ArchiveEntries {
    type Item = Result<RawFile, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(inner) = self.inner.as_mut() {
                if inner.next >= inner.archive.len() {
                    self.finish_inner();
                    continue;
                }
                let idx = inner.next;
                inner.next += 1;
                self.stats.entries_seen += 1;
                let container = inner.name.clone();
                let chain_hint = inner.chain_hint.clone();
                let outcome = match inner.archive.by_index(idx) {
                    Ok(mut entry) => {
                        let meta = EntryMeta {
                            raw_name: entry.name().to_string(),
                            is_dir: entry.is_dir(),
                            safe_path: entry.enclosed_name().is_some(),
                        };
                        handle_entry(
                            &mut entry,
                            meta,
                            Level::Inner,
                            Some((&container, chain_hint)),
                            &self.settings,
                            &mut self.seq,
                            &mut self.stats,
                        )
                    }
                    Err(err) => EntryOutcome::Fail(ExtractError::CorruptEntry {
                        entry: format!("{container}#{idx}"),
                        reason: err.to_string(),
                    }),
                };
                if let Some(item) = self.record(outcome) {
                    return Some(item);
                }
                continue;
            }

            if self.next_outer >= self.outer.len() {
                return None;
            }
            let idx = self.next_outer;
            self.next_outer += 1;
            self.stats.entries_seen += 1;
            let outcome = match self.outer.by_index(idx) {
                Ok(mut entry) => {
                    let meta = EntryMeta {
                        raw_name: entry.name().to_string(),
                        is_dir: entry.is_dir(),
                        safe_path: entry.enclosed_name().is_some(),
                    };
                    handle_entry(
                        &mut entry,
                        meta,
                        Level::Outer,
                        None,
                        &self.settings,
                        &mut self.seq,
                        &mut self.stats,
                    )
                }
                Err(err) => EntryOutcome::Fail(ExtractError::CorruptEntry {
                    entry: format!("#{idx}"),
                    reason: err.to_string(),
                }),
            };
            if let Some(item) = self.record(outcome) {
                return Some(item);
            }
        }
    }
}

impl Drop for ArchiveEntries {
    fn drop(&mut self) {
        self.finish_inner();
    }
}

#[derive(Debug)]
struct EntryMeta {
    raw_name: String,
    is_dir: bool,
    safe_path: bool,
}

fn handle_entry(
    entry: &mut impl Read,
    meta: EntryMeta,
    level: Level,
    parent: Option<(&String, Option<String>)>,
    settings: &Settings,
    seq: &mut usize,
    stats: &mut ExtractStats,
) -> EntryOutcome {
    let EntryMeta {
        raw_name,
        is_dir,
        safe_path,
    } = meta;
    if is_dir {
        return EntryOutcome::Skip;
    }
    if !safe_path {
        return EntryOutcome::Fail(ExtractError::CorruptEntry {
            entry: raw_name,
            reason: "unsafe entry path".to_string(),
        });
    }

    let file_name = entry_file_name(&raw_name);
    let extension = extension_of(&file_name).unwrap_or_default().to_string();

    if extension == "zip" {
        if level == Level::Inner {
            return EntryOutcome::Fail(ExtractError::NestedTooDeep { entry: raw_name });
        }
        let chain_hint = chain_hint_from_name(&file_name);
        if !settings.options.allows(chain_hint.as_deref()) {
            stats.containers_skipped += 1;
            debug!(entry = %raw_name, "container outside chain allow-list");
            return EntryOutcome::Skip;
        }
        *seq += 1;
        let spool_path = settings.out_dir.join(format!("{:05}-container.zip", *seq));
        if let Err(reason) = spool(entry, &spool_path) {
            return EntryOutcome::Fail(ExtractError::CorruptEntry {
                entry: raw_name,
                reason,
            });
        }
        let opened = File::open(&spool_path)
            .map_err(|e| e.to_string())
            .and_then(|f| ZipArchive::new(f).map_err(|e| e.to_string()));
        return match opened {
            Ok(archive) => EntryOutcome::Nested(InnerContainer {
                archive,
                next: 0,
                name: file_name,
                chain_hint,
                spool_path,
            }),
            Err(reason) => {
                let _ = fs::remove_file(&spool_path);
                EntryOutcome::Fail(ExtractError::CorruptEntry {
                    entry: raw_name,
                    reason,
                })
            }
        };
    }

    if !TABULAR_EXTENSIONS.contains(&extension.as_str()) {
        stats.entries_skipped += 1;
        return EntryOutcome::Skip;
    }

    *seq += 1;
    let path = settings.out_dir.join(format!("{:05}-{file_name}", *seq));
    match spool(entry, &path) {
        Ok(byte_size) => {
            let (container, chain_hint) = match parent {
                Some((name, hint)) => (Some(name.clone()), hint),
                None => (None, None),
            };
            EntryOutcome::Yield(RawFile {
                path,
                entry_name: raw_name,
                container,
                retailer_group: settings.group.clone(),
                chain_hint,
                byte_size,
            })
        }
        Err(reason) => EntryOutcome::Fail(ExtractError::CorruptEntry {
            entry: raw_name,
            reason,
        }),
    }
}

/// Stream one entry to disk; a failed copy leaves nothing behind.
fn spool(entry: &mut impl Read, dest: &Path) -> Result<u64, String> {
    let result = File::create(dest)
        .and_then(|mut out| io::copy(entry, &mut out))
        .map_err(|e| e.to_string());
    if result.is_err() {
        let _ = fs::remove_file(dest);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("start");
            writer.write_all(body).expect("write");
        }
        writer.finish().expect("finish").into_inner()
    }

    fn options(chains: &[&str]) -> ExtractOptions {
        ExtractOptions {
            allowed_chains: chains.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn chain_hint_parses_sepa_container_names() {
        assert_eq!(
            chain_hint_from_name("2024-10-17/comercio-sepa-10_2024-10-17_09-05-12.zip"),
            Some("10".to_string())
        );
        assert_eq!(chain_hint_from_name("Comercio-SEPA-9.zip"), Some("9".to_string()));
        assert_eq!(chain_hint_from_name("precios.zip"), None);
    }

    #[test]
    fn nested_containers_are_flattened_one_level() {
        let inner = zip_bytes(&[
            ("comercio.csv", b"id_comercio|id_bandera\n9|1\n"),
            ("productos.csv", b"id_producto\n7795735000328\n"),
            ("LEEME.pdf", b"%PDF"),
        ]);
        let outer = zip_bytes(&[
            ("2024-10-17/", b""),
            ("2024-10-17/comercio-sepa-9_2024.zip", &inner),
            ("2024-10-17/extra.csv", b"a,b\n1,2\n"),
        ]);
        let dir = tempdir().expect("tempdir");
        let archive = dir.path().join("outer.zip");
        fs::write(&archive, outer).expect("write");
        let out = dir.path().join("extract");

        let mut entries =
            extract_archive(&archive, RetailerGroup::sepa(), &out, ExtractOptions::default())
                .expect("open");
        let files: Vec<RawFile> = entries.by_ref().map(|r| r.expect("entry")).collect();

        assert_eq!(files.len(), 3);
        assert_eq!(files[0].file_name(), "comercio.csv");
        assert_eq!(files[0].container.as_deref(), Some("comercio-sepa-9_2024.zip"));
        assert_eq!(files[0].chain_hint.as_deref(), Some("9"));
        assert_eq!(files[1].file_name(), "productos.csv");
        assert_eq!(files[2].container, None);
        assert!(files.iter().all(|f| f.path.exists()));
        assert_eq!(entries.stats().entries_skipped, 1);
        assert_eq!(entries.stats().containers_opened, 1);

        let leftover_spools = fs::read_dir(&out)
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with("container.zip"))
            .count();
        assert_eq!(leftover_spools, 0);
    }

    #[test]
    fn corrupt_and_too_deep_entries_do_not_stop_the_sequence() {
        let deepest = zip_bytes(&[("productos.csv", b"x\n")]);
        let inner = zip_bytes(&[("deeper.zip", &deepest), ("productos.csv", b"x\n")]);
        let outer = zip_bytes(&[
            ("comercio-sepa-12.zip", &inner),
            ("comercio-sepa-15.zip", b"this is not a zip"),
            ("tail.csv", b"x\n"),
        ]);
        let dir = tempdir().expect("tempdir");
        let archive = dir.path().join("outer.zip");
        fs::write(&archive, outer).expect("write");

        let items: Vec<_> = extract_archive(
            &archive,
            RetailerGroup::sepa(),
            &dir.path().join("x"),
            ExtractOptions::default(),
        )
        .expect("open")
        .collect();

        assert_eq!(items.len(), 4);
        assert!(matches!(items[0], Err(ExtractError::NestedTooDeep { .. })));
        assert!(items[1].is_ok());
        assert!(matches!(items[2], Err(ExtractError::CorruptEntry { .. })));
        assert!(items[3].is_ok());
    }

    #[test]
    fn allow_list_skips_other_chains_without_spooling() {
        let inner = zip_bytes(&[("productos.csv", b"x\n")]);
        let outer = zip_bytes(&[
            ("comercio-sepa-9.zip", &inner),
            ("comercio-sepa-77.zip", &inner),
        ]);
        let dir = tempdir().expect("tempdir");
        let archive = dir.path().join("outer.zip");
        fs::write(&archive, outer).expect("write");

        let mut entries =
            extract_archive(&archive, RetailerGroup::sepa(), &dir.path().join("x"), options(&["9"]))
                .expect("open");
        let files: Vec<_> = entries.by_ref().collect::<Result<_, _>>().expect("files");

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].chain_hint.as_deref(), Some("9"));
        assert_eq!(entries.stats().containers_skipped, 1);
    }

    #[test]
    fn unreadable_archive_fails_up_front() {
        let dir = tempdir().expect("tempdir");
        let archive = dir.path().join("junk.zip");
        fs::write(&archive, b"junk").expect("write");
        let err = extract_archive(
            &archive,
            RetailerGroup::generic(),
            &dir.path().join("x"),
            ExtractOptions::default(),
        )
        .expect_err("junk");
        assert!(matches!(err, ExtractError::OpenArchive { .. }));
    }
}
