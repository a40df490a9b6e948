//! Deterministic fixture generation
//!
//! A [`FixtureSet`] names the files `0.raw ..= (count-1).raw`, each exactly
//! `size_mb` MiB long and filled with [`PATTERN`] repeated end to end. The
//! byte at offset `i` of every fixture is `PATTERN[i % PATTERN.len()]`, so the
//! content is identical across runs and machines for the same configuration.
//!
//! [`FixtureSet::reconcile`] brings a directory into agreement with the set
//! while touching as little as possible: correctly sized files are left alone,
//! anything else is removed, and only missing files are written.

use log::{debug, info};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Repeating content of every fixture
pub const PATTERN: &[u8] = b"hello";

/// Repetitions of [`PATTERN`] in one write buffer. The buffer length is a
/// multiple of the pattern length, so consecutive chunks continue the pattern.
const PATTERN_REPEATS: usize = 1024 * 1024;

/// Extension of the fixture files
pub const FIXTURE_EXT: &str = "raw";

/// Suffix of files still being written; never part of the set.
const PARTIAL_SUFFIX: &str = ".partial";

const MIB: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("Fixture IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T, FixtureError>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T, FixtureError> {
        self.map_err(|source| FixtureError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Outcome of a reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Expected files that were already present with the right size
    pub kept: Vec<String>,
    /// Entries deleted because they were unexpected or wrongly sized
    pub removed: Vec<String>,
    /// Files written during this pass
    pub written: Vec<String>,
}

impl ReconcileReport {
    /// True when the pass wrote nothing
    pub fn is_noop(&self) -> bool {
        self.written.is_empty() && self.removed.is_empty()
    }
}

/// The expected contents of a fixture directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureSet {
    count: usize,
    size_mb: u64,
}

impl FixtureSet {
    pub fn new(count: usize, size_mb: u64) -> Self {
        Self { count, size_mb }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Exact length of every file in bytes
    pub fn file_size(&self) -> u64 {
        self.size_mb * MIB
    }

    /// Expected file names in index order
    pub fn names(&self) -> Vec<String> {
        (0..self.count)
            .map(|i| format!("{}.{}", i, FIXTURE_EXT))
            .collect()
    }

    /// Expected byte at `offset` of any fixture file
    pub fn expected_byte(offset: u64) -> u8 {
        PATTERN[(offset % PATTERN.len() as u64) as usize]
    }

    /// Ensure `dir` holds exactly this set.
    ///
    /// Running this twice with no external changes performs no writes on
    /// the second call.
    pub fn reconcile(&self, dir: &Path) -> Result<ReconcileReport, FixtureError> {
        if !dir.exists() {
            info!("Creating fixture directory {:?}", dir);
            fs::create_dir_all(dir).at(dir)?;
        }

        let expected_size = self.file_size();
        let mut missing: BTreeSet<String> = self.names().into_iter().collect();
        let mut report = ReconcileReport::default();

        let mut entries: Vec<_> = fs::read_dir(dir)
            .at(dir)?
            .collect::<io::Result<Vec<_>>>()
            .at(dir)?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = entry.metadata().at(&path)?;

            let keep = metadata.is_file()
                && metadata.len() == expected_size
                && missing.contains(&name);

            if keep {
                debug!("Keeping fixture {}", name);
                missing.remove(&name);
                report.kept.push(name);
            } else {
                debug!(
                    "Removing stale entry {} ({} bytes, expected {})",
                    name,
                    metadata.len(),
                    expected_size
                );
                if metadata.is_dir() {
                    fs::remove_dir_all(&path).at(&path)?;
                } else {
                    fs::remove_file(&path).at(&path)?;
                }
                report.removed.push(name);
            }
        }

        // Write in index order so progress reads 0.raw, 1.raw, ...
        let mut to_write: Vec<String> = missing.into_iter().collect();
        to_write.sort_by_key(|name| fixture_index(name));

        if !to_write.is_empty() {
            let chunk = PATTERN.repeat(PATTERN_REPEATS);
            for name in to_write {
                print!("\rWriting... {}", name);
                let _ = io::stdout().flush();
                write_fixture(&dir.join(&name), expected_size, &chunk)?;
                report.written.push(name);
            }
            println!("\r{}\rWriting... Done", " ".repeat(30));
        }

        info!(
            "Fixtures in {:?}: {} kept, {} removed, {} written",
            dir,
            report.kept.len(),
            report.removed.len(),
            report.written.len()
        );

        Ok(report)
    }
}

fn fixture_index(name: &str) -> usize {
    name.split('.')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(usize::MAX)
}

/// Write one fixture through a temporary name so a crash never leaves a
/// correctly named file of the wrong length.
fn write_fixture(path: &Path, size: u64, chunk: &[u8]) -> Result<(), FixtureError> {
    let mut partial = path.as_os_str().to_owned();
    partial.push(PARTIAL_SUFFIX);
    let partial = PathBuf::from(partial);

    let result = (|| -> io::Result<()> {
        let mut file = File::create(&partial)?;
        let mut written = 0u64;
        while written < size {
            let len = (chunk.len() as u64).min(size - written) as usize;
            file.write_all(&chunk[..len])?;
            written += len as u64;
        }
        file.sync_all()?;
        fs::rename(&partial, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result.at(path)
}
