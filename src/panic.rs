//! Ordered, irreversible destruction of vault material.
//!
//! Key material goes first. Once the key file and the password records
//! are gone nothing left on disk can be decrypted, so the later phases
//! only reduce what an investigator can see. Each phase keeps going past
//! per-item failures.
//!
//! Nothing on this path logs above `info`: with the default filter a
//! destruction leaves stderr exactly as a failed login would.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, info};

use crate::config::{PanicExit, VaultLayout};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicPhase {
    CryptographicErasure,
    MetadataDestruction,
    PhysicalOverwrite,
    StructuralCleanup,
}

impl PanicPhase {
    pub const ORDER: [PanicPhase; 4] = [
        PanicPhase::CryptographicErasure,
        PanicPhase::MetadataDestruction,
        PanicPhase::PhysicalOverwrite,
        PanicPhase::StructuralCleanup,
    ];
}

impl fmt::Display for PanicPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PanicPhase::CryptographicErasure => "cryptographic-erasure",
            PanicPhase::MetadataDestruction => "metadata-destruction",
            PanicPhase::PhysicalOverwrite => "physical-overwrite",
            PanicPhase::StructuralCleanup => "structural-cleanup",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicReport {
    phases: Vec<(PanicPhase, PhaseOutcome)>,
}

impl PanicReport {
    /// Phases in the order they ran.
    pub fn phases(&self) -> &[(PanicPhase, PhaseOutcome)] {
        &self.phases
    }

    pub fn outcome(&self, phase: PanicPhase) -> Option<PhaseOutcome> {
        self.phases
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, outcome)| *outcome)
    }

    pub fn failed_items(&self) -> usize {
        self.phases.iter().map(|(_, o)| o.failed).sum()
    }

    pub fn removed_items(&self) -> usize {
        self.phases.iter().map(|(_, o)| o.removed).sum()
    }
}

pub struct PanicDestroyer {
    layout: VaultLayout,
    overwrite_passes: u32,
    exit: PanicExit,
}

impl PanicDestroyer {
    pub fn new(layout: VaultLayout, overwrite_passes: u32, exit: PanicExit) -> Self {
        Self {
            layout,
            overwrite_passes,
            exit,
        }
    }

    /// Runs all four phases. `wipe_session` is called in phase 1, right
    /// after the key file, the records and any staged copies of them are
    /// destroyed.
    ///
    /// With [`PanicExit::Terminate`] this does not return.
    pub fn run(&self, wipe_session: impl FnOnce()) -> PanicReport {
        let mut phases = Vec::with_capacity(PanicPhase::ORDER.len());
        let mut wipe_session = Some(wipe_session);

        for phase in PanicPhase::ORDER {
            info!(%phase, "panic phase started");
            let outcome = match phase {
                PanicPhase::CryptographicErasure => {
                    let outcome = self.erase_keys();
                    if let Some(wipe) = wipe_session.take() {
                        wipe();
                    }
                    outcome
                }
                PanicPhase::MetadataDestruction => self.destroy_metadata(),
                PanicPhase::PhysicalOverwrite => self.overwrite_blobs(),
                PanicPhase::StructuralCleanup => self.remove_directories(),
            };
            if outcome.failed > 0 {
                info!(%phase, removed = outcome.removed, failed = outcome.failed, "panic phase incomplete");
            } else {
                info!(%phase, removed = outcome.removed, "panic phase finished");
            }
            phases.push((phase, outcome));
        }

        let report = PanicReport { phases };
        if report.failed_items() > 0 {
            info!(failed = report.failed_items(), "destruction left items behind");
        } else {
            info!(removed = report.removed_items(), "destruction complete");
        }

        if self.exit == PanicExit::Terminate {
            std::process::exit(0);
        }
        report
    }

    fn erase_keys(&self) -> PhaseOutcome {
        let mut outcome = PhaseOutcome::default();
        let targets = [self.layout.keys(), self.layout.records()];
        for storage in &targets {
            shred_item(storage, 1, &mut outcome);
        }
        // an interrupted rewrap leaves a complete key file behind
        for path in files_in(self.layout.root()) {
            if targets.iter().any(|t| is_staged_copy_of(&path, t.path())) {
                shred_item(&Storage::new(path), 1, &mut outcome);
            }
        }
        outcome
    }

    fn destroy_metadata(&self) -> PhaseOutcome {
        let mut outcome = PhaseOutcome::default();
        for storage in [self.layout.metadata(), self.layout.audit_log()] {
            shred_item(&storage, 1, &mut outcome);
        }
        // staged writes that never committed
        for path in files_in(self.layout.root()) {
            if is_temp_file(&path) {
                shred_item(&Storage::new(path), 1, &mut outcome);
            }
        }
        outcome
    }

    fn overwrite_blobs(&self) -> PhaseOutcome {
        let mut outcome = PhaseOutcome::default();
        for path in files_in(&self.layout.blob_dir()) {
            shred_item(&Storage::new(path), self.overwrite_passes, &mut outcome);
        }
        outcome
    }

    fn remove_directories(&self) -> PhaseOutcome {
        let mut outcome = PhaseOutcome::default();
        for dir in [self.layout.blob_dir(), self.layout.root().to_path_buf()] {
            let result = retry_once(|| match fs::remove_dir(&dir) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(anyhow::Error::new(e)),
            });
            match result {
                Ok(true) => outcome.removed += 1,
                Ok(false) => {}
                Err(e) => {
                    debug!(path = %dir.display(), error = %e, "could not remove directory");
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }
}

fn shred_item(storage: &Storage, passes: u32, outcome: &mut PhaseOutcome) {
    if !storage.exists() {
        return;
    }
    match retry_once(|| storage.shred(passes)) {
        Ok(()) => outcome.removed += 1,
        Err(e) => {
            debug!(path = %storage.path().display(), error = %format!("{e:#}"), "could not destroy file");
            outcome.failed += 1;
        }
    }
}

fn retry_once<T>(mut op: impl FnMut() -> anyhow::Result<T>) -> anyhow::Result<T> {
    op().or_else(|_| op())
}

fn files_in(dir: &Path) -> Vec<std::path::PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn is_staged_copy_of(path: &Path, target: &Path) -> bool {
    let (Some(name), Some(target)) = (
        path.file_name().and_then(|n| n.to_str()),
        target.file_name().and_then(|n| n.to_str()),
    ) else {
        return false;
    };
    name.strip_prefix(target)
        .is_some_and(|rest| rest.starts_with(".tmp."))
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains(".tmp."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn populate(root: &Path) -> VaultLayout {
        let layout = VaultLayout::new(root);
        layout.keys().save(b"{\"keys\":1}").unwrap();
        layout.records().save(b"{\"records\":1}").unwrap();
        layout.metadata().save(b"metadata").unwrap();
        layout.audit_log().save(b"audit").unwrap();
        for id in ["aa", "bb", "cc"] {
            layout.blob(id).save(&[7u8; 4096]).unwrap();
        }
        layout
    }

    #[test]
    fn destroys_everything_in_order() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("vault");
        let layout = populate(&root);

        let destroyer = PanicDestroyer::new(layout, 2, PanicExit::Return);
        let report = destroyer.run(|| {});

        let order: Vec<_> = report.phases().iter().map(|(p, _)| *p).collect();
        assert_eq!(order, PanicPhase::ORDER.to_vec());
        assert_eq!(
            report.outcome(PanicPhase::CryptographicErasure),
            Some(PhaseOutcome { removed: 2, failed: 0 })
        );
        assert_eq!(report.outcome(PanicPhase::MetadataDestruction).unwrap().removed, 2);
        assert_eq!(report.outcome(PanicPhase::PhysicalOverwrite).unwrap().removed, 3);
        assert_eq!(report.outcome(PanicPhase::StructuralCleanup).unwrap().removed, 2);
        assert_eq!(report.failed_items(), 0);
        assert!(!root.exists());
    }

    #[test]
    fn session_is_wiped_after_keys_are_gone() {
        let dir = tempdir().unwrap();
        let layout = populate(dir.path());
        let keys_path = layout.keys().path().clone();
        let blob_path = layout.blob("aa").path().clone();

        let destroyer = PanicDestroyer::new(layout, 1, PanicExit::Return);
        let mut observed = None;
        destroyer.run(|| observed = Some((keys_path.exists(), blob_path.exists())));

        // keys already gone, blobs still present when the session is wiped
        assert_eq!(observed, Some((false, true)));
    }

    #[test]
    fn missing_files_are_not_failures() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("empty");
        fs::create_dir_all(&root).unwrap();

        let destroyer = PanicDestroyer::new(VaultLayout::new(&root), 3, PanicExit::Return);
        let report = destroyer.run(|| {});

        assert_eq!(report.failed_items(), 0);
        assert!(!root.exists());
    }

    #[test]
    fn foreign_files_keep_root_and_count_as_failure() {
        let dir = tempdir().unwrap();
        let layout = populate(dir.path());
        fs::write(dir.path().join("unrelated.txt"), b"keep").unwrap();

        let report = PanicDestroyer::new(layout, 1, PanicExit::Return).run(|| {});

        assert_eq!(report.outcome(PanicPhase::StructuralCleanup).unwrap().failed, 1);
        assert!(!dir.path().join("keys.json").exists());
        assert!(!dir.path().join("blobs").exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn staged_key_file_goes_in_the_first_phase() {
        let dir = tempdir().unwrap();
        let layout = populate(dir.path());
        let staged = layout.keys().stage(b"{\"keys\":2}").unwrap();
        let staged_path = staged.path().to_path_buf();
        std::mem::forget(staged);

        let mut seen_at_wipe = None;
        let report = PanicDestroyer::new(layout, 1, PanicExit::Return)
            .run(|| seen_at_wipe = Some(staged_path.exists()));

        assert_eq!(seen_at_wipe, Some(false));
        assert_eq!(
            report.outcome(PanicPhase::CryptographicErasure),
            Some(PhaseOutcome { removed: 3, failed: 0 })
        );
    }

    #[test]
    fn staged_copy_matching_is_per_file() {
        let keys = Path::new("/v/keys.json");
        assert!(is_staged_copy_of(Path::new("/v/keys.json.tmp.0a1b"), keys));
        assert!(!is_staged_copy_of(Path::new("/v/metadata.dvb.tmp.0a1b"), keys));
        assert!(!is_staged_copy_of(Path::new("/v/keys.json"), keys));
    }

    #[test]
    fn leftover_staged_files_are_destroyed() {
        let dir = tempdir().unwrap();
        let layout = populate(dir.path());
        let staged = layout.keys().stage(b"pending").unwrap();
        let staged_path = staged.path().to_path_buf();
        std::mem::forget(staged);
        assert!(staged_path.exists());

        PanicDestroyer::new(layout, 1, PanicExit::Return).run(|| {});
        assert!(!staged_path.exists());
    }
}
