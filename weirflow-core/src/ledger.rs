//! Ordered record of acquired resources driving the cleanup pass.

use anyhow::Result;
use tracing::debug;

type ReleaseFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// The stages of resource release, in the order the cleanup pass runs them:
/// produced partitions first, then input gates, memory held on behalf of the
/// operator, the job registrations (library cache, file cache, BLOB service)
/// and finally the task thread's file system safety net.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStage {
    Partitions,
    Gates,
    Memory,
    Library,
    FileCache,
    Blob,
    SafetyNet,
}

impl ReleaseStage {
    /// The release order of the cleanup pass.
    pub const ORDER: [ReleaseStage; 7] = [
        ReleaseStage::Partitions,
        ReleaseStage::Gates,
        ReleaseStage::Memory,
        ReleaseStage::Library,
        ReleaseStage::FileCache,
        ReleaseStage::Blob,
        ReleaseStage::SafetyNet,
    ];
}

struct Entry {
    stage: ReleaseStage,
    label: &'static str,
    release: ReleaseFn,
}

/// The resource ledger of one task execution.
///
/// Bootstrap records every successful acquisition on the dedicated task
/// thread; the cleanup pass releases the entries exactly once, stage by stage
/// in [`ReleaseStage::ORDER`], newest first within a stage. Release never
/// raises: errors are handed to the caller's hook and release continues with
/// the next entry.
#[derive(Default)]
pub struct ResourceLedger {
    entries: Vec<Entry>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful acquisition. `release` runs at most once.
    pub fn record(
        &mut self,
        stage: ReleaseStage,
        label: &'static str,
        release: impl FnOnce() -> Result<()> + Send + 'static,
    ) {
        debug!(resource = label, stage = ?stage, "recorded resource acquisition");
        self.entries.push(Entry {
            stage,
            label,
            release: Box::new(release),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release every recorded entry in stage order, newest first within each
    /// stage. Entries are drained, so a second call is a no-op.
    pub fn release_all(&mut self, mut on_error: impl FnMut(&'static str, anyhow::Error)) {
        for stage in ReleaseStage::ORDER {
            while let Some(index) = self.entries.iter().rposition(|entry| entry.stage == stage) {
                let entry = self.entries.remove(index);
                debug!(resource = entry.label, "releasing resource");
                if let Err(err) = (entry.release)() {
                    on_error(entry.label, err);
                }
            }
        }
    }
}
