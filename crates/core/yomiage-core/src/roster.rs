//! Per-user speaker assignment
//!
//! Every author is read with their own voice. A user seen for the first time
//! gets a random speaker from the catalog; assignments survive restarts when a
//! mapping file is configured.

use crate::error::Result;
use crate::types::UserId;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One selectable speaker (engine style id)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerEntry {
    /// Display name of the voice model
    pub name: String,
    /// Engine speaker id
    pub id: u32,
}

impl SpeakerEntry {
    pub fn new(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    /// Voice models installed on the reference AivisSpeech host
    pub fn builtin_catalog() -> Vec<Self> {
        [
            ("Anneli", 888_753_760),
            ("decoprokun", 604_172_608),
            ("fumifumi", 606_865_152),
            ("hinakoyuhara", 2_058_221_184),
            ("peach", 933_744_512),
            ("white", 706_073_888),
            ("yukyu", 1_099_751_712),
            ("にせ", 1_937_616_896),
            ("まい", 1_431_611_904),
            ("ろてじん（長老ボイス）", 391_794_336),
            ("亜空マオ", 532_977_856),
            ("凛音エル", 1_388_823_424),
            ("天深シノ", 1_063_997_408),
            ("宗周定昌", 1_143_949_696),
            ("様子ヶ丘シイナ", 1_130_341_985),
            ("立神ケイ", 87_094_656),
            ("観測症", 1_275_216_064),
            ("Furina", 134_921_440),
            ("Lunlun", 788_751_232),
            ("Mita", 1_292_986_496),
            ("花火", 591_215_776),
            ("Nahida", 1_206_699_648),
            ("KikotoMahiro", 1_430_982_625),
            ("Paimon", 1_031_189_312),
            ("ユニ", 1_105_189_120),
        ]
        .into_iter()
        .map(|(name, id)| Self::new(name, id))
        .collect()
    }
}

/// Persisted assignment of one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub voice_id: u32,
    pub display_name: String,
}

/// Older mapping files stored the bare speaker id
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredAssignment {
    Full(Assignment),
    Bare(u32),
}

/// Assignment table to write, tagged with the revision it was taken at
type Snapshot = (Arc<MappingFile>, u64, BTreeMap<u64, Assignment>);

/// YAML file the assignments are saved to. Writes carry a revision and an
/// older snapshot never replaces a newer one.
#[derive(Debug)]
struct MappingFile {
    path: PathBuf,
    written: Mutex<u64>,
}

impl MappingFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            written: Mutex::new(0),
        }
    }

    fn write(&self, revision: u64, assignments: &BTreeMap<u64, Assignment>) {
        let mut written = self.written.lock();
        if *written >= revision {
            return;
        }
        let result = serde_yaml::to_string(assignments)
            .map_err(crate::error::ReadoutError::from)
            .and_then(|yaml| std::fs::write(&self.path, yaml).map_err(Into::into));
        match result {
            Ok(()) => *written = revision,
            // losing a write only costs a re-roll after restart
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to save speaker assignments")
            }
        }
    }
}

/// User → speaker table
#[derive(Debug)]
pub struct SpeakerRoster {
    catalog: Vec<SpeakerEntry>,
    fallback: u32,
    mapping_file: Option<Arc<MappingFile>>,
    revision: AtomicU64,
    assignments: Mutex<BTreeMap<u64, Assignment>>,
}

impl SpeakerRoster {
    /// In-memory roster
    pub fn new(catalog: Vec<SpeakerEntry>, fallback: u32) -> Self {
        Self {
            catalog,
            fallback,
            mapping_file: None,
            revision: AtomicU64::new(0),
            assignments: Mutex::new(BTreeMap::new()),
        }
    }

    /// Roster backed by a YAML mapping file. A missing file starts empty; an
    /// unreadable one is an error so assignments are never silently lost.
    pub fn with_mapping_file(
        catalog: Vec<SpeakerEntry>,
        fallback: u32,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let path = path.into();
        let assignments = load_mapping(&path)?;
        info!(
            path = %path.display(),
            users = assignments.len(),
            "Loaded speaker assignments"
        );
        Ok(Self {
            catalog,
            fallback,
            mapping_file: Some(Arc::new(MappingFile::new(path))),
            revision: AtomicU64::new(0),
            assignments: Mutex::new(assignments),
        })
    }

    /// Speaker for `user`, assigning one on first sight. A changed display
    /// name is recorded against the existing assignment.
    ///
    /// The mapping file is written after the table lock is released, on the
    /// blocking pool when called inside a runtime.
    pub fn speaker_for(&self, user: UserId, display_name: &str) -> u32 {
        let mut assignments = self.assignments.lock();
        let voice_id = if let Some(existing) = assignments.get_mut(&user.get()) {
            if existing.display_name == display_name {
                return existing.voice_id;
            }
            existing.display_name = display_name.to_string();
            existing.voice_id
        } else {
            let voice_id = self
                .catalog
                .choose(&mut rand::thread_rng())
                .map(|entry| entry.id)
                .unwrap_or(self.fallback);
            debug!(user_id = %user, voice_id, "Assigned speaker");
            assignments.insert(
                user.get(),
                Assignment {
                    voice_id,
                    display_name: display_name.to_string(),
                },
            );
            voice_id
        };
        let pending = self.snapshot(&assignments);
        drop(assignments);

        if let Some((file, revision, snapshot)) = pending {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || file.write(revision, &snapshot));
                }
                Err(_) => file.write(revision, &snapshot),
            }
        }
        voice_id
    }

    /// Write the current table and wait for it to land. Called on shutdown so
    /// a queued background write cannot be lost.
    pub async fn flush(&self) {
        let Some((file, revision, snapshot)) = self.snapshot(&self.assignments.lock()) else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || file.write(revision, &snapshot)).await {
            warn!(error = %e, "Speaker assignment flush did not finish");
        }
    }

    /// Current assignment without assigning
    pub fn assignment(&self, user: UserId) -> Option<Assignment> {
        self.assignments.lock().get(&user.get()).cloned()
    }

    /// Speaker used for announcements
    pub fn fallback(&self) -> u32 {
        self.fallback
    }

    /// Configured catalog
    pub fn catalog(&self) -> &[SpeakerEntry] {
        &self.catalog
    }

    /// Copy of the table under a fresh revision; must be called with the
    /// table lock held so revisions follow the order of the edits
    fn snapshot(&self, assignments: &BTreeMap<u64, Assignment>) -> Option<Snapshot> {
        let file = self.mapping_file.as_ref()?;
        let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        Some((file.clone(), revision, assignments.clone()))
    }
}

fn load_mapping(path: &Path) -> Result<BTreeMap<u64, Assignment>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let stored: BTreeMap<u64, StoredAssignment> = serde_yaml::from_str(&raw)?;
    Ok(stored
        .into_iter()
        .map(|(user, entry)| {
            let assignment = match entry {
                StoredAssignment::Full(a) => a,
                StoredAssignment::Bare(voice_id) => Assignment {
                    voice_id,
                    display_name: String::new(),
                },
            };
            (user, assignment)
        })
        .collect())
}
