//! One batch end to end: normalize, reconcile, assign, persist, derive.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::Serialize;
use serde_json::json;

use crate::config::{Config, MalformedPolicy};
use crate::derive::{DerivationEngine, DeriveReport};
use crate::error::{IngestError, Result};
use crate::logging::{log, log_correction, log_malformed, obj, Domain, Level, ProfileScope};
use crate::normalize::{EventCandidate, Normalizer, RawRecord};
use crate::reconcile::{reconcile, Verdict};
use crate::session::{Placement, SessionAssigner};
use crate::source::{file_sha256, DirectorySource, FetchWindow, LogSource};
use crate::store::Store;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub received: usize,
    pub malformed: usize,
    pub pending_loaded: usize,
    pub duplicates: usize,
    pub corrections: usize,
    pub inserted: usize,
    pub superseded_in_batch: usize,
    /// Candidates still without a game, held in `pending_events`.
    pub deferred: usize,
    pub released: usize,
    pub games_opened: Vec<String>,
    pub games_closed: Vec<String>,
    pub analyses_written: usize,
    pub derive: DeriveReport,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DirReport {
    pub files: usize,
    pub skipped: Vec<PathBuf>,
    pub batches: Vec<(PathBuf, BatchReport)>,
}

pub struct Pipeline {
    cfg: Config,
    normalizer: Normalizer,
    engine: DerivationEngine,
    store: Store,
}

impl Pipeline {
    pub fn new(cfg: Config, store: Store) -> Result<Self> {
        Ok(Self {
            normalizer: Normalizer::from_config(&cfg),
            engine: DerivationEngine::from_config(&cfg)?,
            cfg,
            store,
        })
    }

    pub fn open(cfg: Config) -> Result<Self> {
        let store = Store::open(&cfg.sqlite_path)?;
        Self::new(cfg, store)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn engine(&self) -> &DerivationEngine {
        &self.engine
    }

    /// Ingest one batch in a single transaction, then derive the closed games it touched.
    pub fn ingest_batch(&mut self, records: &[RawRecord]) -> Result<BatchReport> {
        let _p = ProfileScope::with_context("ingest_batch", &[("records", json!(records.len()))]);
        let mut report = BatchReport {
            received: records.len(),
            ..Default::default()
        };

        let (fresh, failures) = self.normalizer.normalize_batch(records);
        let abort = self.cfg.malformed_policy == MalformedPolicy::Abort;
        for err in &failures {
            if let IngestError::Malformed { index, reason } = err {
                log_malformed(*index, reason, abort);
            }
        }
        report.malformed = failures.len();
        if abort {
            if let Some(err) = failures.into_iter().next() {
                return Err(err);
            }
        }

        let mut tx = self.store.begin_batch()?;

        let held = tx.pending()?;
        report.pending_loaded = held.len();
        let held_keys: Vec<(String, String)> = held
            .iter()
            .map(|p| (p.candidate.fingerprint.clone(), p.candidate.payload_hash.clone()))
            .collect();
        let mut candidates: Vec<EventCandidate> = held.into_iter().map(|p| p.candidate).collect();
        candidates.extend(fresh);
        let newest_ms = candidates.iter().map(EventCandidate::at_ms).max();

        let (reconciled, stats) = reconcile(&mut tx, &self.normalizer, candidates)?;
        report.duplicates = stats.duplicates;
        report.corrections = stats.corrections;
        report.superseded_in_batch = stats.superseded_in_batch;

        let mut assigner = SessionAssigner::new(self.cfg.stale_session_ms(), &self.cfg.seeding_marker);
        let mut placed: Vec<Option<(i64, String)>> = vec![None; reconciled.len()];
        let mut dirty: BTreeSet<String> = BTreeSet::new();

        for (i, r) in reconciled.iter().enumerate() {
            match &r.verdict {
                Verdict::Correction { replaces, game_key } => {
                    let id = tx.replace_event(*replaces, &r.candidate, game_key)?;
                    log_correction(&r.candidate.fingerprint, Some(*replaces), Some(game_key));
                    placed[i] = Some((id, game_key.clone()));
                }
                Verdict::SupersededByStored { by, game_key } => {
                    let id = tx.insert_superseded(&r.candidate, game_key, *by)?;
                    placed[i] = Some((id, game_key.clone()));
                }
                Verdict::New | Verdict::Superseded { .. } => {}
            }
        }

        let mut fresh_idx: Vec<usize> = reconciled
            .iter()
            .enumerate()
            .filter(|(_, r)| r.verdict == Verdict::New)
            .map(|(i, _)| i)
            .collect();
        fresh_idx.sort_by_key(|&i| (reconciled[i].candidate.at_ms(), i));

        let mut orphans = Vec::new();
        for i in fresh_idx {
            let cand = &reconciled[i].candidate;
            match assigner.assign(&mut tx, cand)? {
                Placement::Game(key) => {
                    let id = tx.insert_event(cand, &key)?;
                    placed[i] = Some((id, key));
                }
                Placement::Pending => orphans.push(i),
            }
        }

        let mut unplaced = Vec::new();
        for i in orphans {
            let cand = &reconciled[i].candidate;
            match assigner.retry_orphan(&mut tx, cand)? {
                Placement::Game(key) => {
                    let id = tx.insert_event(cand, &key)?;
                    placed[i] = Some((id, key));
                }
                Placement::Pending => unplaced.push(i),
            }
        }

        if let Some(now) = newest_ms {
            assigner.sweep(&mut tx, now)?;
        }

        // Losers point at a later index, so walking backwards sees every winner placed first.
        let mut held_now: Vec<usize> = Vec::new();
        for i in (0..reconciled.len()).rev() {
            let Verdict::Superseded { by } = reconciled[i].verdict else {
                continue;
            };
            match placed[by].clone() {
                Some((winner_id, key)) => {
                    let id = tx.insert_superseded(&reconciled[i].candidate, &key, winner_id)?;
                    placed[i] = Some((id, key));
                }
                None => held_now.push(i),
            }
        }
        held_now.reverse();
        held_now.extend(unplaced);

        let mut still_held: HashSet<(String, String)> = HashSet::new();
        for &i in &held_now {
            let cand = &reconciled[i].candidate;
            tx.hold_pending(cand)?;
            still_held.insert((cand.fingerprint.clone(), cand.payload_hash.clone()));
        }
        report.deferred = held_now.len();

        for key in &held_keys {
            if !still_held.contains(key) && tx.release_pending(&key.0, &key.1)? {
                report.released += 1;
            }
        }

        for (_, key) in placed.iter().flatten() {
            dirty.insert(key.clone());
        }
        report.inserted = placed.iter().flatten().count();
        dirty.extend(assigner.closed.iter().cloned());
        report.games_opened = assigner.opened.clone();
        report.games_closed = assigner.closed.clone();

        tx.commit()?;

        log(
            Level::Info,
            Domain::Ingest,
            "batch_committed",
            obj(&[
                ("received", json!(report.received)),
                ("malformed", json!(report.malformed)),
                ("duplicates", json!(report.duplicates)),
                ("corrections", json!(report.corrections)),
                ("inserted", json!(report.inserted)),
                ("deferred", json!(report.deferred)),
                ("released", json!(report.released)),
                ("games_opened", json!(report.games_opened.len())),
                ("games_closed", json!(report.games_closed.len())),
            ]),
        );

        let dirty: Vec<String> = dirty.into_iter().collect();
        let mut derived = self.engine.derive_games(&mut self.store, &dirty, self.cfg.force_recompute)?;
        derived.merge(self.engine.derive_outstanding(&mut self.store)?);
        report.analyses_written = derived.rows_written;
        report.derive = derived;
        Ok(report)
    }

    /// Ingest every `*.json` file of `dir` as its own batch, skipping files already ingested
    /// byte for byte.
    pub fn ingest_dir(&mut self, dir: &Path) -> anyhow::Result<DirReport> {
        let source = DirectorySource::new(dir);
        let mut report = DirReport::default();
        for path in source.files()? {
            report.files += 1;
            let digest = file_sha256(&path)?;
            if !self.cfg.force_recompute && self.store.is_file_processed(&digest)? {
                report.skipped.push(path);
                continue;
            }
            let records = DirectorySource::read_file(&path)?;
            let batch = self.ingest_batch(&records)?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.store.mark_file_processed(&digest, &name)?;
            report.batches.push((path, batch));
        }
        log(
            Level::Info,
            Domain::Ingest,
            "dir_ingested",
            obj(&[
                ("dir", json!(dir.display().to_string())),
                ("files", json!(report.files)),
                ("skipped", json!(report.skipped.len())),
            ]),
        );
        Ok(report)
    }

    /// Fetch `window` in spans of `FETCH_WINDOW_HOURS` and ingest each span as one batch.
    /// With `save_to`, each span is also written to that folder and recorded as processed.
    pub async fn fetch_and_ingest(
        &mut self,
        source: &(dyn LogSource + Send + Sync),
        window: FetchWindow,
        save_to: Option<&DirectorySource>,
    ) -> anyhow::Result<Vec<BatchReport>> {
        let mut reports = Vec::new();
        for span in window.split(Duration::hours(self.cfg.fetch_window_hours)) {
            let records = source.fetch(&span).await?;
            let saved = match save_to {
                Some(dir) => Some(dir.save(&span, records.clone())?),
                None => None,
            };
            reports.push(self.ingest_batch(&records)?);
            if let Some(path) = saved {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.store.mark_file_processed(&file_sha256(&path)?, &name)?;
            }
        }
        Ok(reports)
    }

    /// Derivation outside ingestion: every closed game, or only the ones still missing rows.
    pub fn derive(&mut self, all: bool, force: bool) -> Result<DeriveReport> {
        if all || force {
            self.engine.derive_all(&mut self.store, force)
        } else {
            self.engine.derive_outstanding(&mut self.store)
        }
    }
}
