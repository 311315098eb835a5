//! Partition a batch of candidates into duplicates, corrections and new events.
//!
//! The fingerprint is the only lookup key. A candidate whose `(fingerprint, payload_hash)` pair
//! is already known, stored live or superseded, is dropped; that keeps a re-fed old window
//! from undoing a correction that arrived later.
//!
//! Ties inside a batch are settled before the store is consulted: the last submission of a
//! fingerprint is its winner, and only the winner can become new or a correction. Earlier
//! submissions with other payloads are kept as superseded history.

use std::collections::HashMap;

use crate::error::{IngestError, Result};
use crate::normalize::{ActionKind, EventCandidate, Normalizer};

/// One stored row sharing a candidate's fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVersion {
    pub event_id: i64,
    pub payload_hash: String,
    pub live: bool,
    pub server: String,
    pub event_ms: i64,
    pub action: ActionKind,
    pub actor_id: Option<String>,
    pub target_id: Option<String>,
    pub game_key: String,
}

/// Fingerprint lookups against whatever holds already-ingested events.
pub trait FingerprintIndex {
    fn versions(&mut self, fingerprint: &str) -> Result<Vec<StoredVersion>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Unknown fingerprint; needs a game from the session assigner.
    New,
    /// Replaces a stored live event and joins its game.
    Correction { replaces: i64, game_key: String },
    /// Stored as already superseded by a later candidate of the same batch (index into the output).
    Superseded { by: usize },
    /// Stored as already superseded by a stored row, because the later candidate of the same
    /// batch turned out to be that row.
    SupersededByStored { by: i64, game_key: String },
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub candidate: EventCandidate,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub duplicates: usize,
    pub corrections: usize,
    pub new: usize,
    pub superseded_in_batch: usize,
}

enum Slot {
    /// Exact duplicate, in the batch or in the store.
    Dropped,
    /// Last submission of its fingerprint, with its verdict.
    Winner(Verdict),
    /// Last submission of its fingerprint, already stored as this row.
    Stored(StoredVersion),
    /// Earlier submission of a fingerprint whose winner comes later.
    Loser,
}

struct Lookup<'a, I: ?Sized> {
    index: &'a mut I,
    cache: HashMap<String, Vec<StoredVersion>>,
}

impl<I: FingerprintIndex + ?Sized> Lookup<'_, I> {
    fn versions(&mut self, fingerprint: &str) -> Result<Vec<StoredVersion>> {
        if let Some(v) = self.cache.get(fingerprint) {
            return Ok(v.clone());
        }
        let v = self.index.versions(fingerprint)?;
        self.cache.insert(fingerprint.to_string(), v.clone());
        Ok(v)
    }
}

/// Walk candidates in submission order. Exact duplicates are dropped and counted; everything
/// else comes back with a verdict, in submission order. Later submissions win fingerprint ties.
pub fn reconcile<I>(
    index: &mut I,
    normalizer: &Normalizer,
    mut candidates: Vec<EventCandidate>,
) -> Result<(Vec<Reconciled>, ReconcileStats)>
where
    I: FingerprintIndex + ?Sized,
{
    let mut stats = ReconcileStats::default();
    let mut lookup = Lookup { index, cache: HashMap::new() };

    let mut last_pair: HashMap<(String, String), usize> = HashMap::new();
    let mut last_fp: HashMap<String, usize> = HashMap::new();
    for (i, c) in candidates.iter().enumerate() {
        last_pair.insert((c.fingerprint.clone(), c.payload_hash.clone()), i);
        last_fp.insert(c.fingerprint.clone(), i);
    }
    let winner_of: Vec<usize> = candidates.iter().map(|c| last_fp[&c.fingerprint]).collect();

    let mut slots: Vec<Slot> = Vec::with_capacity(candidates.len());
    let mut rewrites: Vec<(usize, String)> = Vec::new();
    for (i, cand) in candidates.iter().enumerate() {
        if last_pair[&(cand.fingerprint.clone(), cand.payload_hash.clone())] != i {
            stats.duplicates += 1;
            slots.push(Slot::Dropped);
            continue;
        }

        let versions = lookup.versions(&cand.fingerprint)?;
        for v in &versions {
            check_stored_identity(cand, v)?;
        }
        let w = winner_of[i];
        if w != i {
            check_batch_identity(cand, &candidates[w])?;
        }

        let known = match versions.iter().find(|v| v.payload_hash == cand.payload_hash) {
            Some(row) => Some(row.clone()),
            None => match neighbour(&mut lookup, normalizer, cand)? {
                Some((_, row)) if row.payload_hash == cand.payload_hash => Some(row),
                _ => None,
            },
        };
        if let Some(row) = known {
            stats.duplicates += 1;
            if w == i {
                // Losers point at the live version when the re-fed winner is old history.
                let target = versions.iter().find(|v| v.live).cloned().unwrap_or(row);
                slots.push(Slot::Stored(target));
            } else {
                slots.push(Slot::Dropped);
            }
            continue;
        }

        if w != i {
            slots.push(Slot::Loser);
            continue;
        }

        let verdict = match versions.iter().find(|v| v.live) {
            Some(live) => Verdict::Correction {
                replaces: live.event_id,
                game_key: live.game_key.clone(),
            },
            None if versions.is_empty() => match neighbour(&mut lookup, normalizer, cand)? {
                Some((fp, live)) if live.live => {
                    rewrites.push((i, fp));
                    Verdict::Correction {
                        replaces: live.event_id,
                        game_key: live.game_key,
                    }
                }
                _ => Verdict::New,
            },
            None => Verdict::New,
        };
        if matches!(verdict, Verdict::Correction { .. }) {
            stats.corrections += 1;
        }
        slots.push(Slot::Winner(verdict));
    }

    for (i, fp) in rewrites {
        candidates[i].fingerprint = fp;
    }

    let mut positions: Vec<Option<usize>> = vec![None; slots.len()];
    let mut next = 0;
    for (i, slot) in slots.iter().enumerate() {
        if matches!(slot, Slot::Winner(_) | Slot::Loser) {
            positions[i] = Some(next);
            next += 1;
        }
    }

    let mut out: Vec<Reconciled> = Vec::with_capacity(next);
    for (i, cand) in candidates.into_iter().enumerate() {
        let verdict = match &slots[i] {
            Slot::Winner(v) => v.clone(),
            Slot::Loser => {
                let w = winner_of[i];
                match (positions[w], &slots[w]) {
                    (Some(by), _) => Verdict::Superseded { by },
                    (None, Slot::Stored(row)) => Verdict::SupersededByStored {
                        by: row.event_id,
                        game_key: row.game_key.clone(),
                    },
                    (None, _) => {
                        stats.duplicates += 1;
                        continue;
                    }
                }
            }
            Slot::Dropped | Slot::Stored(_) => continue,
        };
        if matches!(verdict, Verdict::Superseded { .. } | Verdict::SupersededByStored { .. }) {
            stats.superseded_in_batch += 1;
        }
        out.push(Reconciled { candidate: cand, verdict });
    }

    stats.new = out.iter().filter(|r| r.verdict == Verdict::New).count();
    Ok((out, stats))
}

/// A stored version of `cand` filed under an adjacent bucket and less than one bucket width
/// away in time, with the fingerprint it was found under. Exact payload matches win over
/// live rows.
fn neighbour<I: FingerprintIndex + ?Sized>(
    lookup: &mut Lookup<'_, I>,
    normalizer: &Normalizer,
    cand: &EventCandidate,
) -> Result<Option<(String, StoredVersion)>> {
    let mut live = None;
    for fp in normalizer.neighbour_fingerprints(cand) {
        for v in lookup.versions(&fp)? {
            if (v.event_ms - cand.at_ms()).abs() >= normalizer.bucket_ms() {
                continue;
            }
            if v.payload_hash == cand.payload_hash {
                return Ok(Some((fp, v)));
            }
            if v.live && live.is_none() {
                live = Some((fp.clone(), v));
            }
        }
    }
    Ok(live)
}

fn check_stored_identity(cand: &EventCandidate, v: &StoredVersion) -> Result<()> {
    let mismatch = if v.server != cand.server {
        Some("server")
    } else if v.action != cand.action() {
        Some("action")
    } else if v.actor_id.as_deref() != cand.actor_id() {
        Some("actor")
    } else if v.target_id.as_deref() != cand.target_id() {
        Some("target")
    } else {
        None
    };
    match mismatch {
        Some(field) => Err(IngestError::IntegrityViolation {
            fingerprint: cand.fingerprint.clone(),
            reason: format!("stored event {} differs in {}", v.event_id, field),
        }),
        None => Ok(()),
    }
}

fn check_batch_identity(cand: &EventCandidate, prev: &EventCandidate) -> Result<()> {
    if cand.server != prev.server
        || cand.action() != prev.action()
        || cand.actor_id() != prev.actor_id()
        || cand.target_id() != prev.target_id()
    {
        return Err(IngestError::IntegrityViolation {
            fingerprint: cand.fingerprint.clone(),
            reason: "candidates in one batch share a fingerprint but not an identity".to_string(),
        });
    }
    Ok(())
}
