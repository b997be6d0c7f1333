//! Adaptive learning over resolution outcomes. Every resolve attempt
//! lands here as training signal; per-target stats update atomically
//! and each threshold crossing triggers one retrain cycle that can
//! synthesize a fresh reference template from recent successful crops.

use crate::collaborators::Rect;
use crate::errors::AutomationError;
use crate::resolver::StrategyKind;
use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Canonical side length of synthesized reference templates.
const TEMPLATE_SIZE: u32 = 64;

/// One recorded resolution outcome. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionAttempt {
    pub attempt_id: String,
    pub target_id: String,
    pub succeeded: bool,
    /// PNG crop of the matched (or best-guess) region, stored next to
    /// the log and referenced by path.
    pub region_image: Option<PathBuf>,
    pub region_rect: Option<Rect>,
    pub strategy: StrategyKind,
    pub context: String,
    pub timestamp: DateTime<Utc>,
    pub consumed_for_training: bool,
}

/// Per-target aggregate, created lazily on first attempt, never deleted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetStats {
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub failed_attempts: u64,
    /// Always `successful / total` after every update.
    pub accuracy: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_retrain_at: Option<DateTime<Utc>>,
    pub retrain_cycles: u64,
    /// Attempt total at the last retrain, to fire exactly once per
    /// threshold crossing.
    last_retrain_total: u64,
}

/// What the failure-region clustering concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriftVerdict {
    /// Failure centroids cluster tightly: the target moved or changed
    /// appearance at one spot.
    Relocated,
    /// Failure centroids scatter: the target is unstable or the
    /// resolver is wrong about it.
    Unstable,
}

#[derive(Debug, Clone)]
pub struct RetrainReport {
    pub target_id: String,
    pub consumed: usize,
    pub fresh_successes: usize,
    pub fresh_failures: usize,
    pub drift: Option<DriftVerdict>,
    pub template_updated: bool,
}

#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub attempt_id: String,
    pub retrain: Option<RetrainReport>,
}

struct Inner {
    attempts: Vec<ResolutionAttempt>,
    stats: HashMap<String, TargetStats>,
}

/// The outcome store: an append-only attempt log (JSONL on disk) plus
/// per-target aggregates rebuilt from it, behind one lock so concurrent
/// runs serialize their writes.
pub struct LearningStore {
    data_dir: PathBuf,
    template_dir: PathBuf,
    retrain_threshold: u64,
    min_fresh_successes: usize,
    drift_radius_px: f64,
    inner: Mutex<Inner>,
}

impl LearningStore {
    pub fn new(
        data_dir: &Path,
        template_dir: &Path,
        retrain_threshold: u64,
        min_fresh_successes: usize,
        drift_radius_px: f64,
    ) -> Result<Self, AutomationError> {
        std::fs::create_dir_all(data_dir.join("regions"))?;
        std::fs::create_dir_all(template_dir)?;

        let mut attempts = Vec::new();
        let log_path = data_dir.join("attempts.jsonl");
        if log_path.exists() {
            for line in std::fs::read_to_string(&log_path)?.lines() {
                match serde_json::from_str::<ResolutionAttempt>(line) {
                    Ok(attempt) => attempts.push(attempt),
                    Err(e) => warn!("skipping unreadable attempt record: {e}"),
                }
            }
        }

        // Counters are rebuilt from the log so the two can never
        // disagree. Consumed attempts mark where the last retrain
        // happened, which keeps the once-per-crossing guard armed even
        // without the stats snapshot.
        let mut stats: HashMap<String, TargetStats> = HashMap::new();
        for attempt in &attempts {
            let entry = stats.entry(attempt.target_id.clone()).or_default();
            apply_attempt(entry, attempt.succeeded, attempt.timestamp);
            if attempt.consumed_for_training {
                entry.last_retrain_total = entry.total_attempts;
            }
        }

        // The snapshot carries the retrain bookkeeping the log cannot
        // express (cycle count, last retrain time).
        match Self::load_stats_snapshot(&data_dir.join("stats.json")) {
            Some(snapshot) => {
                for (target, snap) in snapshot {
                    if let Some(entry) = stats.get_mut(&target) {
                        entry.last_retrain_at = snap.last_retrain_at;
                        entry.retrain_cycles = snap.retrain_cycles;
                        entry.last_retrain_total =
                            entry.last_retrain_total.max(snap.last_retrain_total);
                    }
                }
            }
            None => debug!("no stats snapshot, retrain bookkeeping derived from the log"),
        }

        debug!(
            attempts = attempts.len(),
            targets = stats.len(),
            "learning store opened"
        );
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            template_dir: template_dir.to_path_buf(),
            retrain_threshold: retrain_threshold.max(1),
            min_fresh_successes,
            drift_radius_px,
            inner: Mutex::new(Inner {
                attempts,
                stats,
            }),
        })
    }

    /// Records one resolution outcome, updates the target's stats
    /// atomically, and runs a retrain cycle when the attempt total
    /// crosses a threshold multiple.
    #[instrument(skip_all, fields(target = target_id, succeeded))]
    pub fn record_attempt(
        &self,
        target_id: &str,
        succeeded: bool,
        region: Option<(&[u8], Rect)>,
        strategy: StrategyKind,
        context: &str,
    ) -> Result<AttemptOutcome, AutomationError> {
        let attempt_id = Uuid::new_v4().to_string();
        let region_image = match &region {
            Some((png, _)) => {
                let path = self.data_dir.join("regions").join(format!("{attempt_id}.png"));
                std::fs::write(&path, png)?;
                Some(path)
            }
            None => None,
        };

        let attempt = ResolutionAttempt {
            attempt_id: attempt_id.clone(),
            target_id: target_id.to_string(),
            succeeded,
            region_image,
            region_rect: region.map(|(_, rect)| rect),
            strategy,
            context: context.to_string(),
            timestamp: Utc::now(),
            consumed_for_training: false,
        };

        let mut inner = self.lock()?;
        self.append_log(&attempt)?;
        let stats = inner.stats.entry(target_id.to_string()).or_default();
        apply_attempt(stats, succeeded, attempt.timestamp);
        inner.attempts.push(attempt);

        let retrain = self.maybe_retrain_locked(&mut inner, target_id)?;
        Ok(AttemptOutcome {
            attempt_id,
            retrain,
        })
    }

    /// Runs a retrain cycle if the target's attempt total sits exactly
    /// on a threshold multiple not yet consumed.
    pub fn maybe_retrain(&self, target_id: &str) -> Result<Option<RetrainReport>, AutomationError> {
        let mut inner = self.lock()?;
        self.maybe_retrain_locked(&mut inner, target_id)
    }

    pub fn stats(&self, target_id: &str) -> Option<TargetStats> {
        self.inner.lock().ok()?.stats.get(target_id).cloned()
    }

    /// Queryable attempt history for one target.
    pub fn attempts_for(&self, target_id: &str) -> Vec<ResolutionAttempt> {
        match self.inner.lock() {
            Ok(inner) => inner
                .attempts
                .iter()
                .filter(|a| a.target_id == target_id)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn maybe_retrain_locked(
        &self,
        inner: &mut Inner,
        target_id: &str,
    ) -> Result<Option<RetrainReport>, AutomationError> {
        let Some(stats) = inner.stats.get(target_id) else {
            return Ok(None);
        };
        let total = stats.total_attempts;
        if total == 0 || total % self.retrain_threshold != 0 || stats.last_retrain_total == total {
            return Ok(None);
        }

        let report = self.retrain_cycle(inner, target_id)?;
        let stats = inner
            .stats
            .get_mut(target_id)
            .ok_or_else(|| AutomationError::Internal("stats vanished during retrain".into()))?;
        stats.last_retrain_at = Some(Utc::now());
        stats.last_retrain_total = total;
        stats.retrain_cycles += 1;
        self.persist_stats_snapshot(&inner.stats)?;
        info!(
            target = target_id,
            consumed = report.consumed,
            drift = ?report.drift,
            template_updated = report.template_updated,
            "retrain cycle finished"
        );
        Ok(Some(report))
    }

    /// The cycle itself: cluster failure centroids, synthesize a fresh
    /// template from successful crops, mark everything consumed.
    /// Synchronous on the calling thread by design.
    fn retrain_cycle(
        &self,
        inner: &mut Inner,
        target_id: &str,
    ) -> Result<RetrainReport, AutomationError> {
        let fresh: Vec<usize> = inner
            .attempts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.target_id == target_id && !a.consumed_for_training)
            .map(|(i, _)| i)
            .collect();

        let failure_centroids: Vec<(f64, f64)> = fresh
            .iter()
            .filter_map(|&i| {
                let a = &inner.attempts[i];
                if a.succeeded {
                    None
                } else {
                    a.region_rect.map(|r| {
                        let c = r.center();
                        (c.x, c.y)
                    })
                }
            })
            .collect();
        let drift = self.classify_drift(&failure_centroids);

        let success_crops: Vec<PathBuf> = fresh
            .iter()
            .filter_map(|&i| {
                let a = &inner.attempts[i];
                if a.succeeded {
                    a.region_image.clone()
                } else {
                    None
                }
            })
            .collect();

        let mut template_updated = false;
        if success_crops.len() >= self.min_fresh_successes {
            let template_path = self.template_dir.join(format!("{target_id}.png"));
            match synthesize_template(&success_crops) {
                Ok(template) => {
                    template.save(&template_path)?;
                    template_updated = true;
                    debug!(target = target_id, crops = success_crops.len(), "template replaced");
                }
                Err(e) => warn!(target = target_id, "template synthesis failed: {e}"),
            }
        }

        let fresh_successes = success_crops.len();
        let fresh_failures = fresh.len() - fresh_successes;
        for &i in &fresh {
            inner.attempts[i].consumed_for_training = true;
        }
        self.rewrite_log(&inner.attempts)?;

        Ok(RetrainReport {
            target_id: target_id.to_string(),
            consumed: fresh.len(),
            fresh_successes,
            fresh_failures,
            drift,
            template_updated,
        })
    }

    /// Low variance in both axes means the target moved or changed at
    /// one spot; high variance means it is unstable or the resolver is
    /// wrong. Needs at least two failures to say anything.
    fn classify_drift(&self, centroids: &[(f64, f64)]) -> Option<DriftVerdict> {
        if centroids.len() < 2 {
            return None;
        }
        let n = centroids.len() as f64;
        let (mx, my) = centroids
            .iter()
            .fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));
        let (mx, my) = (mx / n, my / n);
        let (vx, vy) = centroids.iter().fold((0.0, 0.0), |(sx, sy), (x, y)| {
            (sx + (x - mx).powi(2), sy + (y - my).powi(2))
        });
        let (sx, sy) = ((vx / n).sqrt(), (vy / n).sqrt());
        if sx < self.drift_radius_px && sy < self.drift_radius_px {
            Some(DriftVerdict::Relocated)
        } else {
            Some(DriftVerdict::Unstable)
        }
    }

    fn log_path(&self) -> PathBuf {
        self.data_dir.join("attempts.jsonl")
    }

    fn load_stats_snapshot(path: &Path) -> Option<HashMap<String, TargetStats>> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(file = %path.display(), "ignoring unreadable stats snapshot: {e}");
                None
            }
        }
    }

    fn persist_stats_snapshot(
        &self,
        stats: &HashMap<String, TargetStats>,
    ) -> Result<(), AutomationError> {
        let json = serde_json::to_string_pretty(stats)?;
        std::fs::write(self.data_dir.join("stats.json"), json)?;
        Ok(())
    }

    fn append_log(&self, attempt: &ResolutionAttempt) -> Result<(), AutomationError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        writeln!(file, "{}", serde_json::to_string(attempt)?)?;
        Ok(())
    }

    /// The log is append-only between retrains; a cycle rewrites it
    /// once to make the consumed flags durable.
    fn rewrite_log(&self, attempts: &[ResolutionAttempt]) -> Result<(), AutomationError> {
        let mut out = String::new();
        for attempt in attempts {
            out.push_str(&serde_json::to_string(attempt)?);
            out.push('\n');
        }
        std::fs::write(self.log_path(), out)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, AutomationError> {
        self.inner
            .lock()
            .map_err(|_| AutomationError::Internal("learning store lock poisoned".into()))
    }
}

fn apply_attempt(stats: &mut TargetStats, succeeded: bool, at: DateTime<Utc>) {
    stats.total_attempts += 1;
    if succeeded {
        stats.successful_attempts += 1;
        stats.last_success_at = Some(at);
    } else {
        stats.failed_attempts += 1;
        stats.last_failure_at = Some(at);
    }
    stats.accuracy = stats.successful_attempts as f64 / stats.total_attempts as f64;
}

/// Per-pixel mean of the crops, each resized to the canonical template
/// size first.
fn synthesize_template(crops: &[PathBuf]) -> Result<RgbaImage, AutomationError> {
    let mut acc = vec![0.0f64; (TEMPLATE_SIZE * TEMPLATE_SIZE * 4) as usize];
    let mut used = 0usize;
    for path in crops {
        let img = match image::open(path) {
            Ok(img) => img,
            Err(e) => {
                warn!(file = %path.display(), "skipping unreadable crop: {e}");
                continue;
            }
        };
        let resized = image::imageops::resize(
            &img.to_rgba8(),
            TEMPLATE_SIZE,
            TEMPLATE_SIZE,
            FilterType::Triangle,
        );
        for (i, px) in resized.as_raw().iter().enumerate() {
            acc[i] += *px as f64;
        }
        used += 1;
    }
    if used == 0 {
        return Err(AutomationError::Internal(
            "no readable crops for template synthesis".into(),
        ));
    }
    let pixels: Vec<u8> = acc
        .into_iter()
        .map(|v| (v / used as f64).round().clamp(0.0, 255.0) as u8)
        .collect();
    RgbaImage::from_raw(TEMPLATE_SIZE, TEMPLATE_SIZE, pixels)
        .ok_or_else(|| AutomationError::Internal("template buffer size mismatch".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accuracy_tracks_counters() {
        let mut stats = TargetStats::default();
        apply_attempt(&mut stats, true, Utc::now());
        apply_attempt(&mut stats, false, Utc::now());
        apply_attempt(&mut stats, true, Utc::now());
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.successful_attempts, 2);
        assert_eq!(stats.failed_attempts, 1);
        assert!((stats.accuracy - 2.0 / 3.0).abs() < 1e-9);
    }
}
