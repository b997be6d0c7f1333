//! Target resolution: locating an on-screen element through a
//! prioritized fallback chain of detection strategies and deciding
//! success under uncertainty. Every attempt, hit or miss, is reported
//! to the learning store.

use crate::collaborators::{BrowserDriver, Classifier, Point, Rect, ScreenCapture, Screenshot};
use crate::compiler::TargetCatalog;
use crate::errors::AutomationError;
use crate::learning::LearningStore;
use image::{DynamicImage, GrayImage, ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    DomSelector,
    TemplateMatch,
    NeuralClassifier,
}

/// The default fallback order: DOM lookup first (browser contexts
/// only), then template matching, then classifier inference.
pub const DEFAULT_STRATEGY_ORDER: &[StrategyKind] = &[
    StrategyKind::DomSelector,
    StrategyKind::TemplateMatch,
    StrategyKind::NeuralClassifier,
];

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found {
        /// Logical input coordinates, already divided by the display
        /// scale factor.
        point: Point,
        /// The matched region in the strategy's native coordinates
        /// (device pixels for capture-based strategies).
        region: Rect,
        confidence: f64,
        strategy: StrategyKind,
    },
    NotFound {
        best_confidence: f64,
    },
}

impl Resolution {
    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found { .. })
    }
}

/// Per-strategy outcome, kept so callers (and tests) can see that a
/// fallback actually happened rather than inferring it.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    Matched { candidates: usize },
    NoMatch { best_confidence: f64 },
    Unavailable { reason: String },
}

#[derive(Debug, Clone)]
pub struct ResolveReport {
    pub resolution: Resolution,
    pub transitions: Vec<(StrategyKind, StrategyOutcome)>,
}

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub strategy_order: Vec<StrategyKind>,
    /// `None` uses the configured default threshold.
    pub threshold: Option<f64>,
    /// Which deduplicated candidate to select, best-first.
    pub match_index: usize,
    /// Freeform context recorded with the attempt (script name, step).
    pub context: String,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            strategy_order: DEFAULT_STRATEGY_ORDER.to_vec(),
            threshold: None,
            match_index: 0,
            context: String::new(),
        }
    }
}

struct StrategyCandidates {
    /// Threshold-filtered candidates in device pixels (logical for DOM).
    list: Vec<(Rect, f64)>,
    /// Best confidence observed, filtered or not.
    best: f64,
}

enum StrategyResult {
    Candidates(StrategyCandidates),
    Unavailable(String),
}

pub struct Resolver {
    catalog: Arc<TargetCatalog>,
    capture: Arc<dyn ScreenCapture>,
    browser: Arc<dyn BrowserDriver>,
    classifier: Arc<dyn Classifier>,
    learning: Arc<LearningStore>,
    template_dir: PathBuf,
    match_threshold: f64,
    dedup_radius: f64,
    browser_active: Arc<AtomicBool>,
}

impl Resolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<TargetCatalog>,
        capture: Arc<dyn ScreenCapture>,
        browser: Arc<dyn BrowserDriver>,
        classifier: Arc<dyn Classifier>,
        learning: Arc<LearningStore>,
        template_dir: PathBuf,
        match_threshold: f64,
        dedup_radius: f64,
        browser_active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            catalog,
            capture,
            browser,
            classifier,
            learning,
            template_dir,
            match_threshold,
            dedup_radius,
            browser_active,
        }
    }

    /// Walks the strategy chain for `target`. Unavailable strategies
    /// and empty matches both fall through to the next strategy; the
    /// report records each transition.
    #[instrument(skip(self, opts))]
    pub async fn resolve(
        &self,
        target: &str,
        opts: &ResolveOptions,
    ) -> Result<ResolveReport, AutomationError> {
        let threshold = opts.threshold.unwrap_or(self.match_threshold);
        let mut transitions = Vec::new();
        let mut best_confidence: f64 = 0.0;
        let mut screenshot: Option<Screenshot> = None;
        let mut resolution = None;

        for &strategy in &opts.strategy_order {
            let result = match strategy {
                StrategyKind::DomSelector => self.dom_candidates(target).await,
                StrategyKind::TemplateMatch => {
                    self.template_candidates(target, threshold, &mut screenshot)
                        .await?
                }
                StrategyKind::NeuralClassifier => {
                    self.classifier_candidates(target, threshold, &mut screenshot)
                        .await?
                }
            };

            match result {
                StrategyResult::Unavailable(reason) => {
                    debug!(?strategy, %reason, "strategy unavailable, falling through");
                    transitions.push((strategy, StrategyOutcome::Unavailable { reason }));
                }
                StrategyResult::Candidates(found) => {
                    best_confidence = best_confidence.max(found.best);
                    let deduped = dedup_candidates(found.list, self.dedup_radius);
                    if deduped.is_empty() {
                        transitions.push((
                            strategy,
                            StrategyOutcome::NoMatch {
                                best_confidence: found.best,
                            },
                        ));
                        continue;
                    }
                    transitions.push((
                        strategy,
                        StrategyOutcome::Matched {
                            candidates: deduped.len(),
                        },
                    ));
                    match deduped.get(opts.match_index) {
                        Some(&(rect, confidence)) => {
                            let point = self.to_logical(strategy, rect.center());
                            resolution = Some((
                                Resolution::Found {
                                    point,
                                    region: rect,
                                    confidence,
                                    strategy,
                                },
                                Some(rect),
                            ));
                        }
                        None => {
                            warn!(
                                target,
                                match_index = opts.match_index,
                                candidates = deduped.len(),
                                "match index beyond candidate list"
                            );
                        }
                    }
                    break;
                }
            }
        }

        let (resolution, matched_rect) = resolution.unwrap_or((
            Resolution::NotFound { best_confidence },
            None,
        ));

        self.report_attempt(target, &resolution, matched_rect, &transitions, opts, &screenshot);

        Ok(ResolveReport {
            resolution,
            transitions,
        })
    }

    async fn dom_candidates(&self, target: &str) -> StrategyResult {
        if !self.browser_active.load(AtomicOrdering::Relaxed) {
            return StrategyResult::Unavailable("browser context inactive".into());
        }
        if !self.browser.is_connected() {
            return StrategyResult::Unavailable("browser driver not connected".into());
        }
        let Some(selector) = self.catalog.dom_selector(target) else {
            return StrategyResult::Unavailable(format!("no DOM selector for '{target}'"));
        };
        match self.browser.find(selector).await {
            Ok(rect) => StrategyResult::Candidates(StrategyCandidates {
                list: vec![(rect, 1.0)],
                best: 1.0,
            }),
            Err(AutomationError::CollaboratorUnavailable(reason)) => {
                StrategyResult::Unavailable(reason)
            }
            Err(e) => {
                debug!(target, "DOM lookup missed: {e}");
                StrategyResult::Candidates(StrategyCandidates {
                    list: Vec::new(),
                    best: 0.0,
                })
            }
        }
    }

    async fn template_candidates(
        &self,
        target: &str,
        threshold: f64,
        screenshot: &mut Option<Screenshot>,
    ) -> Result<StrategyResult, AutomationError> {
        let template_path = match self.catalog.template_path(target) {
            Some(path) => path.clone(),
            None => {
                // Retraining may have synthesized a template after the
                // catalog scan; check the canonical location directly.
                let path = self.template_dir.join(format!("{target}.png"));
                if !path.exists() {
                    return Ok(StrategyResult::Unavailable(format!(
                        "no reference template for '{target}'"
                    )));
                }
                path
            }
        };
        let template = image::open(&template_path)?.to_luma8();
        let shot = self.screenshot(screenshot).await?;
        let screen = to_gray(shot);
        if screen.width() < template.width() || screen.height() < template.height() {
            return Ok(StrategyResult::Unavailable(
                "template larger than captured screen".into(),
            ));
        }
        let (list, best) = match_template(&screen, &template, threshold);
        Ok(StrategyResult::Candidates(StrategyCandidates { list, best }))
    }

    async fn classifier_candidates(
        &self,
        target: &str,
        threshold: f64,
        screenshot: &mut Option<Screenshot>,
    ) -> Result<StrategyResult, AutomationError> {
        if !self.classifier.has_model(target) {
            return Ok(StrategyResult::Unavailable(format!(
                "no trained classifier for '{target}'"
            )));
        }
        let window = self
            .catalog
            .template_path(target)
            .and_then(|p| image::open(p).ok())
            .map(|img| (img.width(), img.height()))
            .unwrap_or((64, 64));
        let shot = self.screenshot(screenshot).await?.clone();

        let mut list = Vec::new();
        let mut best: f64 = 0.0;
        let step_x = (window.0 / 2).max(1);
        let step_y = (window.1 / 2).max(1);
        let mut y = 0;
        while y + window.1 <= shot.height {
            let mut x = 0;
            while x + window.0 <= shot.width {
                let rect = Rect {
                    x: x as f64,
                    y: y as f64,
                    width: window.0 as f64,
                    height: window.1 as f64,
                };
                if let Some(png) = crop_to_png(&shot, &rect) {
                    match self.classifier.classify(&png, target).await {
                        Ok(confidence) => {
                            best = best.max(confidence);
                            if confidence >= threshold {
                                list.push((rect, confidence));
                            }
                        }
                        Err(AutomationError::CollaboratorUnavailable(reason)) => {
                            return Ok(StrategyResult::Unavailable(reason));
                        }
                        Err(e) => warn!(target, "classifier window failed: {e}"),
                    }
                }
                x += step_x;
            }
            y += step_y;
        }
        Ok(StrategyResult::Candidates(StrategyCandidates { list, best }))
    }

    async fn screenshot<'a>(
        &self,
        cache: &'a mut Option<Screenshot>,
    ) -> Result<&'a Screenshot, AutomationError> {
        if cache.is_none() {
            *cache = Some(self.capture.capture().await?);
        }
        Ok(cache.as_ref().expect("screenshot cached above"))
    }

    /// Template and classifier rects are in device pixels; DOM rects
    /// arrive logical already.
    fn to_logical(&self, strategy: StrategyKind, point: Point) -> Point {
        match strategy {
            StrategyKind::DomSelector => point,
            StrategyKind::TemplateMatch | StrategyKind::NeuralClassifier => {
                let scale = self.capture.scale_factor().max(0.01);
                Point {
                    x: point.x / scale,
                    y: point.y / scale,
                }
            }
        }
    }

    fn report_attempt(
        &self,
        target: &str,
        resolution: &Resolution,
        matched_rect: Option<Rect>,
        transitions: &[(StrategyKind, StrategyOutcome)],
        opts: &ResolveOptions,
        screenshot: &Option<Screenshot>,
    ) {
        let (succeeded, strategy) = match resolution {
            Resolution::Found { strategy, .. } => (true, *strategy),
            Resolution::NotFound { .. } => (
                false,
                transitions
                    .last()
                    .map(|(kind, _)| *kind)
                    .unwrap_or(StrategyKind::TemplateMatch),
            ),
        };
        let region = matched_rect.and_then(|rect| {
            screenshot
                .as_ref()
                .and_then(|shot| crop_to_png(shot, &rect).map(|png| (png, rect)))
        });
        let outcome = self.learning.record_attempt(
            target,
            succeeded,
            region.as_ref().map(|(png, rect)| (png.as_slice(), *rect)),
            strategy,
            &opts.context,
        );
        if let Err(e) = outcome {
            warn!(target, "failed to record resolution attempt: {e}");
        }
    }
}

/// Sorts by descending confidence, then drops every candidate whose
/// center lies within `radius` pixels of an already-kept stronger one.
fn dedup_candidates(mut candidates: Vec<(Rect, f64)>, radius: f64) -> Vec<(Rect, f64)> {
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    let mut kept: Vec<(Rect, f64)> = Vec::new();
    for candidate in candidates {
        let close = kept
            .iter()
            .any(|(rect, _)| rect.center().distance(&candidate.0.center()) <= radius);
        if !close {
            kept.push(candidate);
        }
    }
    kept
}

fn to_gray(shot: &Screenshot) -> GrayImage {
    let mut gray = GrayImage::new(shot.width, shot.height);
    for (i, px) in gray.pixels_mut().enumerate() {
        let base = i * 4;
        let r = shot.image_data[base] as f32;
        let g = shot.image_data[base + 1] as f32;
        let b = shot.image_data[base + 2] as f32;
        px.0[0] = (0.299 * r + 0.587 * g + 0.114 * b).round() as u8;
    }
    gray
}

/// Grayscale normalized cross-correlation: coarse-stride scan, then
/// stride-1 refinement around each hit. Scores are clamped to `[0, 1]`.
/// Returns the candidates at or above `threshold` plus the best score
/// seen anywhere.
fn match_template(screen: &GrayImage, template: &GrayImage, threshold: f64) -> (Vec<(Rect, f64)>, f64) {
    let (tw, th) = (template.width(), template.height());
    let n = (tw * th) as f64;
    let t_mean = template.as_raw().iter().map(|&p| p as f64).sum::<f64>() / n;
    let t_energy: f64 = template
        .as_raw()
        .iter()
        .map(|&p| (p as f64 - t_mean).powi(2))
        .sum();
    if t_energy <= f64::EPSILON {
        // A flat template matches everything equally; refuse to guess.
        return (Vec::new(), 0.0);
    }

    let stride = (tw.min(th) / 8).max(1);
    let max_x = screen.width() - tw;
    let max_y = screen.height() - th;
    let mut best = 0.0f64;
    let mut hits = Vec::new();

    let mut y = 0;
    while y <= max_y {
        let mut x = 0;
        while x <= max_x {
            let score = ncc_at(screen, template, x, y, t_mean, t_energy, n);
            best = best.max(score);
            if score >= threshold {
                hits.push((x, y));
            }
            x += stride;
        }
        y += stride;
    }

    // Refine each coarse hit to the local stride-1 maximum.
    let mut candidates = Vec::new();
    for (hx, hy) in hits {
        let x0 = hx.saturating_sub(stride);
        let y0 = hy.saturating_sub(stride);
        let x1 = (hx + stride).min(max_x);
        let y1 = (hy + stride).min(max_y);
        let mut local_best = (hx, hy, 0.0f64);
        for y in y0..=y1 {
            for x in x0..=x1 {
                let score = ncc_at(screen, template, x, y, t_mean, t_energy, n);
                if score > local_best.2 {
                    local_best = (x, y, score);
                }
            }
        }
        best = best.max(local_best.2);
        if local_best.2 >= threshold {
            candidates.push((
                Rect {
                    x: local_best.0 as f64,
                    y: local_best.1 as f64,
                    width: tw as f64,
                    height: th as f64,
                },
                local_best.2,
            ));
        }
    }
    (candidates, best)
}

fn ncc_at(
    screen: &GrayImage,
    template: &GrayImage,
    x: u32,
    y: u32,
    t_mean: f64,
    t_energy: f64,
    n: f64,
) -> f64 {
    let (tw, th) = (template.width(), template.height());
    let mut s_sum = 0.0;
    for ty in 0..th {
        for tx in 0..tw {
            s_sum += screen.get_pixel(x + tx, y + ty).0[0] as f64;
        }
    }
    let s_mean = s_sum / n;

    let mut cross = 0.0;
    let mut s_energy = 0.0;
    for ty in 0..th {
        for tx in 0..tw {
            let s = screen.get_pixel(x + tx, y + ty).0[0] as f64 - s_mean;
            let t = template.get_pixel(tx, ty).0[0] as f64 - t_mean;
            cross += s * t;
            s_energy += s * s;
        }
    }
    if s_energy <= f64::EPSILON {
        return 0.0;
    }
    (cross / (s_energy.sqrt() * t_energy.sqrt())).max(0.0)
}

/// Crops `rect` (device pixels, clamped to bounds) out of the raw
/// screenshot and encodes it as PNG.
pub(crate) fn crop_to_png(shot: &Screenshot, rect: &Rect) -> Option<Vec<u8>> {
    let x = rect.x.max(0.0) as u32;
    let y = rect.y.max(0.0) as u32;
    if x >= shot.width || y >= shot.height {
        return None;
    }
    let w = (rect.width as u32).min(shot.width - x);
    let h = (rect.height as u32).min(shot.height - y);
    if w == 0 || h == 0 {
        return None;
    }
    let full = RgbaImage::from_raw(shot.width, shot.height, shot.image_data.clone())?;
    let crop = image::imageops::crop_imm(&full, x, y, w, h).to_image();
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(crop)
        .write_to(&mut out, ImageFormat::Png)
        .ok()?;
    Some(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: f64, y: f64) -> Rect {
        Rect {
            x,
            y,
            width: 10.0,
            height: 10.0,
        }
    }

    #[test]
    fn dedup_keeps_strongest_of_each_cluster() {
        let candidates = vec![
            (rect(100.0, 100.0), 0.85),
            (rect(102.0, 101.0), 0.95),
            (rect(300.0, 100.0), 0.90),
        ];
        let deduped = dedup_candidates(candidates, 10.0);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].1, 0.95);
        assert_eq!(deduped[1].1, 0.90);
    }

    #[test]
    fn template_match_finds_planted_pattern() {
        // A screen with a distinctive 8x8 block at (30, 20).
        let mut screen = GrayImage::from_pixel(64, 48, image::Luma([10u8]));
        let mut template = GrayImage::new(8, 8);
        for ty in 0..8 {
            for tx in 0..8 {
                let value = ((tx * 31 + ty * 17) % 200 + 40) as u8;
                template.put_pixel(tx, ty, image::Luma([value]));
                screen.put_pixel(30 + tx, 20 + ty, image::Luma([value]));
            }
        }
        let (candidates, best) = match_template(&screen, &template, 0.9);
        assert!(best > 0.99, "best score was {best}");
        let top = candidates
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .unwrap();
        assert_eq!((top.0.x as u32, top.0.y as u32), (30, 20));
    }

    #[test]
    fn flat_template_matches_nothing() {
        let screen = GrayImage::from_pixel(32, 32, image::Luma([10u8]));
        let template = GrayImage::from_pixel(8, 8, image::Luma([10u8]));
        let (candidates, best) = match_template(&screen, &template, 0.5);
        assert!(candidates.is_empty());
        assert_eq!(best, 0.0);
    }
}
