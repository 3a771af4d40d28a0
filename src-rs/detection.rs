//! Object localization: external detector passes, containment-pruned best-box
//! selection and the two-pass detect -> crop -> detect refinement.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::DetectorSettings;
use crate::error::{GuideError, Result};
use crate::geometry::{remap, union_region, BoxGeometry, PixelWindow, Point, Rect};
use crate::overlay;
use crate::process::run_with_timeout;
use crate::util::{artifact_path, truncate_text};

/// Separator the detector expects between object phrases in one prompt.
pub const PROMPT_DELIMITER: &str = " . ";

pub fn object_prompt<S: AsRef<str>>(objects: &[S]) -> String {
    objects
        .iter()
        .map(|o| o.as_ref().trim())
        .filter(|o| !o.is_empty())
        .collect::<Vec<_>>()
        .join(PROMPT_DELIMITER)
}

/// One detected region. `normalized` is in 0..1 image units, `scaled` in pixels of the
/// image the pass ran on; both are always derived from the same detector output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionBox {
    pub normalized: BoxGeometry,
    pub scaled: BoxGeometry,
    pub confidence: f64,
    pub phrase: String,
}

impl DetectionBox {
    pub fn from_normalized(
        normalized: BoxGeometry,
        width: u32,
        height: u32,
        confidence: f64,
        phrase: impl Into<String>,
    ) -> Self {
        Self {
            scaled: normalized.scaled(f64::from(width), f64::from(height)),
            normalized,
            confidence,
            phrase: phrase.into(),
        }
    }
}

/// Boxes from one detector invocation. Zero boxes means nothing matched above the
/// threshold and is not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionPass {
    pub image: PathBuf,
    pub width: u32,
    pub height: u32,
    pub boxes: Vec<DetectionBox>,
}

impl DetectionPass {
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn region(&self) -> Option<Rect> {
        union_region(self.boxes.iter().map(|b| &b.scaled))
    }
}

pub trait Detector {
    fn detect(&self, image: &Path, prompt: &str, threshold: f64) -> Result<DetectionPass>;
}

impl<D: Detector + ?Sized> Detector for &D {
    fn detect(&self, image: &Path, prompt: &str, threshold: f64) -> Result<DetectionPass> {
        (**self).detect(image, prompt, threshold)
    }
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&self, image: &Path, prompt: &str, threshold: f64) -> Result<DetectionPass> {
        (**self).detect(image, prompt, threshold)
    }
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    #[serde(rename = "box")]
    bbox: [f64; 4],
    confidence: f64,
    #[serde(default)]
    phrase: String,
}

#[derive(Debug, Deserialize)]
struct RawDetectorOutput {
    #[serde(default)]
    detections: Vec<RawDetection>,
}

/// Runs a detection program per pass:
/// `<program> [args..] --image <path> --prompt <text> --threshold <t>`.
///
/// The program prints `{"detections": [{"box": [cx, cy, w, h], "confidence": c,
/// "phrase": "..."}]}` with boxes normalized to the image size.
pub struct CommandDetector {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandDetector {
    pub fn new(settings: &DetectorSettings) -> Result<Self> {
        if settings.program.trim().is_empty() {
            return Err(GuideError::config("detector program is empty"));
        }
        Ok(Self {
            program: settings.program.clone(),
            args: settings.args.clone(),
            timeout: Duration::from_secs(settings.timeout_sec.max(1)),
        })
    }
}

impl Detector for CommandDetector {
    fn detect(&self, image: &Path, prompt: &str, threshold: f64) -> Result<DetectionPass> {
        if !image.exists() {
            return Err(GuideError::Detector(format!(
                "image file does not exist: {}",
                image.display()
            )));
        }
        let (width, height) = image::image_dimensions(image)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--image")
            .arg(image)
            .arg("--prompt")
            .arg(prompt)
            .arg("--threshold")
            .arg(threshold.to_string());

        let output = run_with_timeout(&mut cmd, None, self.timeout)
            .map_err(|err| GuideError::Detector(err.to_string()))?;
        if !output.status.success() {
            return Err(GuideError::Detector(format!(
                "{} exited with {}: {}",
                self.program,
                output.code(),
                truncate_text(&output.stderr, 2400)
            )));
        }
        let pass = parse_detector_output(&output.stdout, image, width, height, threshold)?;
        debug!(image = %image.display(), prompt, threshold, boxes = pass.len(), "detector pass");
        Ok(pass)
    }
}

/// Decodes detector stdout into a pass over a `width` x `height` image, dropping
/// non-finite boxes and anything under `threshold`.
pub fn parse_detector_output(
    raw: &str,
    image: &Path,
    width: u32,
    height: u32,
    threshold: f64,
) -> Result<DetectionPass> {
    let parsed: RawDetectorOutput = serde_json::from_str(raw.trim()).map_err(|err| {
        GuideError::Detector(format!(
            "unreadable detector output ({err}): {}",
            truncate_text(raw, 400)
        ))
    })?;
    let boxes = parsed
        .detections
        .into_iter()
        .filter(|d| d.bbox.iter().all(|v| v.is_finite()) && d.confidence.is_finite())
        .filter(|d| d.confidence >= threshold)
        .map(|d| {
            let [cx, cy, w, h] = d.bbox;
            DetectionBox::from_normalized(
                BoxGeometry::new(cx, cy, w, h),
                width,
                height,
                d.confidence,
                d.phrase,
            )
        })
        .collect();
    Ok(DetectionPass {
        image: image.to_path_buf(),
        width,
        height,
        boxes,
    })
}

/// Picks one box among candidates that may describe the same target.
///
/// Candidates are visited from lowest to highest confidence; a candidate whose
/// rectangle strictly contains the center of another surviving box is dropped as a
/// coarse parent region. The most confident survivor wins. Should pruning ever leave
/// nothing (odd detector output), the most confident unpruned box is returned.
pub fn select_best_box(boxes: &[DetectionBox]) -> Option<&DetectionBox> {
    if boxes.is_empty() {
        return None;
    }
    let mut kept: Vec<&DetectionBox> = boxes.iter().collect();
    kept.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));
    let order = kept.clone();

    let mut cursor = 0;
    for candidate in order {
        let contains_other = kept
            .iter()
            .enumerate()
            .any(|(i, other)| i != cursor && candidate.scaled.strictly_contains(other.scaled.center()));
        if contains_other {
            debug!(phrase = %candidate.phrase, confidence = candidate.confidence, "pruned containing box");
            kept.remove(cursor);
        } else {
            cursor += 1;
        }
    }

    if kept.is_empty() {
        warn!(
            candidates = boxes.len(),
            "containment pruning left no boxes; using highest confidence"
        );
        return boxes
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
    }
    kept.into_iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

/// A cropped image written for a follow-up pass. The file is removed when the handle
/// drops unless [`CropArtifact::keep`] was called.
#[derive(Debug)]
pub struct CropArtifact {
    path: PathBuf,
    window: PixelWindow,
    keep: bool,
}

impl CropArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn window(&self) -> PixelWindow {
        self.window
    }

    /// Top-left of the crop in the frame it was cut from.
    pub fn origin(&self) -> Point {
        self.window.origin()
    }

    pub fn keep(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for CropArtifact {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), %err, "failed to remove crop artifact");
            }
        }
    }
}

/// Writes the part of `image` covered by `region` as a PNG under `dir`. Returns `None`
/// when the region does not overlap the image.
pub fn crop_to_region(
    image: &Path,
    region: &Rect,
    dir: &Path,
    label: &str,
) -> Result<Option<CropArtifact>> {
    let source = image::open(image)?;
    let Some(window) = region.pixel_window(source.width(), source.height()) else {
        return Ok(None);
    };
    fs::create_dir_all(dir)?;
    let path = artifact_path(dir, label, "png");
    source
        .crop_imm(window.x, window.y, window.w, window.h)
        .save(&path)?;
    debug!(path = %path.display(), ?window, "crop written");
    Ok(Some(CropArtifact {
        path,
        window,
        keep: false,
    }))
}

/// Result of a successful two-pass localization.
#[derive(Debug)]
pub struct Localization {
    /// Best box center in the crop's pixel frame.
    pub local_center: Point,
    /// Crop top-left in the original image frame.
    pub crop_origin: Point,
    pub crop: CropArtifact,
    pub best: DetectionBox,
}

impl Localization {
    /// Best box center in original-image pixels.
    pub fn center(&self) -> Point {
        remap(self.crop_origin, self.local_center)
    }
}

pub struct ObjectLocalizer<D> {
    detector: D,
    artifact_dir: PathBuf,
    overlay_dir: Option<PathBuf>,
}

impl<D: Detector> ObjectLocalizer<D> {
    pub fn new(detector: D, artifact_dir: impl Into<PathBuf>, overlay_dir: Option<PathBuf>) -> Self {
        Self {
            detector,
            artifact_dir: artifact_dir.into(),
            overlay_dir,
        }
    }

    pub fn detect(&self, image: &Path, prompt: &str, threshold: f64) -> Result<DetectionPass> {
        self.detector.detect(image, prompt, threshold)
    }

    /// Crop used to give the parser a closer look at `prompt`'s candidates. A single
    /// box (or none) yields no crop since there is nothing to narrow down.
    pub fn crop_for_reparse(
        &self,
        image: &Path,
        prompt: &str,
        threshold: f64,
    ) -> Result<Option<CropArtifact>> {
        let pass = self.detect(image, prompt, threshold)?;
        self.write_overlay("reparse", &pass, None);
        if pass.len() <= 1 {
            info!(boxes = pass.len(), prompt, "skipping reparse crop");
            return Ok(None);
        }
        match pass.region() {
            Some(region) => crop_to_region(image, &region, &self.artifact_dir, "reparse-crop"),
            None => Ok(None),
        }
    }

    /// Detect at `crop_threshold`, crop to the union of the hits, detect again at
    /// `final_threshold` and select the best box. `None` when either pass is empty.
    pub fn localize_with_crop(
        &self,
        image: &Path,
        prompt: &str,
        crop_threshold: f64,
        final_threshold: f64,
    ) -> Result<Option<Localization>> {
        let first = self.detect(image, prompt, crop_threshold)?;
        self.write_overlay("pre-cropped", &first, None);
        let Some(region) = first.region() else {
            info!(prompt, "no objects detected during first pass");
            return Ok(None);
        };
        info!(
            boxes = first.len(),
            x1 = region.x1,
            y1 = region.y1,
            x2 = region.x2,
            y2 = region.y2,
            "first pass region"
        );

        let Some(crop) = crop_to_region(image, &region, &self.artifact_dir, "cropped")? else {
            warn!(prompt, "first pass region lies outside the image");
            return Ok(None);
        };

        let second = self.detect(crop.path(), prompt, final_threshold)?;
        self.write_overlay("cropped", &second, None);
        let Some(best) = select_best_box(&second.boxes).cloned() else {
            info!(prompt, "no objects detected during second pass");
            return Ok(None);
        };
        self.write_overlay("final-output", &second, Some(&best));

        let localization = Localization {
            local_center: best.scaled.center(),
            crop_origin: crop.origin(),
            crop,
            best,
        };
        info!(
            phrase = %localization.best.phrase,
            confidence = localization.best.confidence,
            x = localization.center().x,
            y = localization.center().y,
            "selected box"
        );
        Ok(Some(localization))
    }

    fn write_overlay(&self, label: &str, pass: &DetectionPass, best: Option<&DetectionBox>) {
        let Some(dir) = &self.overlay_dir else {
            return;
        };
        let path = artifact_path(dir, label, "png");
        if let Err(err) = overlay::write_detection_overlay(pass, best, &path) {
            warn!(path = %path.display(), %err, "failed to write detection overlay");
        }
    }
}
