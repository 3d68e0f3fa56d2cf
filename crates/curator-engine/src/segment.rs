use std::collections::VecDeque;

use image::{imageops, DynamicImage, Rgba, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::map_object;

const SAMPLE_INSET: u32 = 5;
const VARIANCE_LIMIT: f64 = 20.0;
const WHITE_BRIGHTNESS: f64 = 230.0;
const BLACK_BRIGHTNESS: f64 = 25.0;
const WHITE_TOLERANCE: u8 = 30;
const BLACK_TOLERANCE: u8 = 20;
const FORCED_TOLERANCE: u8 = 24;
const EDGE_ALPHA_FLOOR: u8 = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundKind {
    White,
    Black,
    Indeterminate,
}

impl BackgroundKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::White => "white",
            Self::Black => "black",
            Self::Indeterminate => "indeterminate",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "white" => Some(Self::White),
            "black" => Some(Self::Black),
            "indeterminate" | "auto" => Some(Self::Indeterminate),
            _ => None,
        }
    }

    fn default_tolerance(self) -> u8 {
        match self {
            Self::White => WHITE_TOLERANCE,
            Self::Black => BLACK_TOLERANCE,
            Self::Indeterminate => FORCED_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentationOptions {
    /// Per-channel distance from the background colour; `None` picks the
    /// default for the detected background.
    pub tolerance: Option<u8>,
    /// Proceed with an indeterminate background instead of failing.
    pub force: bool,
    /// Seed every n-th pixel along each edge (corners are always seeds).
    pub seed_stride: u32,
    pub trim: bool,
    pub margin: u32,
    pub hint: Option<BackgroundKind>,
}

impl Default for SegmentationOptions {
    fn default() -> Self {
        Self {
            tolerance: None,
            force: false,
            seed_stride: 1,
            trim: true,
            margin: 0,
            hint: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropBounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackgroundSample {
    pub color: [u8; 3],
    pub brightness: f64,
    pub variance: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SegmentationError {
    #[error("background is ambiguous (brightness {brightness:.1}, variance {variance:.1})")]
    AmbiguousBackground { brightness: f64, variance: f64 },
    #[error("segmentation left no foreground pixels")]
    EmptyResult,
}

#[derive(Debug, Clone)]
pub struct SegmentationResult {
    pub image: RgbaImage,
    pub background_kind: BackgroundKind,
    pub background_color: [u8; 3],
    pub tolerance: u8,
    pub removed_fraction: f64,
    pub bounds: CropBounds,
    pub source_width: u32,
    pub source_height: u32,
    pub pre_matted: bool,
}

impl SegmentationResult {
    /// Non-zero-alpha pixel count of the output image.
    pub fn visible_pixels(&self) -> usize {
        self.image.pixels().filter(|pixel| pixel[3] > 0).count()
    }

    pub fn diagnostics(&self) -> Map<String, Value> {
        map_object(json!({
            "background_kind": self.background_kind.as_str(),
            "background_color": self.background_color,
            "tolerance": self.tolerance,
            "removed_fraction": self.removed_fraction,
            "bounds": self.bounds,
            "source_size": format!("{}x{}", self.source_width, self.source_height),
            "output_size": format!("{}x{}", self.image.width(), self.image.height()),
            "pre_matted": self.pre_matted,
        }))
    }
}

pub fn segment_rgb(
    image: &RgbImage,
    options: &SegmentationOptions,
) -> Result<SegmentationResult, SegmentationError> {
    let rgba = DynamicImage::ImageRgb8(image.clone()).to_rgba8();
    segment(&rgba, options)
}

/// Removes the border-connected background of `image`.
///
/// Input whose border already holds fully transparent pixels is treated as
/// matted: only alpha-0 pixels reachable from the border count as
/// background, so segmenting a segmented image reproduces it. Partial alpha
/// inside the subject does not count.
pub fn segment(
    image: &RgbaImage,
    options: &SegmentationOptions,
) -> Result<SegmentationResult, SegmentationError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(SegmentationError::EmptyResult);
    }

    let pre_matted = border_is_transparent(image);
    let sample = sample_background(image);
    let background_kind = classify(&sample, options, pre_matted)?;
    let tolerance = options
        .tolerance
        .unwrap_or_else(|| background_kind.default_tolerance());

    let is_background = |pixel: &Rgba<u8>| -> bool {
        if pre_matted {
            return pixel[3] == 0;
        }
        (0..3).all(|channel| pixel[channel].abs_diff(sample.color[channel]) <= tolerance)
    };

    let mask = flood_background(image, options.seed_stride.max(1), is_background);
    let removed = mask.iter().filter(|flag| **flag).count();
    let total = (width as usize) * (height as usize);
    if removed >= total {
        return Err(SegmentationError::EmptyResult);
    }

    let mut matted = image.clone();
    for (idx, pixel) in matted.pixels_mut().enumerate() {
        if mask[idx] {
            pixel[3] = 0;
        }
    }
    soften_edges(&mut matted);

    let Some(content) = content_bounds(&matted) else {
        return Err(SegmentationError::EmptyResult);
    };
    let bounds = if options.trim {
        expand_bounds(content, options.margin, width, height)
    } else {
        CropBounds {
            x: 0,
            y: 0,
            width,
            height,
        }
    };
    let output = if bounds.width == width && bounds.height == height {
        matted
    } else {
        imageops::crop_imm(&matted, bounds.x, bounds.y, bounds.width, bounds.height).to_image()
    };

    Ok(SegmentationResult {
        image: output,
        background_kind,
        background_color: sample.color,
        tolerance,
        removed_fraction: removed as f64 / total as f64,
        bounds,
        source_width: width,
        source_height: height,
        pre_matted,
    })
}

fn border_is_transparent(image: &RgbaImage) -> bool {
    let (width, height) = image.dimensions();
    let (max_x, max_y) = (width - 1, height - 1);
    let mut edge = (0..width)
        .flat_map(|x| [(x, 0), (x, max_y)])
        .chain((0..height).flat_map(|y| [(0, y), (max_x, y)]));
    edge.any(|(x, y)| image.get_pixel(x, y)[3] == 0)
}

/// Samples each corner and three points inset toward the centre.
pub fn sample_background(image: &RgbaImage) -> BackgroundSample {
    let (width, height) = image.dimensions();
    let max_x = width.saturating_sub(1);
    let max_y = height.saturating_sub(1);
    let inset_x = SAMPLE_INSET.min(max_x);
    let inset_y = SAMPLE_INSET.min(max_y);

    let mut points = Vec::with_capacity(16);
    for (cx, cy, inward_x, inward_y) in [
        (0, 0, inset_x as i64, inset_y as i64),
        (max_x, 0, -(inset_x as i64), inset_y as i64),
        (0, max_y, inset_x as i64, -(inset_y as i64)),
        (max_x, max_y, -(inset_x as i64), -(inset_y as i64)),
    ] {
        let shifted = |origin: u32, delta: i64| (origin as i64 + delta) as u32;
        points.push((cx, cy));
        points.push((shifted(cx, inward_x), cy));
        points.push((cx, shifted(cy, inward_y)));
        points.push((shifted(cx, inward_x), shifted(cy, inward_y)));
    }

    let colors: Vec<[f64; 3]> = points
        .iter()
        .map(|(x, y)| {
            let pixel = image.get_pixel(*x, *y);
            [pixel[0] as f64, pixel[1] as f64, pixel[2] as f64]
        })
        .collect();
    let count = colors.len() as f64;
    let mut mean = [0.0f64; 3];
    for color in &colors {
        for channel in 0..3 {
            mean[channel] += color[channel] / count;
        }
    }
    let variance = colors
        .iter()
        .map(|color| {
            (0..3)
                .map(|channel| (color[channel] - mean[channel]).abs())
                .sum::<f64>()
        })
        .sum::<f64>()
        / (count * 3.0);

    BackgroundSample {
        color: [
            mean[0].round() as u8,
            mean[1].round() as u8,
            mean[2].round() as u8,
        ],
        brightness: (mean[0] + mean[1] + mean[2]) / 3.0,
        variance,
    }
}

fn classify(
    sample: &BackgroundSample,
    options: &SegmentationOptions,
    pre_matted: bool,
) -> Result<BackgroundKind, SegmentationError> {
    let kind = if sample.variance > VARIANCE_LIMIT {
        BackgroundKind::Indeterminate
    } else if let Some(hint) = options.hint {
        hint
    } else if sample.brightness > WHITE_BRIGHTNESS {
        BackgroundKind::White
    } else if sample.brightness < BLACK_BRIGHTNESS {
        BackgroundKind::Black
    } else {
        BackgroundKind::Indeterminate
    };

    if kind == BackgroundKind::Indeterminate && !options.force && !pre_matted {
        return Err(SegmentationError::AmbiguousBackground {
            brightness: sample.brightness,
            variance: sample.variance,
        });
    }
    Ok(kind)
}

fn flood_background(
    image: &RgbaImage,
    seed_stride: u32,
    is_background: impl Fn(&Rgba<u8>) -> bool,
) -> Vec<bool> {
    let (width, height) = image.dimensions();
    let index = |x: u32, y: u32| (y as usize) * (width as usize) + x as usize;
    let mut mask = vec![false; (width as usize) * (height as usize)];
    let mut queue = VecDeque::new();

    let seed = |x: u32, y: u32, mask: &mut [bool], queue: &mut VecDeque<(u32, u32)>| {
        let idx = index(x, y);
        if !mask[idx] && is_background(image.get_pixel(x, y)) {
            mask[idx] = true;
            queue.push_back((x, y));
        }
    };

    let max_x = width - 1;
    let max_y = height - 1;
    for (x, y) in [(0, 0), (max_x, 0), (0, max_y), (max_x, max_y)] {
        seed(x, y, &mut mask, &mut queue);
    }
    for x in (0..width).step_by(seed_stride as usize) {
        seed(x, 0, &mut mask, &mut queue);
        seed(x, max_y, &mut mask, &mut queue);
    }
    for y in (0..height).step_by(seed_stride as usize) {
        seed(0, y, &mut mask, &mut queue);
        seed(max_x, y, &mut mask, &mut queue);
    }

    while let Some((x, y)) = queue.pop_front() {
        let neighbours = [
            (x > 0).then(|| (x - 1, y)),
            (x < max_x).then(|| (x + 1, y)),
            (y > 0).then(|| (x, y - 1)),
            (y < max_y).then(|| (x, y + 1)),
        ];
        for (nx, ny) in neighbours.into_iter().flatten() {
            seed(nx, ny, &mut mask, &mut queue);
        }
    }
    mask
}

/// Averages the alpha of opaque pixels that touch transparency, reading
/// from a snapshot so the pass is order independent.
fn soften_edges(image: &mut RgbaImage) {
    let (width, height) = image.dimensions();
    let snapshot: Vec<u8> = image.pixels().map(|pixel| pixel[3]).collect();
    let alpha_at = |x: u32, y: u32| snapshot[(y as usize) * (width as usize) + x as usize];

    for y in 0..height {
        for x in 0..width {
            let own = alpha_at(x, y);
            if own != 255 {
                continue;
            }
            let neighbours: Vec<u8> = [
                (x > 0).then(|| (x - 1, y)),
                (x + 1 < width).then(|| (x + 1, y)),
                (y > 0).then(|| (x, y - 1)),
                (y + 1 < height).then(|| (x, y + 1)),
            ]
            .into_iter()
            .flatten()
            .map(|(nx, ny)| alpha_at(nx, ny))
            .collect();
            if !neighbours.iter().any(|alpha| *alpha == 0) {
                continue;
            }
            let sum = own as u32 + neighbours.iter().map(|alpha| *alpha as u32).sum::<u32>();
            let mean = sum / (neighbours.len() as u32 + 1);
            image.get_pixel_mut(x, y)[3] = (mean as u8).max(EDGE_ALPHA_FLOOR);
        }
    }
}

fn content_bounds(image: &RgbaImage) -> Option<CropBounds> {
    let mut min_x = u32::MAX;
    let mut min_y = u32::MAX;
    let mut max_x = 0;
    let mut max_y = 0;
    let mut found = false;
    for (x, y, pixel) in image.enumerate_pixels() {
        if pixel[3] == 0 {
            continue;
        }
        found = true;
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }
    found.then(|| CropBounds {
        x: min_x,
        y: min_y,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
    })
}

fn expand_bounds(bounds: CropBounds, margin: u32, width: u32, height: u32) -> CropBounds {
    let x = bounds.x.saturating_sub(margin);
    let y = bounds.y.saturating_sub(margin);
    let right = (bounds.x + bounds.width).saturating_add(margin).min(width);
    let bottom = (bounds.y + bounds.height).saturating_add(margin).min(height);
    CropBounds {
        x,
        y,
        width: right - x,
        height: bottom - y,
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    use super::{
        segment, segment_rgb, BackgroundKind, CropBounds, SegmentationError, SegmentationOptions,
    };

    fn canvas_with_square(
        size: u32,
        background: [u8; 3],
        square: u32,
        color: [u8; 3],
    ) -> RgbImage {
        let offset = (size - square) / 2;
        RgbImage::from_fn(size, size, |x, y| {
            let inside = (offset..offset + square).contains(&x)
                && (offset..offset + square).contains(&y);
            Rgb(if inside { color } else { background })
        })
    }

    #[test]
    fn white_background_with_centred_square_trims_to_square() -> anyhow::Result<()> {
        let source = canvas_with_square(100, [255, 255, 255], 40, [220, 20, 20]);
        let options = SegmentationOptions {
            tolerance: Some(20),
            ..SegmentationOptions::default()
        };
        let result = segment_rgb(&source, &options)?;

        assert_eq!(result.background_kind, BackgroundKind::White);
        assert_eq!(result.image.dimensions(), (40, 40));
        assert_eq!(
            result.bounds,
            CropBounds {
                x: 30,
                y: 30,
                width: 40,
                height: 40
            }
        );
        assert!((result.removed_fraction - 0.84).abs() < 1e-9);
        assert_eq!(result.image.get_pixel(20, 20)[3], 255);
        Ok(())
    }

    #[test]
    fn edge_pixels_are_softened_but_stay_visible() -> anyhow::Result<()> {
        let source = canvas_with_square(50, [255, 255, 255], 10, [0, 0, 200]);
        let result = segment_rgb(&source, &SegmentationOptions::default())?;

        let corner = result.image.get_pixel(0, 0)[3];
        let side = result.image.get_pixel(5, 0)[3];
        assert!(corner < 255 && corner >= 96);
        assert!(side < 255 && side >= 96);
        assert_eq!(result.image.get_pixel(5, 5)[3], 255);
        assert_eq!(result.image.get_pixel(5, 5).0[..3], [0, 0, 200]);
        Ok(())
    }

    #[test]
    fn enclosed_background_coloured_region_stays_opaque() -> anyhow::Result<()> {
        let source = RgbImage::from_fn(60, 60, |x, y| {
            let on_ring = (10..50).contains(&x)
                && (10..50).contains(&y)
                && (x < 13 || x >= 47 || y < 13 || y >= 47);
            Rgb(if on_ring { [10, 10, 10] } else { [255, 255, 255] })
        });
        let result = segment_rgb(&source, &SegmentationOptions::default())?;

        assert_eq!(result.image.dimensions(), (40, 40));
        assert_eq!(*result.image.get_pixel(20, 20), Rgba([255, 255, 255, 255]));
        let opaque_interior = (3..37)
            .flat_map(|y| (3..37).map(move |x| (x, y)))
            .all(|(x, y)| result.image.get_pixel(x, y)[3] == 255);
        assert!(opaque_interior);
        Ok(())
    }

    #[test]
    fn resegmenting_output_is_idempotent() -> anyhow::Result<()> {
        let source = canvas_with_square(80, [255, 255, 255], 30, [30, 160, 60]);
        let options = SegmentationOptions {
            margin: 4,
            ..SegmentationOptions::default()
        };
        let first = segment_rgb(&source, &options)?;
        let second = segment(&first.image, &options)?;

        assert!(second.pre_matted);
        assert_eq!(first.image.dimensions(), second.image.dimensions());
        assert_eq!(first.visible_pixels(), second.visible_pixels());
        assert_eq!(first.image, second.image);
        Ok(())
    }

    #[test]
    fn interior_partial_alpha_does_not_mark_input_as_matted() -> anyhow::Result<()> {
        let source = canvas_with_square(100, [255, 255, 255], 40, [220, 20, 20]);
        let mut rgba = image::DynamicImage::ImageRgb8(source).to_rgba8();
        rgba.put_pixel(50, 50, Rgba([220, 20, 20, 254]));
        let options = SegmentationOptions {
            tolerance: Some(20),
            ..SegmentationOptions::default()
        };
        let result = segment(&rgba, &options)?;

        assert!(!result.pre_matted);
        assert_eq!(result.background_kind, BackgroundKind::White);
        assert_eq!(result.image.dimensions(), (40, 40));
        assert!((result.removed_fraction - 0.84).abs() < 1e-9);
        assert_eq!(result.image.get_pixel(20, 20)[3], 254);
        Ok(())
    }

    #[test]
    fn black_background_is_detected() -> anyhow::Result<()> {
        let source = canvas_with_square(40, [0, 0, 0], 10, [250, 250, 0]);
        let result = segment_rgb(&source, &SegmentationOptions::default())?;
        assert_eq!(result.background_kind, BackgroundKind::Black);
        assert_eq!(result.tolerance, 20);
        assert_eq!(result.image.dimensions(), (10, 10));
        Ok(())
    }

    #[test]
    fn mid_grey_background_is_ambiguous_unless_forced() -> anyhow::Result<()> {
        let source = canvas_with_square(40, [128, 128, 128], 10, [250, 0, 0]);
        let err = segment_rgb(&source, &SegmentationOptions::default())
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected ambiguity error"))?;
        assert!(matches!(
            err,
            SegmentationError::AmbiguousBackground { variance, .. } if variance == 0.0
        ));

        let forced = segment_rgb(
            &source,
            &SegmentationOptions {
                force: true,
                ..SegmentationOptions::default()
            },
        )?;
        assert_eq!(forced.background_kind, BackgroundKind::Indeterminate);
        assert_eq!(forced.tolerance, 24);
        assert_eq!(forced.image.dimensions(), (10, 10));
        Ok(())
    }

    #[test]
    fn hint_replaces_brightness_classification() -> anyhow::Result<()> {
        let source = canvas_with_square(40, [200, 200, 200], 10, [0, 0, 0]);
        let result = segment_rgb(
            &source,
            &SegmentationOptions {
                hint: Some(BackgroundKind::White),
                ..SegmentationOptions::default()
            },
        )?;
        assert_eq!(result.background_kind, BackgroundKind::White);
        assert_eq!(result.background_color, [200, 200, 200]);
        Ok(())
    }

    #[test]
    fn noisy_corners_are_ambiguous() {
        let source = RgbImage::from_fn(30, 30, |x, y| {
            if x < 15 && y < 15 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        let err = segment_rgb(&source, &SegmentationOptions::default()).err();
        assert!(matches!(
            err,
            Some(SegmentationError::AmbiguousBackground { variance, .. }) if variance > 20.0
        ));
    }

    #[test]
    fn uniform_canvas_is_empty_result() {
        let source = RgbImage::from_pixel(20, 20, Rgb([255, 255, 255]));
        let err = segment_rgb(&source, &SegmentationOptions::default()).err();
        assert_eq!(err, Some(SegmentationError::EmptyResult));
        assert_eq!(
            segment(&RgbaImage::new(0, 0), &SegmentationOptions::default()).err(),
            Some(SegmentationError::EmptyResult)
        );
    }

    #[test]
    fn margin_is_clamped_and_trim_can_be_disabled() -> anyhow::Result<()> {
        let source = canvas_with_square(20, [255, 255, 255], 10, [0, 90, 200]);
        let padded = segment_rgb(
            &source,
            &SegmentationOptions {
                margin: 50,
                ..SegmentationOptions::default()
            },
        )?;
        assert_eq!(padded.image.dimensions(), (20, 20));

        let untrimmed = segment_rgb(
            &source,
            &SegmentationOptions {
                trim: false,
                ..SegmentationOptions::default()
            },
        )?;
        assert_eq!(untrimmed.image.dimensions(), (20, 20));
        assert_eq!(untrimmed.image.get_pixel(0, 0)[3], 0);
        assert_eq!(untrimmed.image.get_pixel(0, 0).0[..3], [255, 255, 255]);
        Ok(())
    }

    #[test]
    fn sparse_seeding_still_reaches_connected_border() -> anyhow::Result<()> {
        let source = canvas_with_square(64, [255, 255, 255], 16, [120, 0, 120]);
        let result = segment_rgb(
            &source,
            &SegmentationOptions {
                seed_stride: 16,
                ..SegmentationOptions::default()
            },
        )?;
        assert_eq!(result.image.dimensions(), (16, 16));
        Ok(())
    }

    #[test]
    fn background_kind_parses_cli_values() {
        assert_eq!(BackgroundKind::parse("White"), Some(BackgroundKind::White));
        assert_eq!(BackgroundKind::parse("black"), Some(BackgroundKind::Black));
        assert_eq!(BackgroundKind::parse("auto"), Some(BackgroundKind::Indeterminate));
        assert_eq!(BackgroundKind::parse("green"), None);
    }
}
