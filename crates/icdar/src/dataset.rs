//! Dataset implementations producing ready-to-batch [`Sample`]s.

use std::path::Path;

use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::reader::read_annotations;
use crate::targets::build_targets;
use crate::types::{Annotation, DatasetError, Sample, TextInstance};

/// ImageNet channel statistics used for input normalisation.
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];
const SCALE_JITTER: [f32; 4] = [0.5, 1.0, 2.0, 3.0];

/// Anything that can hand out samples by index.
pub trait SampleSource {
    fn len(&self) -> usize;

    /// Prepare sample `index`; `rng` drives any random augmentation.
    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample, DatasetError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sample preparation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Side of the square network input. Should be a multiple of 32.
    #[serde(default = "default_input_size")]
    pub input_size: usize,
    /// Total kernel count of the network, including the full text map.
    #[serde(default = "default_num_kernels")]
    pub num_kernels: usize,
    /// Scale of the smallest kernel.
    #[serde(default = "default_min_scale")]
    pub min_scale: f32,
    /// Random flip, scale jitter and crop.
    #[serde(default)]
    pub augment: bool,
}

fn default_input_size() -> usize {
    640
}
fn default_num_kernels() -> usize {
    3
}
fn default_min_scale() -> f32 {
    0.4
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            num_kernels: default_num_kernels(),
            min_scale: default_min_scale(),
            augment: false,
        }
    }
}

/// Turn an RGB canvas plus instances (already in canvas coordinates) into a sample.
pub fn sample_from_canvas(canvas: &RgbImage, instances: &[TextInstance], config: &DatasetConfig) -> Sample {
    let (w, h) = canvas.dimensions();
    let (width, height) = (w as usize, h as usize);
    let pixels = width * height;

    let mut image = vec![0.0f32; 3 * pixels];
    for (x, y, px) in canvas.enumerate_pixels() {
        let idx = y as usize * width + x as usize;
        for c in 0..3 {
            image[c * pixels + idx] = (px[c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
    }

    let targets = build_targets(instances, height, width, config.num_kernels, config.min_scale);
    Sample {
        image,
        score_map: targets.score_map,
        kernels: targets.kernels,
        training_mask: targets.training_mask,
        original: canvas.as_raw().clone(),
        height,
        width,
        num_kernel_maps: config.num_kernels.saturating_sub(1),
    }
}

/// Resize `img` into a square `size x size` canvas, optionally with augmentation.
///
/// Returns the canvas and the instances mapped into canvas coordinates.
fn fit_to_canvas(
    img: &RgbImage,
    instances: &[TextInstance],
    size: usize,
    augment: bool,
    rng: &mut impl Rng,
) -> (RgbImage, Vec<TextInstance>) {
    let (w, h) = img.dimensions();
    let mut scale = size as f32 / w.max(h).max(1) as f32;
    let mut flip = false;
    if augment {
        scale *= SCALE_JITTER.choose(rng).copied().unwrap_or(1.0);
        flip = rng.gen_bool(0.5);
    }

    let nw = ((w as f32 * scale).round() as u32).max(1);
    let nh = ((h as f32 * scale).round() as u32).max(1);
    let mut resized = image::imageops::resize(img, nw, nh, FilterType::Triangle);
    if flip {
        image::imageops::flip_horizontal_in_place(&mut resized);
    }

    let side = size as u32;
    let off_x = if augment && nw > side { rng.gen_range(0..=nw - side) } else { 0 };
    let off_y = if augment && nh > side { rng.gen_range(0..=nh - side) } else { 0 };

    let mut canvas = RgbImage::from_pixel(side, side, Rgb([0, 0, 0]));
    for y in 0..side.min(nh - off_y) {
        for x in 0..side.min(nw - off_x) {
            canvas.put_pixel(x, y, *resized.get_pixel(x + off_x, y + off_y));
        }
    }

    let sx = nw as f32 / w.max(1) as f32;
    let sy = nh as f32 / h.max(1) as f32;
    let (dx, dy) = (-(off_x as f32), -(off_y as f32));
    let mapped = instances
        .iter()
        .map(|inst| {
            if flip {
                // Mirror around the resized width; the crop comes after the flip.
                inst.transformed(-sx, sy, nw as f32 + dx, dy)
            } else {
                inst.transformed(sx, sy, dx, dy)
            }
        })
        .collect();
    (canvas, mapped)
}

/// Text detection dataset backed by an ICDAR-style directory.
pub struct IcdarDataset {
    annotations: Vec<Annotation>,
    config: DatasetConfig,
}

impl IcdarDataset {
    /// Index `root` (see [`crate::reader`] for the expected layout).
    pub fn open(root: impl AsRef<Path>, config: DatasetConfig) -> Result<Self, DatasetError> {
        let annotations = read_annotations(root.as_ref())?;
        Ok(Self { annotations, config })
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }
}

impl SampleSource for IcdarDataset {
    fn len(&self) -> usize {
        self.annotations.len()
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample, DatasetError> {
        let ann = self.annotations.get(index).ok_or(DatasetError::OutOfRange {
            index,
            len: self.annotations.len(),
        })?;
        let img = image::open(&ann.image)
            .map_err(|source| DatasetError::Image {
                path: ann.image.clone(),
                source,
            })?
            .to_rgb8();
        let (canvas, instances) = fit_to_canvas(
            &img,
            &ann.instances,
            self.config.input_size,
            self.config.augment,
            rng,
        );
        Ok(sample_from_canvas(&canvas, &instances, &self.config))
    }
}

/// Deterministic in-memory dataset: one dark text bar per image on a light background.
///
/// The bar position depends on the index so samples differ; useful for smoke
/// runs and tests without touching the filesystem.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    len: usize,
    config: DatasetConfig,
}

impl SyntheticDataset {
    pub fn new(len: usize, config: DatasetConfig) -> Self {
        Self { len, config }
    }

    /// The text instances placed in sample `index`.
    pub fn instances(&self, index: usize) -> Vec<TextInstance> {
        let s = self.config.input_size as f32;
        let shift = (index % 4) as f32 * s / 16.0;
        let (x0, y0) = (s / 8.0 + shift, s / 4.0 + shift);
        let (x1, y1) = (x0 + s / 2.0, y0 + s / 4.0);
        vec![TextInstance::new(
            vec![[x0, y0], [x1, y0], [x1, y1], [x0, y1]],
            format!("word{index}"),
        )]
    }
}

impl SampleSource for SyntheticDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize, _rng: &mut StdRng) -> Result<Sample, DatasetError> {
        if index >= self.len {
            return Err(DatasetError::OutOfRange {
                index,
                len: self.len,
            });
        }
        let side = self.config.input_size as u32;
        let instances = self.instances(index);
        let mut canvas = RgbImage::from_pixel(side, side, Rgb([230, 230, 230]));
        let mut mask = vec![0.0f32; (side * side) as usize];
        crate::geometry::rasterize(&instances[0].points, side as usize, side as usize, &mut mask, 1.0);
        for (i, v) in mask.iter().enumerate() {
            if *v > 0.0 {
                canvas.put_pixel(i as u32 % side, i as u32 / side, Rgb([20, 20, 20]));
            }
        }
        Ok(sample_from_canvas(&canvas, &instances, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn small_config() -> DatasetConfig {
        DatasetConfig {
            input_size: 32,
            ..Default::default()
        }
    }

    #[test]
    fn test_synthetic_sample_shapes() {
        let ds = SyntheticDataset::new(3, small_config());
        let mut rng = StdRng::seed_from_u64(0);
        let s = ds.get(1, &mut rng).unwrap();
        assert_eq!((s.height, s.width), (32, 32));
        assert_eq!(s.image.len(), 3 * 32 * 32);
        assert_eq!(s.kernels.len(), 2 * 32 * 32);
        assert_eq!(s.num_kernel_maps, 2);
        assert_eq!(s.original.len(), 32 * 32 * 3);
        assert!(s.score_map.iter().any(|&v| v > 0.0));
        assert!(matches!(ds.get(3, &mut rng), Err(DatasetError::OutOfRange { index: 3, len: 3 })));
    }

    #[test]
    fn test_fit_preserves_aspect_and_pads() {
        let img = RgbImage::from_pixel(64, 32, Rgb([255, 255, 255]));
        let inst = vec![TextInstance::new(
            vec![[0.0, 0.0], [64.0, 0.0], [64.0, 32.0], [0.0, 32.0]],
            "all",
        )];
        let mut rng = StdRng::seed_from_u64(0);
        let (canvas, mapped) = fit_to_canvas(&img, &inst, 32, false, &mut rng);
        assert_eq!(canvas.dimensions(), (32, 32));
        assert_eq!(canvas.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(canvas.get_pixel(0, 31), &Rgb([0, 0, 0]));
        assert_eq!(mapped[0].points[2], [32.0, 16.0]);
    }

    #[test]
    fn test_augmented_instances_stay_consistent_with_canvas() {
        // A white quad on black: after any augmentation, the mapped polygon's
        // interior must still be white on the canvas.
        let mut img = RgbImage::from_pixel(40, 40, Rgb([0, 0, 0]));
        for y in 10..30 {
            for x in 5..20 {
                img.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let inst = vec![TextInstance::new(
            vec![[5.0, 10.0], [20.0, 10.0], [20.0, 30.0], [5.0, 30.0]],
            "q",
        )];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..8 {
            let (canvas, mapped) = fit_to_canvas(&img, &inst, 40, true, &mut rng);
            let pts = &mapped[0].points;
            let cx = pts.iter().map(|p| p[0]).sum::<f32>() / 4.0;
            let cy = pts.iter().map(|p| p[1]).sum::<f32>() / 4.0;
            if cx >= 0.0 && cy >= 0.0 && cx < 40.0 && cy < 40.0 {
                let px = canvas.get_pixel(cx as u32, cy as u32);
                assert!(px[0] > 128, "centre ({cx},{cy}) not inside text");
            }
        }
    }
}
