//! PSE ground-truth maps: full text score map, shrunk kernels, training mask.

use crate::geometry::{rasterize, shrink_polygon};
use crate::types::TextInstance;

/// Rasterised supervision for one image.
#[derive(Debug, Clone)]
pub struct Targets {
    /// `[H, W]`
    pub score_map: Vec<f32>,
    /// `[K-1, H, W]`, largest kernel first.
    pub kernels: Vec<f32>,
    /// `[H, W]`
    pub training_mask: Vec<f32>,
}

/// Shrink ratios for the `num_kernels - 1` kernel maps, largest first.
///
/// `r_i = 1 - (1 - min_scale) * i / (num_kernels - 1)` for `i = 1..num_kernels`,
/// so the smallest kernel is always at `min_scale`.
pub fn kernel_ratios(num_kernels: usize, min_scale: f32) -> Vec<f32> {
    if num_kernels < 2 {
        return Vec::new();
    }
    let steps = (num_kernels - 1) as f32;
    (1..num_kernels)
        .map(|i| 1.0 - (1.0 - min_scale) * i as f32 / steps)
        .collect()
}

/// Build the score map, kernel maps and training mask on a `height x width` grid.
pub fn build_targets(
    instances: &[TextInstance],
    height: usize,
    width: usize,
    num_kernels: usize,
    min_scale: f32,
) -> Targets {
    let pixels = height * width;
    let ratios = kernel_ratios(num_kernels, min_scale);
    let mut score_map = vec![0.0f32; pixels];
    let mut kernels = vec![0.0f32; pixels * ratios.len()];
    let mut training_mask = vec![1.0f32; pixels];

    let mut collapsed = 0usize;
    for instance in instances {
        if instance.ignored {
            rasterize(&instance.points, height, width, &mut training_mask, 0.0);
            continue;
        }
        rasterize(&instance.points, height, width, &mut score_map, 1.0);
        for (k, &ratio) in ratios.iter().enumerate() {
            match shrink_polygon(&instance.points, ratio) {
                Some(kernel) => {
                    let plane = &mut kernels[k * pixels..(k + 1) * pixels];
                    rasterize(&kernel, height, width, plane, 1.0);
                }
                None => collapsed += 1,
            }
        }
    }
    if collapsed > 0 {
        tracing::debug!(collapsed, "Kernel shrink degenerated for some instances");
    }

    Targets {
        score_map,
        kernels,
        training_mask,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x0: f32, y0: f32, x1: f32, y1: f32, text: &str) -> TextInstance {
        TextInstance::new(vec![[x0, y0], [x1, y0], [x1, y1], [x0, y1]], text)
    }

    #[test]
    fn test_kernel_ratios() {
        let r = kernel_ratios(3, 0.4);
        assert_eq!(r.len(), 2);
        assert!((r[0] - 0.7).abs() < 1e-6);
        assert!((r[1] - 0.4).abs() < 1e-6);

        assert_eq!(kernel_ratios(2, 0.5), vec![0.5]);
        assert!(kernel_ratios(1, 0.4).is_empty());
    }

    #[test]
    fn test_kernels_nested_inside_score_map() {
        let inst = vec![rect(4.0, 4.0, 28.0, 20.0, "text")];
        let t = build_targets(&inst, 32, 32, 3, 0.4);
        let pixels = 32 * 32;
        assert_eq!(t.kernels.len(), 2 * pixels);

        let score: f32 = t.score_map.iter().sum();
        let k0: f32 = t.kernels[..pixels].iter().sum();
        let k1: f32 = t.kernels[pixels..].iter().sum();
        assert!(score > k0 && k0 > k1 && k1 > 0.0, "score={score} k0={k0} k1={k1}");

        for i in 0..pixels {
            assert!(t.kernels[i] <= t.score_map[i]);
            assert!(t.kernels[pixels + i] <= t.kernels[i]);
        }
        assert!(t.training_mask.iter().all(|&m| m == 1.0));
    }

    #[test]
    fn test_ignored_instances_only_touch_mask() {
        let inst = vec![rect(0.0, 0.0, 8.0, 8.0, "###"), rect(10.0, 10.0, 16.0, 16.0, "ok")];
        let t = build_targets(&inst, 16, 16, 2, 0.5);
        assert_eq!(t.training_mask[0], 0.0);
        assert_eq!(t.score_map[0], 0.0);
        assert_eq!(t.kernels[0], 0.0);
        assert_eq!(t.training_mask[12 * 16 + 12], 1.0);
        assert_eq!(t.score_map[12 * 16 + 12], 1.0);
        assert_eq!(t.training_mask.iter().filter(|&&m| m == 0.0).count(), 64);
    }
}
