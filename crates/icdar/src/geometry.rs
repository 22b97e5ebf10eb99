//! Polygon helpers for kernel generation: area, perimeter, inward offset,
//! and scanline rasterisation onto a row-major grid.

const EPS: f32 = 1e-6;

/// Shoelace area. Positive when interior lies left of each edge.
pub fn signed_area(points: &[[f32; 2]]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut acc = 0.0f32;
    for i in 0..points.len() {
        let [x0, y0] = points[i];
        let [x1, y1] = points[(i + 1) % points.len()];
        acc += x0 * y1 - x1 * y0;
    }
    acc * 0.5
}

pub fn perimeter(points: &[[f32; 2]]) -> f32 {
    if points.len() < 2 {
        return 0.0;
    }
    (0..points.len())
        .map(|i| {
            let [x0, y0] = points[i];
            let [x1, y1] = points[(i + 1) % points.len()];
            ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt()
        })
        .sum()
}

/// PSE shrink distance for a kernel at scale `ratio`: `area * (1 - r^2) / perimeter`.
pub fn shrink_distance(points: &[[f32; 2]], ratio: f32) -> f32 {
    let perim = perimeter(points);
    if perim < EPS {
        return 0.0;
    }
    signed_area(points).abs() * (1.0 - ratio * ratio) / perim
}

/// Shrink a simple polygon so that its kernel corresponds to scale `ratio`.
///
/// Every edge is moved inward by [`shrink_distance`] and adjacent offset edges
/// are intersected. Returns `None` when the polygon degenerates (an edge flips
/// direction or the area collapses).
pub fn shrink_polygon(points: &[[f32; 2]], ratio: f32) -> Option<Vec<[f32; 2]>> {
    if points.len() < 3 || signed_area(points).abs() < EPS {
        return None;
    }
    if ratio >= 1.0 {
        return Some(points.to_vec());
    }
    let distance = shrink_distance(points, ratio);

    let mut poly = points.to_vec();
    if signed_area(&poly) < 0.0 {
        poly.reverse();
    }
    let n = poly.len();

    // Offset edge i as (origin, unit direction).
    let mut edges = Vec::with_capacity(n);
    for i in 0..n {
        let a = poly[i];
        let b = poly[(i + 1) % n];
        let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
        let len = (dx * dx + dy * dy).sqrt();
        if len < EPS {
            return None;
        }
        let (ux, uy) = (dx / len, dy / len);
        // Left normal points into the interior for positive orientation.
        let (nx, ny) = (-uy, ux);
        edges.push(([a[0] + nx * distance, a[1] + ny * distance], [ux, uy]));
    }

    let mut shrunk = Vec::with_capacity(n);
    for i in 0..n {
        let (p, u) = edges[(i + n - 1) % n];
        let (q, v) = edges[i];
        let cross = u[0] * v[1] - u[1] * v[0];
        if cross.abs() < EPS {
            // Collinear neighbours: push the shared vertex along the normal.
            shrunk.push(q);
            continue;
        }
        let t = ((q[0] - p[0]) * v[1] - (q[1] - p[1]) * v[0]) / cross;
        shrunk.push([p[0] + u[0] * t, p[1] + u[1] * t]);
    }

    // Reject flipped edges.
    for i in 0..n {
        let a = shrunk[i];
        let b = shrunk[(i + 1) % n];
        let (_, u) = edges[i];
        if (b[0] - a[0]) * u[0] + (b[1] - a[1]) * u[1] <= 0.0 {
            return None;
        }
    }
    let area = signed_area(&shrunk);
    if area <= EPS || area > signed_area(&poly) {
        return None;
    }
    Some(shrunk)
}

/// Fill `polygon` into a `height x width` row-major grid with `value`.
///
/// Uses even-odd scanlines sampled at pixel centres.
pub fn rasterize(polygon: &[[f32; 2]], height: usize, width: usize, grid: &mut [f32], value: f32) {
    debug_assert_eq!(grid.len(), height * width);
    if polygon.len() < 3 {
        return;
    }
    let n = polygon.len();
    let mut xs: Vec<f32> = Vec::with_capacity(n);
    for row in 0..height {
        let y = row as f32 + 0.5;
        xs.clear();
        for i in 0..n {
            let [x0, y0] = polygon[i];
            let [x1, y1] = polygon[(i + 1) % n];
            if (y0 <= y && y < y1) || (y1 <= y && y < y0) {
                xs.push(x0 + (y - y0) * (x1 - x0) / (y1 - y0));
            }
        }
        xs.sort_by(|a, b| a.total_cmp(b));
        for pair in xs.chunks_exact(2) {
            let start = (pair[0] - 0.5).ceil().max(0.0) as usize;
            let end = ((pair[1] - 0.5).ceil().max(0.0) as usize).min(width);
            for col in start..end {
                grid[row * width + col] = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f32, y: f32, side: f32) -> Vec<[f32; 2]> {
        vec![[x, y], [x + side, y], [x + side, y + side], [x, y + side]]
    }

    #[test]
    fn test_area_and_perimeter() {
        let sq = square(0.0, 0.0, 4.0);
        assert!((signed_area(&sq).abs() - 16.0).abs() < 1e-5);
        assert!((perimeter(&sq) - 16.0).abs() < 1e-5);

        let mut rev = sq.clone();
        rev.reverse();
        assert!((signed_area(&rev) + signed_area(&sq)).abs() < 1e-5);
    }

    #[test]
    fn test_shrink_square_either_orientation() {
        let sq = square(0.0, 0.0, 10.0);
        // d = 100 * (1 - 0.25) / 40 = 1.875
        let shrunk = shrink_polygon(&sq, 0.5).unwrap();
        let side = 10.0 - 2.0 * 1.875;
        assert!((signed_area(&shrunk).abs() - side * side).abs() < 1e-3);

        let mut rev = sq.clone();
        rev.reverse();
        let shrunk_rev = shrink_polygon(&rev, 0.5).unwrap();
        assert!((signed_area(&shrunk_rev).abs() - side * side).abs() < 1e-3);
    }

    #[test]
    fn test_shrink_ratio_one_is_identity() {
        let sq = square(2.0, 3.0, 5.0);
        assert_eq!(shrink_polygon(&sq, 1.0).unwrap(), sq);
    }

    #[test]
    fn test_shrink_degenerate_inputs() {
        assert!(shrink_polygon(&[[0.0, 0.0], [1.0, 1.0]], 0.5).is_none());
        let flat = vec![[0.0, 0.0], [5.0, 0.0], [10.0, 0.0], [5.0, 0.0]];
        assert!(shrink_polygon(&flat, 0.5).is_none());
    }

    #[test]
    fn test_shrink_thin_rectangle_stays_inside() {
        let sliver = vec![[0.0, 0.0], [100.0, 0.0], [100.0, 2.0], [0.0, 2.0]];
        let shrunk = shrink_polygon(&sliver, 0.4).unwrap();
        for [x, y] in &shrunk {
            assert!(*x > 0.0 && *x < 100.0, "x={x}");
            assert!(*y > 0.0 && *y < 2.0, "y={y}");
        }
    }

    #[test]
    fn test_rasterize_square() {
        let mut grid = vec![0.0f32; 8 * 8];
        rasterize(&square(2.0, 2.0, 4.0), 8, 8, &mut grid, 1.0);
        let filled: f32 = grid.iter().sum();
        assert_eq!(filled, 16.0);
        assert_eq!(grid[2 * 8 + 2], 1.0);
        assert_eq!(grid[5 * 8 + 5], 1.0);
        assert_eq!(grid[6 * 8 + 6], 0.0);
        assert_eq!(grid[8 + 2], 0.0);
    }

    #[test]
    fn test_rasterize_clips_to_grid() {
        let mut grid = vec![0.0f32; 4 * 4];
        rasterize(&square(-10.0, -10.0, 100.0), 4, 4, &mut grid, 2.0);
        assert!(grid.iter().all(|&v| v == 2.0));
    }
}
