//! Reads ICDAR-2015-style directories.
//!
//! ```text
//! root/
//!   img/img_1.jpg
//!   gt/gt_img_1.txt    # x1,y1,x2,y2,x3,y3,x4,y4,transcription
//! ```

use std::path::{Path, PathBuf};

use crate::types::{Annotation, DatasetError, TextInstance};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];
const COORDS_PER_BOX: usize = 8;

/// Parse one ground-truth file body into text instances.
///
/// `path` is used for error reporting only.
pub fn parse_ground_truth(path: &Path, contents: &str) -> Result<Vec<TextInstance>, DatasetError> {
    let mut instances = Vec::new();
    for (idx, raw) in contents.lines().enumerate() {
        let line = raw.trim_start_matches('\u{feff}').trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < COORDS_PER_BOX {
            return Err(DatasetError::Annotation {
                path: path.to_path_buf(),
                line: idx + 1,
                reason: format!("expected at least {COORDS_PER_BOX} coordinates, got {}", fields.len()),
            });
        }
        let mut coords = [0.0f32; COORDS_PER_BOX];
        for (slot, field) in coords.iter_mut().zip(&fields[..COORDS_PER_BOX]) {
            *slot = field.trim().parse().map_err(|e| DatasetError::Annotation {
                path: path.to_path_buf(),
                line: idx + 1,
                reason: format!("bad coordinate {field:?}: {e}"),
            })?;
        }
        let points = coords.chunks_exact(2).map(|p| [p[0], p[1]]).collect();
        // Transcriptions may themselves contain commas.
        let transcription = fields[COORDS_PER_BOX..].join(",");
        instances.push(TextInstance::new(points, transcription.trim()));
    }
    Ok(instances)
}

/// Ground-truth path for an image: `root/gt/gt_<stem>.txt`.
pub fn ground_truth_path(root: &Path, image: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    root.join("gt").join(format!("gt_{stem}.txt"))
}

/// List every image under `root/img` (sorted) and load its annotations.
pub fn read_annotations(root: &Path) -> Result<Vec<Annotation>, DatasetError> {
    let img_dir = root.join("img");
    let mut images: Vec<PathBuf> = std::fs::read_dir(&img_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    images.sort();

    if images.is_empty() {
        return Err(DatasetError::Empty(img_dir));
    }

    let mut annotations = Vec::with_capacity(images.len());
    let mut ignored = 0usize;
    for image in images {
        let gt_path = ground_truth_path(root, &image);
        if !gt_path.exists() {
            return Err(DatasetError::MissingGroundTruth(image));
        }
        let contents = std::fs::read_to_string(&gt_path)?;
        let instances = parse_ground_truth(&gt_path, &contents)?;
        ignored += instances.iter().filter(|i| i.ignored).count();
        annotations.push(Annotation { image, instances });
    }

    tracing::info!(
        root = %root.display(),
        images = annotations.len(),
        ignored_instances = ignored,
        "Loaded ICDAR annotations"
    );
    Ok(annotations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_line() {
        let body = "377,117,463,117,465,130,378,130,Genaxis Theatre\n";
        let inst = parse_ground_truth(Path::new("gt.txt"), body).unwrap();
        assert_eq!(inst.len(), 1);
        assert_eq!(inst[0].points.len(), 4);
        assert_eq!(inst[0].points[2], [465.0, 130.0]);
        assert_eq!(inst[0].transcription, "Genaxis Theatre");
        assert!(!inst[0].ignored);
    }

    #[test]
    fn test_parse_bom_commas_and_dont_care() {
        let body = "\u{feff}1,2,3,4,5,6,7,8,###\n\n10,10,20,10,20,20,10,20,a,b\n";
        let inst = parse_ground_truth(Path::new("gt.txt"), body).unwrap();
        assert_eq!(inst.len(), 2);
        assert!(inst[0].ignored);
        assert_eq!(inst[0].points[0], [1.0, 2.0]);
        assert_eq!(inst[1].transcription, "a,b");
    }

    #[test]
    fn test_parse_rejects_short_and_non_numeric() {
        let err = parse_ground_truth(Path::new("gt.txt"), "1,2,3\n").unwrap_err();
        assert!(matches!(err, DatasetError::Annotation { line: 1, .. }));

        let err = parse_ground_truth(Path::new("gt.txt"), "ok\n1,2,x,4,5,6,7,8,t").unwrap_err();
        assert!(matches!(err, DatasetError::Annotation { line: 1, .. }));

        let err = parse_ground_truth(Path::new("gt.txt"), "1,2,3,4,5,6,7,8,t\n1,2,x,4,5,6,7,8,t")
            .unwrap_err();
        assert!(matches!(err, DatasetError::Annotation { line: 2, .. }));
    }

    #[test]
    fn test_ground_truth_path() {
        let p = ground_truth_path(Path::new("/data"), Path::new("/data/img/img_12.jpg"));
        assert_eq!(p, PathBuf::from("/data/gt/gt_img_12.txt"));
    }
}
