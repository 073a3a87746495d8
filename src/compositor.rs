//! Filling and flattening of rendered per-layer frames.
//!
//! Rendering only produces the frames a layer's reference map marks as
//! sources; everything else is reconstructed here: duplicated frames are
//! hard-linked (or copied), layers are alpha-composited bottom to top per
//! output frame, and frames no layer touches get a shared transparent filler.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use image::{GenericImageView, RgbaImage, imageops};
use log::{debug, warn};

use crate::planner::LayerData;
use crate::refs::FrameReferenceMap;

/// Per-layer frame paths; `None` marks an intentionally transparent frame.
pub type FramePaths = BTreeMap<i32, Option<PathBuf>>;

/// Create a fully transparent image with the size of `src_filepath`.
pub fn create_transparent_image_from_source(
    src_filepath: &Path,
    dst_filepath: &Path,
) -> Result<()> {
    let src = image::open(src_filepath)
        .with_context(|| format!("failed to open {}", src_filepath.display()))?;
    let (width, height) = src.dimensions();
    // Zeroed RGBA buffer is fully transparent
    let transparent = RgbaImage::new(width, height);
    transparent
        .save(dst_filepath)
        .with_context(|| format!("failed to save {}", dst_filepath.display()))?;
    Ok(())
}

/// Materialize copied frames: every frame referencing another frame gets its
/// file hard-linked from the referenced render.
///
/// Falls back to a plain copy when the filesystem refuses the link. Self
/// references (already rendered) and `None` references (transparent) are
/// left untouched.
pub fn fill_reference_frames(
    frame_references: &FrameReferenceMap,
    filepaths_by_frame: &FramePaths,
) -> Result<()> {
    for (frame_idx, reference) in frame_references {
        let Some(reference_idx) = reference else {
            continue;
        };
        if reference_idx == frame_idx {
            continue;
        }

        let src = filepaths_by_frame
            .get(reference_idx)
            .and_then(|p| p.as_ref())
            .with_context(|| format!("no source path for reference frame {}", reference_idx))?;
        let dst = filepaths_by_frame
            .get(frame_idx)
            .and_then(|p| p.as_ref())
            .with_context(|| format!("no destination path for frame {}", frame_idx))?;

        if dst.exists() {
            continue;
        }
        if let Err(link_err) = fs::hard_link(src, dst) {
            debug!(
                "Hard link {} -> {} failed ({}), copying instead",
                src.display(),
                dst.display(),
                link_err
            );
            fs::copy(src, dst)
                .with_context(|| format!("failed to copy {} -> {}", src.display(), dst.display()))?;
        }
    }
    Ok(())
}

/// Flatten per-layer frame files into the final output sequence.
///
/// Layers composite in ascending `position` order (later layers drawn over
/// earlier ones). Frames with a single source are renamed into place when
/// `cleanup` is requested, copied otherwise. Frames with no source share one
/// lazily created transparent filler. With `cleanup` set, all leftover
/// per-layer files are removed afterwards.
pub fn composite_rendered_layers(
    layers: &[LayerData],
    filepaths_by_layer_id: &BTreeMap<String, FramePaths>,
    range_start: i32,
    range_end: i32,
    output_filepaths_by_frame: &BTreeMap<i32, PathBuf>,
    cleanup: bool,
) -> Result<()> {
    if output_filepaths_by_frame.is_empty() {
        bail!("nothing to composite: no output filepaths were passed");
    }

    // Bottom-to-top layer order
    let mut ordered_layers: Vec<&LayerData> = layers
        .iter()
        .filter(|l| filepaths_by_layer_id.contains_key(&l.layer_id))
        .collect();
    ordered_layers.sort_by_key(|l| l.position);

    let mut transparent_frames: Vec<&PathBuf> = Vec::new();
    let mut size_source: Option<PathBuf> = None;

    for frame_idx in range_start..=range_end {
        let output_filepath = output_filepaths_by_frame
            .get(&frame_idx)
            .with_context(|| format!("no output filepath for frame {}", frame_idx))?;

        let sources: Vec<&PathBuf> = ordered_layers
            .iter()
            .filter_map(|l| filepaths_by_layer_id[&l.layer_id].get(&frame_idx))
            .filter_map(|p| p.as_ref())
            .filter(|p| p.exists())
            .collect();

        match sources.as_slice() {
            [] => {
                // Defer until a real frame tells us the image size
                transparent_frames.push(output_filepath);
            }
            [single] => {
                if cleanup {
                    fs::rename(single, output_filepath).with_context(|| {
                        format!("failed to rename {} -> {}", single.display(), output_filepath.display())
                    })?;
                } else {
                    fs::copy(single, output_filepath).with_context(|| {
                        format!("failed to copy {} -> {}", single.display(), output_filepath.display())
                    })?;
                }
                size_source.get_or_insert_with(|| output_filepath.clone());
            }
            multiple => {
                let mut flattened: Option<RgbaImage> = None;
                for src in multiple {
                    let img = image::open(src)
                        .with_context(|| format!("failed to open {}", src.display()))?
                        .into_rgba8();
                    match flattened.as_mut() {
                        None => flattened = Some(img),
                        Some(base) => imageops::overlay(base, &img, 0, 0),
                    }
                }
                let flattened = flattened.unwrap();
                flattened.save(output_filepath).with_context(|| {
                    format!("failed to save {}", output_filepath.display())
                })?;
                size_source.get_or_insert_with(|| output_filepath.clone());
            }
        }
    }

    if !transparent_frames.is_empty() {
        let Some(size_source) = size_source else {
            bail!("cannot create transparent filler frames: no rendered frame available");
        };
        // Create the filler once and copy it to the remaining frames
        let (first, rest) = transparent_frames.split_first().unwrap();
        create_transparent_image_from_source(&size_source, first)?;
        for dst in rest {
            fs::copy(first, dst).with_context(|| {
                format!("failed to copy {} -> {}", first.display(), dst.display())
            })?;
        }
    }

    if cleanup {
        cleanup_layer_files(filepaths_by_layer_id, output_filepaths_by_frame);
    }

    Ok(())
}

/// Remove leftover per-layer intermediate files.
fn cleanup_layer_files(
    filepaths_by_layer_id: &BTreeMap<String, FramePaths>,
    output_filepaths_by_frame: &BTreeMap<i32, PathBuf>,
) {
    let outputs: std::collections::HashSet<&PathBuf> =
        output_filepaths_by_frame.values().collect();
    for filepaths in filepaths_by_layer_id.values() {
        for filepath in filepaths.values().flatten() {
            if outputs.contains(filepath) || !filepath.exists() {
                continue;
            }
            if let Err(err) = fs::remove_file(filepath) {
                warn!("Failed to remove {}: {}", filepath.display(), err);
            }
        }
    }
}

/// Shift a rendered sequence to a new start frame by renaming files.
///
/// Renames run from the end backward when shifting forward and from the start
/// forward when shifting backward, so no file is overwritten before it has
/// been moved. New names are derived from the existing ones, keeping any
/// filename prefix, extension and padding intact. Returns the new
/// frame -> filepath mapping; a zero shift performs no renames.
pub fn rename_filepaths_by_frame_start(
    filepaths_by_frame: &BTreeMap<i32, PathBuf>,
    range_start: i32,
    range_end: i32,
    new_frame_start: i32,
) -> Result<BTreeMap<i32, PathBuf>> {
    let offset = new_frame_start - range_start;
    if offset == 0 {
        return Ok(filepaths_by_frame.clone());
    }

    let frames: Vec<i32> = if offset > 0 {
        (range_start..=range_end).rev().collect()
    } else {
        (range_start..=range_end).collect()
    };

    let mut renamed = BTreeMap::new();
    for frame_idx in frames {
        let Some(old_path) = filepaths_by_frame.get(&frame_idx) else {
            continue;
        };
        let new_frame = frame_idx + offset;
        let dir = old_path
            .parent()
            .with_context(|| format!("no parent directory for {}", old_path.display()))?;
        let file_name = old_path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("invalid filename for {}", old_path.display()))?;
        let new_name = shifted_filename(file_name, frame_idx, new_frame).with_context(|| {
            format!("no frame number {} in filename \"{}\"", frame_idx, file_name)
        })?;
        let new_path = dir.join(new_name);
        if *old_path != new_path {
            fs::rename(old_path, &new_path).with_context(|| {
                format!("failed to rename {} -> {}", old_path.display(), new_path.display())
            })?;
        }
        renamed.insert(new_frame, new_path);
    }
    Ok(renamed)
}

/// Replace the frame-number field of `file_name` with `new_frame`, keeping
/// prefix, extension and zero padding.
///
/// The frame field is the last digit run that parses to `frame_idx`, so a
/// digit inside the prefix (e.g. `pos_3.`) is never mistaken for it.
fn shifted_filename(file_name: &str, frame_idx: i32, new_frame: i32) -> Option<String> {
    let bytes = file_name.as_bytes();
    let mut end = bytes.len();
    while end > 0 {
        let run_end = file_name[..end].rfind(|c: char| c.is_ascii_digit())? + 1;
        let mut run_start = run_end;
        while run_start > 0 && bytes[run_start - 1].is_ascii_digit() {
            run_start -= 1;
        }
        if file_name[run_start..run_end].parse::<i32>() == Ok(frame_idx) {
            let width = run_end - run_start;
            return Some(format!(
                "{}{:0>width$}{}",
                &file_name[..run_start],
                new_frame,
                &file_name[run_end..],
                width = width
            ));
        }
        end = run_start;
    }
    None
}

/// Save the first output frame over an opaque background as a thumbnail.
pub fn composite_thumbnail(
    src_filepath: &Path,
    dst_filepath: &Path,
    bg_color: (u8, u8, u8),
) -> Result<()> {
    let src = image::open(src_filepath)
        .with_context(|| format!("failed to open {}", src_filepath.display()))?
        .into_rgba8();
    let (red, green, blue) = bg_color;
    let mut background = RgbaImage::from_pixel(
        src.width(),
        src.height(),
        image::Rgba([red, green, blue, 255]),
    );
    imageops::overlay(&mut background, &src, 0, 0);
    let rgb = image::DynamicImage::ImageRgba8(background).into_rgb8();
    rgb.save(dst_filepath)
        .with_context(|| format!("failed to save {}", dst_filepath.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::collections::HashMap;

    /// Unique scratch dir per test
    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("georgeq_tests")
            .join(format!("{}_{}", tag, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_pixel_image(path: &Path, color: [u8; 4]) {
        RgbaImage::from_pixel(4, 4, Rgba(color)).save(path).unwrap();
    }

    fn layer(id: &str, position: i32) -> LayerData {
        LayerData {
            layer_id: id.to_string(),
            name: id.to_string(),
            position,
            visible: true,
            frame_start: 1,
            frame_end: 3,
        }
    }

    #[test]
    fn test_fill_reference_frames_copies_content() {
        let dir = scratch_dir("fill");
        let src_path = dir.join("pos_0.0001.png");
        write_pixel_image(&src_path, [255, 0, 0, 255]);

        let refs: FrameReferenceMap =
            BTreeMap::from([(1, Some(1)), (2, Some(1)), (3, None)]);
        let paths: FramePaths = BTreeMap::from([
            (1, Some(src_path.clone())),
            (2, Some(dir.join("pos_0.0002.png"))),
            (3, None),
        ]);

        fill_reference_frames(&refs, &paths).unwrap();

        // Destination content equals source content, link or copy
        let src_bytes = fs::read(&src_path).unwrap();
        let dst_bytes = fs::read(dir.join("pos_0.0002.png")).unwrap();
        assert_eq!(src_bytes, dst_bytes);
        // None reference stays absent
        assert!(!dir.join("pos_0.0003.png").exists());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_composite_empty_outputs_is_error() {
        let result = composite_rendered_layers(&[], &BTreeMap::new(), 1, 3, &BTreeMap::new(), false);
        assert!(result.is_err());
    }

    #[test]
    fn test_composite_layers_in_position_order() {
        let dir = scratch_dir("composite");

        // Bottom layer red on frames 1-2, top layer green on frame 2 only
        let bottom_1 = dir.join("pos_0.0001.png");
        let bottom_2 = dir.join("pos_0.0002.png");
        let top_2 = dir.join("pos_1.0002.png");
        write_pixel_image(&bottom_1, [255, 0, 0, 255]);
        write_pixel_image(&bottom_2, [255, 0, 0, 255]);
        write_pixel_image(&top_2, [0, 255, 0, 255]);

        let filepaths: BTreeMap<String, FramePaths> = BTreeMap::from([
            (
                "bottom".to_string(),
                BTreeMap::from([(1, Some(bottom_1)), (2, Some(bottom_2))]),
            ),
            ("top".to_string(), BTreeMap::from([(2, Some(top_2))])),
        ]);
        let outputs: BTreeMap<i32, PathBuf> = (1..=3)
            .map(|f| (f, dir.join(format!("out.{:04}.png", f))))
            .collect();

        let layers = [layer("top", 1), layer("bottom", 0)];
        composite_rendered_layers(&layers, &filepaths, 1, 3, &outputs, false).unwrap();

        // Frame 1: single red source
        let frame1 = image::open(&outputs[&1]).unwrap().into_rgba8();
        assert_eq!(frame1.get_pixel(0, 0).0, [255, 0, 0, 255]);
        // Frame 2: opaque green drawn over red
        let frame2 = image::open(&outputs[&2]).unwrap().into_rgba8();
        assert_eq!(frame2.get_pixel(0, 0).0, [0, 255, 0, 255]);
        // Frame 3: transparent filler with the same size
        let frame3 = image::open(&outputs[&3]).unwrap().into_rgba8();
        assert_eq!(frame3.dimensions(), (4, 4));
        assert_eq!(frame3.get_pixel(0, 0).0[3], 0);

        fs::remove_dir_all(&dir).ok();
    }

    /// Two runs over untouched sources are byte-identical
    #[test]
    fn test_composite_is_idempotent_without_cleanup() {
        let dir = scratch_dir("idempotent");
        let src = dir.join("pos_0.0001.png");
        write_pixel_image(&src, [10, 20, 30, 200]);

        let filepaths: BTreeMap<String, FramePaths> = BTreeMap::from([(
            "a".to_string(),
            BTreeMap::from([(1, Some(src))]),
        )]);
        let outputs = BTreeMap::from([(1, dir.join("out.0001.png"))]);
        let layers = [layer("a", 0)];

        composite_rendered_layers(&layers, &filepaths, 1, 1, &outputs, false).unwrap();
        let first = fs::read(&outputs[&1]).unwrap();
        composite_rendered_layers(&layers, &filepaths, 1, 1, &outputs, false).unwrap();
        let second = fs::read(&outputs[&1]).unwrap();
        assert_eq!(first, second);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_composite_cleanup_removes_sources() {
        let dir = scratch_dir("cleanup");
        let src_1 = dir.join("pos_0.0001.png");
        let src_2 = dir.join("pos_0.0002.png");
        write_pixel_image(&src_1, [1, 2, 3, 255]);
        write_pixel_image(&src_2, [1, 2, 3, 255]);

        let filepaths: BTreeMap<String, FramePaths> = BTreeMap::from([(
            "a".to_string(),
            BTreeMap::from([(1, Some(src_1.clone())), (2, Some(src_2.clone()))]),
        )]);
        let outputs: BTreeMap<i32, PathBuf> = (1..=2)
            .map(|f| (f, dir.join(format!("out.{:04}.png", f))))
            .collect();

        composite_rendered_layers(&[layer("a", 0)], &filepaths, 1, 2, &outputs, true).unwrap();

        assert!(outputs[&1].exists());
        assert!(outputs[&2].exists());
        // Single-source frames were renamed away, nothing left to delete
        assert!(!src_1.exists());
        assert!(!src_2.exists());

        fs::remove_dir_all(&dir).ok();
    }

    /// Distinct content markers must survive the shift in both directions
    #[test]
    fn test_rename_shift_preserves_content() {
        for (new_start, tag) in [(1005, "forward"), (995, "backward")] {
            let dir = scratch_dir(tag);
            let mut filepaths = BTreeMap::new();
            let mut content_by_frame: HashMap<i32, Vec<u8>> = HashMap::new();
            for frame_idx in 1001..=1010 {
                let path = dir.join(format!("{:04}.png", frame_idx));
                let marker = format!("marker-{}", frame_idx).into_bytes();
                fs::write(&path, &marker).unwrap();
                filepaths.insert(frame_idx, path);
                content_by_frame.insert(frame_idx, marker);
            }

            let renamed =
                rename_filepaths_by_frame_start(&filepaths, 1001, 1010, new_start).unwrap();

            let offset = new_start - 1001;
            assert_eq!(renamed.len(), 10);
            for frame_idx in 1001..=1010 {
                let new_path = &renamed[&(frame_idx + offset)];
                let content = fs::read(new_path).unwrap();
                assert_eq!(
                    content, content_by_frame[&frame_idx],
                    "{} shift broke frame {}",
                    tag, frame_idx
                );
            }
            fs::remove_dir_all(&dir).ok();
        }
    }

    /// Shifting a sequence rendered with a filename prefix and a non-PNG
    /// extension must keep its naming scheme
    #[test]
    fn test_rename_shift_keeps_prefix_and_extension() {
        let dir = scratch_dir("prefixed");
        let mut filepaths = BTreeMap::new();
        for frame_idx in 1..=3 {
            let path = dir.join(format!("review.{:04}.tif", frame_idx));
            fs::write(&path, format!("marker-{}", frame_idx)).unwrap();
            filepaths.insert(frame_idx, path);
        }

        let renamed = rename_filepaths_by_frame_start(&filepaths, 1, 3, 101).unwrap();

        for frame_idx in 1..=3 {
            let new_path = &renamed[&(frame_idx + 100)];
            assert_eq!(
                new_path.file_name().unwrap().to_str().unwrap(),
                format!("review.{:04}.tif", frame_idx + 100)
            );
            assert_eq!(
                fs::read(new_path).unwrap(),
                format!("marker-{}", frame_idx).into_bytes()
            );
        }
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_shifted_filename_skips_prefix_digits() {
        assert_eq!(
            shifted_filename("pos_3.0017.png", 17, 5).unwrap(),
            "pos_3.0005.png"
        );
        // Width grows when the new frame needs more digits
        assert_eq!(
            shifted_filename("0999.png", 999, 10001).unwrap(),
            "10001.png"
        );
        assert!(shifted_filename("no_frame_here.png", 17, 5).is_none());
    }

    #[test]
    fn test_rename_noop_keeps_paths() {
        let dir = scratch_dir("noop");
        let path = dir.join("1001.png");
        fs::write(&path, b"content").unwrap();
        let filepaths = BTreeMap::from([(1001, path.clone())]);

        let renamed = rename_filepaths_by_frame_start(&filepaths, 1001, 1001, 1001).unwrap();
        assert_eq!(renamed[&1001], path);
        assert!(path.exists());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_transparent_image_matches_source_size() {
        let dir = scratch_dir("transparent");
        let src = dir.join("src.png");
        let dst = dir.join("dst.png");
        RgbaImage::from_pixel(7, 3, Rgba([9, 9, 9, 255])).save(&src).unwrap();

        create_transparent_image_from_source(&src, &dst).unwrap();
        let img = image::open(&dst).unwrap().into_rgba8();
        assert_eq!(img.dimensions(), (7, 3));
        assert!(img.pixels().all(|p| p.0 == [0, 0, 0, 0]));

        fs::remove_dir_all(&dir).ok();
    }
}
