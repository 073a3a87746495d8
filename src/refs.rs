//! Frame reference resolution for animation layers.
//!
//! A layer only has real drawings on its exposure frames; every other frame
//! either repeats a previous drawing or is produced by the layer's pre/post
//! extrapolation behavior. Resolving a render range means deciding, for every
//! output frame, which frame actually has to be rendered - so duplicated
//! frames can be hard-linked instead of re-rendered.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Extrapolation policy before the first / after the last frame of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Behavior {
    /// Transparent outside the layer lifetime
    None,
    /// Freeze the boundary exposure frame
    Hold,
    /// Tile the layer's own frame span cyclically ("repeat" in older scenes)
    #[serde(alias = "repeat")]
    Loop,
    /// Mirror-bounce between first and last frame
    Pingpong,
}

/// Frame index -> reference index, one entry per output frame.
///
/// - `Some(ref) == key`: frame must be rendered
/// - `Some(ref) != key`: frame is a copy of `ref`
/// - `None`: frame is fully transparent
pub type FrameReferenceMap = BTreeMap<i32, Option<i32>>;

/// Calculate frame references for one layer over `[range_start, range_end]`.
///
/// Every key of the result lies inside the range, and every non-`None` value
/// points directly at a self-referencing key of the result (no chains).
/// A layer without exposure frames contributes nothing and yields an empty map.
///
/// ```
/// use georgeq::refs::{Behavior, calculate_layer_frame_references};
///
/// let refs = calculate_layer_frame_references(
///     1, 5, 1, 5, &[1, 3], Behavior::None, Behavior::None,
/// ).unwrap();
/// assert_eq!(refs[&2], Some(1)); // held drawing, copied from frame 1
/// assert_eq!(refs[&3], Some(3)); // exposure frame, rendered
/// ```
pub fn calculate_layer_frame_references(
    range_start: i32,
    range_end: i32,
    layer_frame_start: i32,
    layer_frame_end: i32,
    exposure_frames: &[i32],
    pre_behavior: Behavior,
    post_behavior: Behavior,
) -> Result<FrameReferenceMap> {
    if range_start > range_end {
        bail!("invalid render range: {} > {}", range_start, range_end);
    }
    if layer_frame_start > layer_frame_end {
        bail!(
            "invalid layer lifetime: {} > {}",
            layer_frame_start,
            layer_frame_end
        );
    }

    let mut refs = FrameReferenceMap::new();
    // Layer without drawings contributes nothing
    if exposure_frames.is_empty() {
        return Ok(refs);
    }

    calculate_in_range(
        range_start,
        range_end,
        exposure_frames,
        layer_frame_end,
        &mut refs,
    );
    calculate_pre_behavior(
        range_start,
        exposure_frames,
        pre_behavior,
        layer_frame_start,
        layer_frame_end,
        &mut refs,
    );
    calculate_post_behavior(
        range_end,
        exposure_frames,
        post_behavior,
        layer_frame_start,
        layer_frame_end,
        &mut refs,
    );
    cleanup_reference_chains(&mut refs)?;
    cleanup_out_of_range(range_start, range_end, &mut refs);

    Ok(refs)
}

/// In-range pass: self-references on exposure frames, hold until next exposure.
///
/// Holding to the next exposure is intrinsic timeline behavior and does not
/// depend on the post behavior setting.
fn calculate_in_range(
    range_start: i32,
    range_end: i32,
    exposure_frames: &[i32],
    layer_frame_end: i32,
    refs: &mut FrameReferenceMap,
) {
    let exposure_set: HashSet<i32> = exposure_frames.iter().copied().collect();

    let mut first_in_range: Option<i32> = None;
    for &frame_idx in exposure_frames {
        if range_start <= frame_idx && frame_idx <= range_end {
            refs.insert(frame_idx, Some(frame_idx));
            first_in_range = Some(match first_in_range {
                Some(first) => first.min(frame_idx),
                Option::None => frame_idx,
            });
        }
    }

    if let Some(first) = first_in_range {
        let mut previous_exposure = first;
        for frame_idx in first..=range_end {
            if frame_idx > layer_frame_end {
                break;
            }
            if exposure_set.contains(&frame_idx) {
                previous_exposure = frame_idx;
            } else {
                refs.insert(frame_idx, Some(previous_exposure));
            }
        }
    }

    // Frames before the first in-range exposure may still show an earlier
    // drawing that lies before the range
    if refs.contains_key(&range_start) {
        return;
    }

    let first_exposure = *exposure_frames.iter().min().unwrap();
    let last_exposure = *exposure_frames.iter().max().unwrap();
    if first_exposure >= range_start || last_exposure < range_start {
        return;
    }

    // Closest exposure frame at or before range start
    let mut closest_exposure = first_exposure;
    for &frame_idx in exposure_frames {
        if frame_idx >= range_start {
            continue;
        }
        if frame_idx > closest_exposure {
            closest_exposure = frame_idx;
        }
    }

    refs.insert(closest_exposure, Some(closest_exposure));
    for frame_idx in range_start..=range_end {
        if refs.contains_key(&frame_idx) {
            break;
        }
        refs.insert(frame_idx, Some(closest_exposure));
    }
}

/// Pre-behavior pass: frames in `[range_start, layer_frame_start - 1]`.
///
/// Moot when the layer (or its first exposure) starts before the range.
fn calculate_pre_behavior(
    range_start: i32,
    exposure_frames: &[i32],
    pre_behavior: Behavior,
    layer_frame_start: i32,
    layer_frame_end: i32,
    refs: &mut FrameReferenceMap,
) {
    if layer_frame_start < range_start {
        return;
    }
    let first_exposure = *exposure_frames.iter().min().unwrap();
    if first_exposure < range_start {
        return;
    }

    let frame_count = layer_frame_end - layer_frame_start + 1;

    match pre_behavior {
        Behavior::None => {
            for frame_idx in range_start..layer_frame_start {
                refs.insert(frame_idx, Option::None);
            }
        }
        Behavior::Hold => {
            for frame_idx in range_start..layer_frame_start {
                refs.insert(frame_idx, Some(first_exposure));
            }
        }
        Behavior::Loop => {
            // Tile the layer span backward from its last frame
            for frame_idx in (range_start..layer_frame_start).rev() {
                let offset = (layer_frame_end - frame_idx).rem_euclid(frame_count);
                refs.insert(frame_idx, Some(layer_frame_end - offset));
            }
        }
        Behavior::Pingpong => {
            let half_seq_len = frame_count - 1;
            let seq_len = half_seq_len * 2;
            for frame_idx in (range_start..layer_frame_start).rev() {
                // Single-frame layer has no bounce window
                if half_seq_len == 0 {
                    refs.insert(frame_idx, Some(layer_frame_start));
                    continue;
                }
                let mut offset = (layer_frame_start - frame_idx).rem_euclid(seq_len);
                if offset > half_seq_len {
                    offset = seq_len - offset;
                }
                refs.insert(frame_idx, Some(layer_frame_start + offset));
            }
        }
    }
}

/// Post-behavior pass: frames in `[layer_frame_end + 1, range_end]`.
///
/// Mirror of the pre pass; moot when the layer (or its last exposure) already
/// reaches the range end.
fn calculate_post_behavior(
    range_end: i32,
    exposure_frames: &[i32],
    post_behavior: Behavior,
    layer_frame_start: i32,
    layer_frame_end: i32,
    refs: &mut FrameReferenceMap,
) {
    if layer_frame_end >= range_end {
        return;
    }
    let last_exposure = *exposure_frames.iter().max().unwrap();
    if last_exposure >= range_end {
        return;
    }

    let frame_count = layer_frame_end - layer_frame_start + 1;

    match post_behavior {
        Behavior::None => {
            for frame_idx in (layer_frame_end + 1)..=range_end {
                refs.insert(frame_idx, Option::None);
            }
        }
        Behavior::Hold => {
            for frame_idx in (layer_frame_end + 1)..=range_end {
                refs.insert(frame_idx, Some(last_exposure));
            }
        }
        Behavior::Loop => {
            // Tile the layer span forward from its first frame
            for frame_idx in (layer_frame_end + 1)..=range_end {
                let offset = (frame_idx - layer_frame_start).rem_euclid(frame_count);
                refs.insert(frame_idx, Some(layer_frame_start + offset));
            }
        }
        Behavior::Pingpong => {
            let half_seq_len = frame_count - 1;
            let seq_len = half_seq_len * 2;
            for frame_idx in (layer_frame_end + 1)..=range_end {
                if half_seq_len == 0 {
                    refs.insert(frame_idx, Some(layer_frame_end));
                    continue;
                }
                let mut offset = (frame_idx - layer_frame_end).rem_euclid(seq_len);
                if offset > half_seq_len {
                    offset = seq_len - offset;
                }
                refs.insert(frame_idx, Some(layer_frame_end - offset));
            }
        }
    }
}

/// Flatten multi-hop references so every value points at a frame that
/// references itself.
///
/// Iterative chase with a visited set: a cyclic chain is a bug in the pass
/// logic and must surface as an error instead of spinning forever.
fn cleanup_reference_chains(refs: &mut FrameReferenceMap) -> Result<()> {
    let keys: Vec<i32> = refs.keys().copied().collect();
    for frame_idx in keys {
        let Some(Some(reference_idx)) = refs.get(&frame_idx).copied() else {
            continue;
        };
        if reference_idx == frame_idx {
            continue;
        }

        let mut visited: HashSet<i32> = HashSet::new();
        let mut current = reference_idx;
        loop {
            if !visited.insert(current) {
                bail!("cyclic frame reference detected at frame {}", frame_idx);
            }
            match refs.get(&current).copied() {
                Some(Some(next)) if next != current => current = next,
                // Terminal: self-reference, transparent, or dangling
                _ => break,
            }
        }

        if current != reference_idx {
            refs.insert(frame_idx, Some(current));
        }
    }
    Ok(())
}

/// Drop frames outside the range and redirect references that point outside.
///
/// The first in-range frame sharing an external reference becomes the new
/// render target; its siblings are redirected to it, so every surviving value
/// refers to a key of the final map.
fn cleanup_out_of_range(range_start: i32, range_end: i32, refs: &mut FrameReferenceMap) {
    let mut replacement_by_external: HashMap<i32, i32> = HashMap::new();

    let keys: Vec<i32> = refs.keys().copied().collect();
    for frame_idx in keys.iter().copied() {
        if frame_idx < range_start || frame_idx > range_end {
            continue;
        }
        let Some(Some(reference_idx)) = refs.get(&frame_idx).copied() else {
            continue;
        };
        if reference_idx >= range_start && reference_idx <= range_end {
            continue;
        }
        // First frame seen for this external target becomes the render source
        let replacement = *replacement_by_external
            .entry(reference_idx)
            .or_insert(frame_idx);
        refs.insert(frame_idx, Some(replacement));
    }

    refs.retain(|frame_idx, _| *frame_idx >= range_start && *frame_idx <= range_end);
}
