//! Extraction planning: which frames to render per layer, and under which
//! filenames.
//!
//! The planner turns raw scene layer data into per-layer [`ExtractionPlan`]s
//! (frame references + filenames) and builds the George scripts that make the
//! host render exactly the frames that cannot be copied from another frame.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use crate::refs::{Behavior, FrameReferenceMap, calculate_layer_frame_references};

/// One animation layer as captured from the scene.
///
/// Read-only snapshot; the planner never mutates scene state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerData {
    /// Stable unique key. Older workfiles stored ids as integers, so
    /// deserialization accepts both (coerced to string).
    #[serde(deserialize_with = "string_or_int")]
    pub layer_id: String,

    #[serde(default)]
    pub name: String,

    /// Z-order; lower positions composite first (bottom)
    pub position: i32,

    pub visible: bool,

    /// Inclusive layer lifetime bounds
    pub frame_start: i32,
    pub frame_end: i32,
}

/// Pre/post extrapolation pair of one layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LayerBehavior {
    pub pre: Behavior,
    pub post: Behavior,
}

/// Accept a JSON string or integer and return it as `String`.
///
/// Pre-v2 workfile metadata stored layer ids as integers.
fn string_or_int<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "layer_id must be string or integer, got {}",
            other
        ))),
    }
}

/// Zero-padded frame filename builder (`{prefix}{frame:0pad}{ext}`).
///
/// Padding is the larger of 4 and the digit count of the final frame, so
/// `frame_end = 15000` pads to 5 while short ranges keep the default 4.
#[derive(Debug, Clone)]
pub struct FrameFilenameTemplate {
    prefix: String,
    padding: usize,
    ext: String,
}

impl FrameFilenameTemplate {
    pub fn new(frame_end: i32, filename_prefix: Option<&str>, ext: Option<&str>) -> Self {
        let digits = frame_end.to_string().len();
        Self {
            prefix: filename_prefix.unwrap_or("").to_string(),
            padding: digits.max(4),
            ext: ext.unwrap_or(".png").to_string(),
        }
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn filename(&self, frame: i32) -> String {
        format!(
            "{}{:0>width$}{}",
            self.prefix,
            frame,
            self.ext,
            width = self.padding
        )
    }
}

/// Filename builder for intermediate per-layer renders
/// (`{prefix}pos_{pos}.{frame:0pad}{ext}`).
#[derive(Debug, Clone)]
pub struct LayerPositionTemplate {
    prefix: String,
    padding: usize,
    ext: String,
}

impl LayerPositionTemplate {
    pub fn new(range_end: i32, filename_prefix: Option<&str>, ext: Option<&str>) -> Self {
        let frame_template = FrameFilenameTemplate::new(range_end, filename_prefix, ext);
        Self {
            prefix: frame_template.prefix,
            padding: frame_template.padding,
            ext: frame_template.ext,
        }
    }

    pub fn filename(&self, position: i32, frame: i32) -> String {
        format!(
            "{}pos_{}.{:0>width$}{}",
            self.prefix,
            position,
            frame,
            self.ext,
            width = self.padding
        )
    }
}

/// Render plan of one layer: resolved frame references plus the filename of
/// every frame involved (output range union render targets).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionPlan {
    pub frame_references: FrameReferenceMap,
    pub filenames_by_frame_index: BTreeMap<i32, String>,
}

/// Options for [`calculate_layers_extraction_data`].
#[derive(Debug, Clone, Default)]
pub struct ExtractionOptions {
    /// Include hidden layers instead of skipping them
    pub include_not_visible: bool,
    pub filename_prefix: Option<String>,
    pub ext: Option<String>,
}

/// Build one [`ExtractionPlan`] per layer that has anything to render.
///
/// Layers are skipped when hidden (unless requested), when their exposure set
/// is empty, or when the resolved reference map contains no render targets.
/// Missing exposure or behavior data for a present layer is an error.
pub fn calculate_layers_extraction_data(
    layers: &[LayerData],
    exposure_frames_by_layer_id: &HashMap<String, Vec<i32>>,
    behavior_by_layer_id: &HashMap<String, LayerBehavior>,
    range_start: i32,
    range_end: i32,
    options: &ExtractionOptions,
) -> Result<HashMap<String, ExtractionPlan>> {
    let layer_template = LayerPositionTemplate::new(
        range_end,
        options.filename_prefix.as_deref(),
        options.ext.as_deref(),
    );

    let mut output = HashMap::new();
    for layer in layers {
        if !options.include_not_visible && !layer.visible {
            continue;
        }

        let exposure_frames = exposure_frames_by_layer_id
            .get(&layer.layer_id)
            .with_context(|| format!("no exposure frames for layer \"{}\"", layer.layer_id))?;
        // Empty layer contributes nothing
        if exposure_frames.is_empty() {
            continue;
        }

        let behavior = behavior_by_layer_id
            .get(&layer.layer_id)
            .with_context(|| format!("no behavior data for layer \"{}\"", layer.layer_id))?;

        let frame_references = calculate_layer_frame_references(
            range_start,
            range_end,
            layer.frame_start,
            layer.frame_end,
            exposure_frames,
            behavior.pre,
            behavior.post,
        )?;

        // Frames that actually need a render pass in the host
        let frames_to_render: Vec<i32> =
            frame_references.values().filter_map(|r| *r).collect();
        if frames_to_render.is_empty() {
            continue;
        }

        let mut filenames_by_frame_index = BTreeMap::new();
        for frame_idx in (range_start..=range_end).chain(frames_to_render.iter().copied()) {
            filenames_by_frame_index
                .entry(frame_idx)
                .or_insert_with(|| layer_template.filename(layer.position, frame_idx));
        }

        output.insert(
            layer.layer_id.clone(),
            ExtractionPlan {
                frame_references,
                filenames_by_frame_index,
            },
        );
    }
    Ok(output)
}

/// George script rendering one layer's source frames to `staging_dir`.
///
/// Only self-referencing frames are saved; the rest are filled from them
/// later by the compositor. `staging_dir` may contain a `{key}` placeholder
/// that the command layer substitutes at execution time.
pub fn build_render_script(layer: &LayerData, plan: &ExtractionPlan, staging_dir: &str) -> String {
    let mut lines = vec![
        format!("tv_layergetid {}", layer.position),
        "layer_id = result".to_string(),
        "tv_layerset layer_id".to_string(),
        "tv_SaveMode \"PNG\"".to_string(),
    ];

    for (frame_idx, reference) in &plan.frame_references {
        if *reference != Some(*frame_idx) {
            continue;
        }
        let filename = &plan.filenames_by_frame_index[frame_idx];
        lines.push(format!("tv_layerImage {}", frame_idx));
        lines.push(format!(
            "tv_saveimage \"{}/{}\"",
            staging_dir.replace('\\', "/"),
            filename
        ));
    }

    lines.join("\n")
}

/// George script exporting the flattened scene over `[mark_in, mark_out]`
/// with a solid background, restoring the scene background afterwards.
///
/// `scene_bg_color` is the raw `tv_background` result of the scene
/// (type token followed by color values), replayed verbatim to restore it.
pub fn build_review_script(
    mark_in: i32,
    mark_out: i32,
    bg_color: (u8, u8, u8),
    scene_bg_color: &[String],
    first_frame_path: &str,
) -> String {
    let (red, green, blue) = bg_color;
    let mut lines = vec![
        format!("tv_background \"color\" {} {} {}", red, green, blue),
        "tv_SaveMode \"PNG\"".to_string(),
        format!("export_path = \"{}\"", first_frame_path.replace('\\', "/")),
        format!(
            "tv_savesequence '\"'export_path'\"' {} {}",
            mark_in, mark_out
        ),
    ];

    if let Some((bg_type, values)) = scene_bg_color.split_first() {
        let mut restore = format!("tv_background \"{}\"", bg_type);
        for value in values {
            restore.push(' ');
            restore.push_str(value);
        }
        lines.push(restore);
    }

    lines.join("\n")
}
