// ============================================================================
// layerforge CLI — headless layer compositing from the command line
// ============================================================================
//
// Usage examples:
//   layerforge -i base.png overlay.png --blend normal multiply -o out.png
//   layerforge -i "shots/*.png" --opacity 1 0.5 0.25 -o stack.png
//   layerforge -i photo.jpg --adjust invert --adjust "hue/saturation" -o out.jpg
//   layerforge -i logo.png --width 1024 --height 512 --at 10,20 -o banner.png
//
// Each input becomes one raster layer, bottom to top, in the order given
// (glob matches are sorted). Adjustment layers stack above the images.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use tracing::{debug, info, warn};

use crate::blend::BlendMode;
use crate::codec::{ImageCodec, ImageCrateCodec, SaveFormat};
use crate::document::Document;
use crate::layer::{AdjustmentKind, Layer};
use crate::pixel::PixelBuffer;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// layerforge headless compositor.
#[derive(Parser, Debug)]
#[command(
    name = "layerforge",
    version,
    about = "Composite image files as layers and save the flattened result",
    long_about = "Stack image files as layers with per-layer blend modes and opacity,\n\
                  optionally add adjustment layers on top, then render and save.\n\n\
                  Example:\n  \
                  layerforge -i base.png overlay.png --blend normal multiply -o out.png"
)]
pub struct CliArgs {
    /// Input file(s), bottom layer first. Glob patterns accepted (e.g. "*.png").
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Output file. The format follows the extension (png, jpg, bmp, tga).
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Blend mode per input layer ("normal", "multiply", "soft light", ...).
    /// Missing entries default to normal.
    #[arg(short, long, num_args = 1.., value_name = "MODE")]
    pub blend: Vec<String>,

    /// Opacity per input layer, 0.0 to 1.0. Missing entries default to 1.
    #[arg(long, num_args = 1.., value_name = "0-1")]
    pub opacity: Vec<f32>,

    /// Layer offset per input as X,Y. Missing entries default to 0,0.
    #[arg(long, num_args = 1.., value_name = "X,Y")]
    pub at: Vec<String>,

    /// Adjustment layer to add above the images, by name. Repeatable.
    #[arg(long, value_name = "KIND")]
    pub adjust: Vec<String>,

    /// Canvas width. Defaults to the first input's width.
    #[arg(long)]
    pub width: Option<u32>,

    /// Canvas height. Defaults to the first input's height.
    #[arg(long)]
    pub height: Option<u32>,

    /// JPEG quality (1-100).
    #[arg(short, long, default_value_t = 90, value_name = "1-100")]
    pub quality: u8,

    /// Log to stderr at debug level and print timing.
    #[arg(short, long)]
    pub verbose: bool,
}

/// One input resolved into layer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    pub path: PathBuf,
    pub blend: BlendMode,
    pub opacity: f32,
    pub offset: (i32, i32),
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run the compositing job and return an OS exit code.
pub fn run(args: CliArgs) -> ExitCode {
    let start = Instant::now();
    match run_job(&args) {
        Ok(doc) => {
            if args.verbose {
                println!(
                    "{} layers, {}x{} → {} ({:.0}ms)",
                    doc.layer_count(),
                    doc.width(),
                    doc.height(),
                    args.output.display(),
                    start.elapsed().as_secs_f64() * 1000.0
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_job(args: &CliArgs) -> Result<Document, String> {
    if SaveFormat::from_path(&args.output).is_none() && args.output.extension().is_some() {
        return Err(format!("unsupported output format '{}'", args.output.display()));
    }
    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        return Err("no input files matched the given pattern(s)".to_string());
    }
    let specs = build_layer_specs(inputs, &args.blend, &args.opacity, &args.at)?;
    let adjustments = args
        .adjust
        .iter()
        .map(|name| parse_adjustment(name).ok_or_else(|| format!("unknown adjustment '{name}'")))
        .collect::<Result<Vec<_>, _>>()?;

    let codec = ImageCrateCodec {
        jpeg_quality: args.quality.clamp(1, 100),
    };
    let images = specs
        .iter()
        .map(|s| codec.load(&s.path).map_err(|e| format!("load '{}' failed: {e}", s.path.display())))
        .collect::<Result<Vec<_>, _>>()?;

    let doc = build_document(&specs, images, &adjustments, args.width, args.height)?;
    codec
        .save(&args.output, &doc.render(None))
        .map_err(|e| format!("save failed: {e}"))?;
    info!(output = %args.output.display(), layers = doc.layer_count(), "composite written");
    Ok(doc)
}

/// Assemble the layer stack. `images` pairs with `specs` by position.
pub fn build_document(
    specs: &[LayerSpec],
    images: Vec<PixelBuffer>,
    adjustments: &[AdjustmentKind],
    width: Option<u32>,
    height: Option<u32>,
) -> Result<Document, String> {
    let first = images.first().ok_or_else(|| "no input images".to_string())?;
    let width = width.unwrap_or(first.width());
    let height = height.unwrap_or(first.height());
    if width == 0 || height == 0 {
        return Err(format!("invalid canvas size {width}x{height}"));
    }

    let mut doc = Document::empty(width, height);
    for (spec, image) in specs.iter().zip(images) {
        let name = spec
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Layer")
            .to_string();
        let index = doc.add_layer(Layer::from_image(&name, image), -1);
        let configured = doc
            .set_layer_blend_mode(index, spec.blend)
            .and_then(|_| doc.set_layer_opacity(index, spec.opacity))
            .and_then(|_| doc.set_layer_position(index, spec.offset.0, spec.offset.1));
        configured.map_err(|e| format!("layer '{name}': {e}"))?;
        debug!(layer = index, %name, blend = %spec.blend, opacity = spec.opacity, "layer added");
    }
    for kind in adjustments {
        doc.add_layer(Layer::new_adjustment(kind.name(), *kind), -1);
    }
    Ok(doc)
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
pub fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);
        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    warn!(%pattern, "pattern matched no files");
                }
            }
            Err(e) => warn!(%pattern, error = %e, "invalid glob"),
        }
    }

    result
}

/// Pair each input with its blend, opacity and offset. Lists longer than
/// the inputs are an error; shorter ones fall back to defaults.
pub fn build_layer_specs(
    inputs: Vec<PathBuf>,
    blends: &[String],
    opacities: &[f32],
    offsets: &[String],
) -> Result<Vec<LayerSpec>, String> {
    let n = inputs.len();
    for (what, len) in [("--blend", blends.len()), ("--opacity", opacities.len()), ("--at", offsets.len())] {
        if len > n {
            return Err(format!("{what} has {len} values but only {n} input(s)"));
        }
    }

    inputs
        .into_iter()
        .enumerate()
        .map(|(i, path)| {
            let blend = match blends.get(i) {
                Some(name) => BlendMode::from_name(name).ok_or_else(|| format!("unknown blend mode '{name}'"))?,
                None => BlendMode::Normal,
            };
            let opacity = opacities.get(i).copied().unwrap_or(1.0);
            if !(0.0..=1.0).contains(&opacity) {
                return Err(format!("opacity {opacity} is outside 0..1"));
            }
            let offset = match offsets.get(i) {
                Some(s) => parse_offset(s).ok_or_else(|| format!("bad offset '{s}', expected X,Y"))?,
                None => (0, 0),
            };
            Ok(LayerSpec {
                path,
                blend,
                opacity,
                offset,
            })
        })
        .collect()
}

fn parse_offset(s: &str) -> Option<(i32, i32)> {
    let (x, y) = s.split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

/// Match an adjustment by display name, ignoring case and punctuation
/// ("hue/saturation", "HueSaturation", "black & white").
pub fn parse_adjustment(name: &str) -> Option<AdjustmentKind> {
    let key = |s: &str| -> String {
        s.chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect()
    };
    let wanted = key(name);
    AdjustmentKind::all().iter().copied().find(|k| key(k.name()) == wanted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::Rgba;

    fn paths(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("in{i}.png"))).collect()
    }

    #[test]
    fn specs_fill_defaults() {
        let specs = build_layer_specs(paths(3), &["multiply".into(), "Soft Light".into()], &[0.5], &["4,-2".into()]).unwrap();
        assert_eq!(specs[0].blend, BlendMode::Multiply);
        assert_eq!(specs[0].opacity, 0.5);
        assert_eq!(specs[0].offset, (4, -2));
        assert_eq!(specs[1].blend, BlendMode::SoftLight);
        assert_eq!(specs[1].opacity, 1.0);
        assert_eq!(specs[2].blend, BlendMode::Normal);
        assert_eq!(specs[2].offset, (0, 0));
    }

    #[test]
    fn specs_reject_bad_values() {
        assert!(build_layer_specs(paths(1), &["sparkle".into()], &[], &[]).is_err());
        assert!(build_layer_specs(paths(1), &[], &[1.5], &[]).is_err());
        assert!(build_layer_specs(paths(1), &[], &[], &["12".into()]).is_err());
        assert!(build_layer_specs(paths(1), &["normal".into(), "screen".into()], &[], &[]).is_err());
    }

    #[test]
    fn adjustment_names() {
        assert_eq!(parse_adjustment("hue/saturation"), Some(AdjustmentKind::HueSaturation));
        assert_eq!(parse_adjustment("Black & White"), Some(AdjustmentKind::BlackWhite));
        assert_eq!(parse_adjustment("invert"), Some(AdjustmentKind::Invert));
        assert_eq!(parse_adjustment("sharpen"), None);
    }

    #[test]
    fn inputs_deduplicate_and_glob() {
        let dir = std::env::temp_dir().join(format!("layerforge-cli-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["a.png", "b.png", "c.txt"] {
            std::fs::write(dir.join(name), b"x").unwrap();
        }
        let literal = dir.join("a.png").to_string_lossy().into_owned();
        let pattern = dir.join("*.png").to_string_lossy().into_owned();
        let resolved = resolve_inputs(&[literal.clone(), pattern, literal]);
        assert_eq!(resolved, vec![dir.join("a.png"), dir.join("b.png")]);
        assert!(resolve_inputs(&[dir.join("*.gif").to_string_lossy().into_owned()]).is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn document_stacks_inputs() {
        let specs = build_layer_specs(paths(2), &["normal".into(), "multiply".into()], &[1.0, 1.0], &[]).unwrap();
        let images = vec![
            PixelBuffer::filled(4, 4, Rgba::WHITE),
            PixelBuffer::filled(2, 2, Rgba::new(128, 128, 128, 255)),
        ];
        let doc = build_document(&specs, images, &[AdjustmentKind::Invert], None, Some(6)).unwrap();
        assert_eq!((doc.width(), doc.height()), (4, 6));
        assert_eq!(doc.layer_count(), 3);
        assert_eq!(doc.layer(1).unwrap().name(), "in1");

        let out = doc.render(None);
        // White under the multiply patch, then inverted
        assert_eq!(out.get(3, 3), Some(Rgba::new(0, 0, 0, 255)));
        let px = out.get(0, 0).unwrap();
        assert!((px.r() as i32 - 127).abs() <= 1);
    }

    #[test]
    fn document_needs_an_image() {
        assert!(build_document(&[], Vec::new(), &[], None, None).is_err());
    }
}
