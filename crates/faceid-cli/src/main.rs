use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use faceid_core::pipeline::validate_crop;
use faceid_core::{
    build_gallery, identify, load_analyzer, DirectoryPersist, FrameProcessor, FrameSink, Gallery,
    GalleryBuildOptions, GrowPolicy, MatchAlgorithm, ModelPaths, OnnxAnalyzer, PipelineSettings, RunOptions,
};
use faceid_media::{open_capture, parse_resolution, FrameWriter, OutputTransform};
use image::RgbImage;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "faceid", about = "Identify people in camera or image input against a face gallery")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the person seen in an input and print the majority label
    Run(RunArgs),
    /// Build the gallery and list its identities
    Gallery {
        #[command(flatten)]
        gallery: GalleryArgs,
        #[command(flatten)]
        models: ModelArgs,
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Camera index, /dev/video* device, image file or folder of images
    #[arg(short, long, default_value = "0")]
    input: String,
    /// Read image inputs in a loop
    #[arg(long = "loop")]
    looping: bool,
    /// Annotated output: image file pattern (out/run.jpg) or directory
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Number of frames to store in output; 0 stores all
    #[arg(long, default_value_t = 1000)]
    output_limit: usize,
    /// Maximum output resolution, e.g. 1280x720
    #[arg(long, value_parser = parse_output_resolution)]
    output_resolution: Option<OutputTransform>,
    /// Center-crop every frame to this size; 0 0 disables
    #[arg(long, num_args = 2, value_names = ["WIDTH", "HEIGHT"], allow_negative_numbers = true, default_values_t = [0, 0])]
    crop_size: Vec<i64>,
    /// Stop after this many frames; 0 reads the whole input
    #[arg(long, default_value_t = 0)]
    max_frames: usize,
    /// Matching algorithm: HUNGARIAN or MIN_DIST
    #[arg(long, default_value = "HUNGARIAN")]
    match_algo: MatchAlgorithm,
    /// Allow adding unknown faces to the gallery, saving them to disk
    #[arg(long)]
    allow_grow: bool,
    /// Probability threshold for face detections
    #[arg(long = "t-fd", default_value_t = 0.6)]
    detection_threshold: f32,
    /// Cosine distance threshold for identification
    #[arg(long = "t-id", default_value_t = 0.6)]
    match_threshold: f32,
    /// Scaling ratio for face boxes passed to recognition
    #[arg(long = "exp-r-fd", default_value_t = 1.15)]
    roi_scale: f32,
    /// Faces beyond this count in a frame are dropped
    #[arg(long, default_value_t = 16)]
    max_faces: usize,
    #[command(flatten)]
    gallery: GalleryArgs,
    #[command(flatten)]
    models: ModelArgs,
}

#[derive(Args)]
struct GalleryArgs {
    /// Directory of reference face images
    #[arg(long = "fg", default_value = "dict")]
    gallery_dir: PathBuf,
    /// Detect faces on reference images instead of using whole images
    #[arg(long)]
    run_detector: bool,
}

#[derive(Args)]
struct ModelArgs {
    /// Directory holding det_10g.onnx and w600k_r50.onnx
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// SCRFD detection model (overrides --model-dir)
    #[arg(long)]
    detector_model: Option<PathBuf>,
    /// ArcFace recognition model (overrides --model-dir)
    #[arg(long)]
    recognizer_model: Option<PathBuf>,
}

impl ModelArgs {
    fn paths(&self) -> ModelPaths {
        let mut paths = match &self.model_dir {
            Some(dir) => ModelPaths::in_dir(dir),
            None => ModelPaths::default(),
        };
        if let Some(path) = &self.detector_model {
            paths.detector = path.clone();
        }
        if let Some(path) = &self.recognizer_model {
            paths.recognizer = path.clone();
        }
        paths
    }
}

fn parse_output_resolution(text: &str) -> Result<OutputTransform, String> {
    parse_resolution(text).ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{text}'"))
}

/// Asks on the terminal whether to store an unknown face, and under which name.
struct PromptGrowPolicy<R> {
    reader: R,
    preview: PathBuf,
}

impl PromptGrowPolicy<BufReader<std::io::Stdin>> {
    fn stdin() -> Self {
        Self {
            reader: BufReader::new(std::io::stdin()),
            preview: std::env::temp_dir().join("faceid-unknown-face.png"),
        }
    }
}

impl<R: BufRead> GrowPolicy for PromptGrowPolicy<R> {
    fn ask_to_save(&mut self, face: &RgbImage) -> Option<String> {
        match face.save(&self.preview) {
            Ok(()) => eprintln!("Unknown face detected, preview saved to {}", self.preview.display()),
            Err(err) => eprintln!("Unknown face detected ({}x{}); no preview: {err}", face.width(), face.height()),
        }
        eprint!("Name to save this face under (empty to skip): ");
        let _ = std::io::stderr().flush();

        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()).filter(|name| !name.is_empty()),
        }
    }
}

/// Build the gallery. `prompt` names new faces found on reference images
/// when growth is allowed and the detector runs.
fn load_gallery(
    analyzer: &mut OnnxAnalyzer,
    args: &GalleryArgs,
    match_threshold: f32,
    prompt: Option<&mut dyn GrowPolicy>,
) -> Result<Gallery> {
    let allow_grow = prompt.is_some();
    let options = GalleryBuildOptions { run_detector: args.run_detector, match_threshold, allow_grow };
    let policy = if args.run_detector { prompt } else { None };
    let gallery = build_gallery(&args.gallery_dir, analyzer, &options, policy)
        .with_context(|| format!("failed to build gallery from {}", args.gallery_dir.display()))?;
    Ok(gallery)
}

fn run(args: RunArgs) -> Result<()> {
    let crop = validate_crop(args.crop_size[0], args.crop_size[1])?;
    if !(0.0..=1.0).contains(&args.detection_threshold) {
        bail!("--t-fd must be within [0, 1], got {}", args.detection_threshold);
    }

    let settings = PipelineSettings {
        detection_threshold: args.detection_threshold,
        roi_scale: args.roi_scale,
        match_threshold: args.match_threshold,
        match_algo: args.match_algo,
        max_faces: args.max_faces,
        allow_grow: args.allow_grow,
    };

    tracing::info!(input = %args.input, gallery = %args.gallery.gallery_dir.display(), algorithm = %settings.match_algo, "starting run");
    let mut analyzer = load_analyzer(&args.models.paths(), &settings).context("failed to load models")?;
    // Enrollment and runtime share one buffered stdin reader.
    let mut prompt = settings.allow_grow.then(PromptGrowPolicy::stdin);
    let mut gallery = load_gallery(
        &mut analyzer,
        &args.gallery,
        settings.match_threshold,
        prompt.as_mut().map(|p| p as &mut dyn GrowPolicy),
    )?;
    if settings.allow_grow {
        gallery = gallery.with_persist(DirectoryPersist::new(&args.gallery.gallery_dir));
    }

    let mut processor = FrameProcessor::new(analyzer, Arc::new(gallery), &settings);
    if let Some(prompt) = prompt {
        processor = processor.with_grow_policy(prompt);
    }

    let mut capture = open_capture(&args.input, args.looping).with_context(|| format!("can't open input {}", args.input))?;
    let mut writer = args
        .output
        .as_deref()
        .map(|output| FrameWriter::new(output, args.output_limit, args.output_resolution))
        .transpose()?;

    let options = RunOptions { crop, max_frames: Some(args.max_frames) };
    let sink = writer.as_mut().map(|w| w as &mut dyn FrameSink);
    let label = identify(&mut capture, &mut processor, sink, &options)?;

    println!("Person Identified: {label}");
    Ok(())
}

fn list_gallery(gallery_args: &GalleryArgs, models: &ModelArgs, json: bool) -> Result<()> {
    let settings = PipelineSettings::default();
    let mut analyzer = load_analyzer(&models.paths(), &settings).context("failed to load models")?;
    let gallery = load_gallery(&mut analyzer, gallery_args, settings.match_threshold, None)?;

    let listing: Vec<(String, usize)> = gallery
        .labels()
        .into_iter()
        .map(|label| {
            let samples = gallery.lookup(&label).len();
            (label, samples)
        })
        .collect();

    if json {
        let entries: Vec<serde_json::Value> = listing
            .iter()
            .map(|(label, samples)| serde_json::json!({ "label": label, "samples": samples }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if listing.is_empty() {
        println!("No identities in {}", gallery_args.gallery_dir.display());
    } else {
        for (label, samples) in &listing {
            println!("{label:<24} {samples} sample(s)");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Gallery { gallery, models, json } => list_gallery(&gallery, &models, json),
    }
}
