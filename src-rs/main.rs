use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use task_guide::detection::{object_prompt, select_best_box, CommandDetector, ObjectLocalizer};
use task_guide::geometry::ViewTransform;
use task_guide::orchestrator::{Resolution, Resolver, Thresholds};
use task_guide::overlay::write_detection_overlay;
use task_guide::parser::{InstructionParser, VisionLanguageModel};
use task_guide::session::SessionContext;
use task_guide::store::{InstructionStore, JsonFileBackend};
use task_guide::telemetry::init_telemetry;
use task_guide::util::{abs_path, round_to, timestamp_iso};
use task_guide::vlm::backend_from_settings;
use task_guide::GuideConfig;

#[derive(Parser, Debug)]
#[command(
    name = "task-guide",
    version,
    about = "Resolve step-by-step task instructions into a target object location and hand action"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// JSON config file (defaults apply for missing fields)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Instruction file, one instruction per line
    #[arg(long, global = true)]
    instructions: Option<PathBuf>,
    /// Instruction store JSON document
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// Write detection overlays into this directory
    #[arg(long = "overlay-dir", global = true)]
    overlay_dir: Option<PathBuf>,
    /// Log level when RUST_LOG is unset
    #[arg(long = "log-level", global = true, default_value = "info")]
    log_level: String,
    /// Emit logs as JSON lines on stderr
    #[arg(long = "log-json", global = true, action = ArgAction::SetTrue)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Print the loaded instructions with their ordinals
    Instructions,
    /// Parse, validate, commit and localize one instruction against an image
    Resolve(ResolveArgs),
    /// Resolve requests read as JSON lines from stdin within one session
    Session(SessionArgs),
    /// Run a single detector pass and report the boxes and the selected one
    Detect(DetectArgs),
    /// Two-pass detect -> crop -> detect localization for a prompt
    Locate(LocateArgs),
    /// Inspect or clear the instruction store
    Store(StoreArgs),
}

#[derive(Args, Debug)]
struct ViewArgs {
    /// Display width for the image-to-view transform
    #[arg(long = "view-width", requires = "view_height")]
    view_width: Option<f64>,
    /// Display height for the image-to-view transform
    #[arg(long = "view-height", requires = "view_width")]
    view_height: Option<f64>,
}

#[derive(Args, Debug)]
struct ResolveArgs {
    /// Camera frame
    #[arg(long)]
    image: PathBuf,
    /// Zero-based instruction index
    #[arg(long)]
    ordinal: usize,
    /// Replace the stored entry for this ordinal instead of appending to it
    #[arg(long = "update-mode", action = ArgAction::SetTrue)]
    update_mode: bool,
    #[command(flatten)]
    view: ViewArgs,
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// First commit per ordinal replaces its stored entry
    #[arg(long = "update-mode", action = ArgAction::SetTrue)]
    update_mode: bool,
    #[command(flatten)]
    view: ViewArgs,
}

#[derive(Args, Debug)]
struct DetectArgs {
    #[arg(long)]
    image: PathBuf,
    /// Object phrase(s); repeat to join several with " . "
    #[arg(long, required = true)]
    prompt: Vec<String>,
    /// Confidence threshold (defaults to the configured crop threshold)
    #[arg(long)]
    threshold: Option<f64>,
    /// Write an overlay PNG of this pass
    #[arg(long)]
    overlay: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct LocateArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: String,
    /// Keep the intermediate crop instead of deleting it
    #[arg(long = "keep-crop", action = ArgAction::SetTrue)]
    keep_crop: bool,
    #[command(flatten)]
    view: ViewArgs,
}

#[derive(Args, Debug)]
struct StoreArgs {
    #[command(subcommand)]
    action: StoreAction,
}

#[derive(Subcommand, Debug)]
enum StoreAction {
    /// Print every stored entry
    Show,
    /// Remove every stored entry
    Reset,
}

#[derive(Debug, Deserialize)]
struct SessionRequest {
    ordinal: usize,
    image: PathBuf,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli.global.log_level, cli.global.log_json);

    match cli.command {
        Commands::Commands => print_commands(),
        Commands::Instructions => command_instructions(&cli.global),
        Commands::Resolve(args) => command_resolve(&cli.global, args),
        Commands::Session(args) => command_session(&cli.global, args),
        Commands::Detect(args) => command_detect(&cli.global, args),
        Commands::Locate(args) => command_locate(&cli.global, args),
        Commands::Store(args) => command_store(&cli.global, args),
    }
}

fn command_rows() -> Vec<Value> {
    vec![
        json!({
            "name": "instructions",
            "description": "List loaded instructions by ordinal."
        }),
        json!({
            "name": "resolve",
            "description": "Resolve one instruction against an image into object, action and center."
        }),
        json!({
            "name": "session",
            "description": "Resolve JSON-line requests from stdin with one shared session."
        }),
        json!({
            "name": "detect",
            "description": "Run one detector pass and report boxes plus the selected box."
        }),
        json!({
            "name": "locate",
            "description": "Two-pass detect, crop, detect localization for a prompt."
        }),
        json!({
            "name": "store",
            "description": "Show or reset the instruction store."
        }),
    ]
}

fn print_commands() -> Result<()> {
    print_json(&json!({ "commands": command_rows() }))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(global: &GlobalArgs) -> Result<GuideConfig> {
    let mut config = GuideConfig::load(global.config.as_deref())?;
    if let Some(path) = &global.instructions {
        config.instructions_path = path.clone();
    }
    if let Some(path) = &global.store {
        config.store_path = path.clone();
    }
    if let Some(dir) = &global.overlay_dir {
        config.overlay_dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

fn open_store(config: &GuideConfig) -> Result<InstructionStore<JsonFileBackend>> {
    let store = InstructionStore::open(
        JsonFileBackend::new(&config.store_path),
        config.vocabulary()?,
    )
    .with_context(|| format!("failed to open store {}", config.store_path.display()))?;
    Ok(store)
}

fn build_localizer(config: &GuideConfig) -> Result<ObjectLocalizer<CommandDetector>> {
    let detector = CommandDetector::new(&config.detector)?;
    Ok(ObjectLocalizer::new(
        detector,
        &config.artifact_dir,
        config.overlay_dir.clone(),
    ))
}

fn build_resolver(
    config: &GuideConfig,
) -> Result<Resolver<Box<dyn VisionLanguageModel>, CommandDetector>> {
    let model = backend_from_settings(&config.parser).context("parser backend unavailable")?;
    let parser = InstructionParser::new(model, config.vocabulary()?, config.parse_attempts);
    Ok(Resolver::new(
        parser,
        build_localizer(config)?,
        Thresholds {
            crop: config.crop_threshold,
            final_pass: config.final_threshold,
        },
        config.crop_rounds,
    ))
}

fn ensure_image(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!("image file does not exist: {}", path.display());
    }
    Ok(())
}

fn view_transform(view: &ViewArgs, image: &Path) -> Result<Option<ViewTransform>> {
    let (Some(view_width), Some(view_height)) = (view.view_width, view.view_height) else {
        return Ok(None);
    };
    if view_width <= 0.0 || view_height <= 0.0 {
        bail!("view dimensions must be positive");
    }
    let (w, h) = image::image_dimensions(image)
        .with_context(|| format!("failed to read image size: {}", image.display()))?;
    Ok(Some(ViewTransform {
        image_width: f64::from(w),
        image_height: f64::from(h),
        view_width,
        view_height,
    }))
}

fn resolution_json(
    resolution: &Resolution,
    instruction: &str,
    image: &Path,
    transform: Option<&ViewTransform>,
) -> Result<Value> {
    let mut payload = serde_json::to_value(resolution)?;
    if let Value::Object(map) = &mut payload {
        map.insert("instruction".to_string(), json!(instruction));
        map.insert("image".to_string(), json!(abs_path(image)));
        map.insert("resolved_at".to_string(), json!(timestamp_iso()));
        if let Some(transform) = transform {
            let view_center = resolution.center.map(|c| transform.to_view(c));
            map.insert("view_center".to_string(), serde_json::to_value(view_center)?);
        }
    }
    Ok(payload)
}

fn command_instructions(global: &GlobalArgs) -> Result<()> {
    let config = load_config(global)?;
    let session = SessionContext::load(&config.instructions_path, false)?;
    let rows: Vec<Value> = session
        .instructions()
        .iter()
        .enumerate()
        .map(|(ordinal, text)| json!({ "ordinal": ordinal, "instruction": text }))
        .collect();
    print_json(&json!({
        "path": abs_path(&config.instructions_path),
        "count": rows.len(),
        "instructions": rows,
    }))
}

fn command_resolve(global: &GlobalArgs, args: ResolveArgs) -> Result<()> {
    let config = load_config(global)?;
    ensure_image(&args.image)?;
    let session = SessionContext::load(&config.instructions_path, args.update_mode)?;
    let mut store = open_store(&config)?;
    let resolver = build_resolver(&config)?;
    let transform = view_transform(&args.view, &args.image)?;

    let resolution = resolver
        .resolve(&mut store, &session, args.ordinal, &args.image)
        .with_context(|| format!("failed to resolve instruction {}", args.ordinal))?;
    let instruction = session.require_instruction(args.ordinal)?;
    print_json(&resolution_json(
        &resolution,
        instruction,
        &args.image,
        transform.as_ref(),
    )?)
}

fn command_session(global: &GlobalArgs, args: SessionArgs) -> Result<()> {
    let config = load_config(global)?;
    let session = SessionContext::load(&config.instructions_path, args.update_mode)?;
    let mut store = open_store(&config)?;
    let resolver = build_resolver(&config)?;
    info!(
        instructions = session.instructions().len(),
        update_mode = session.update_mode,
        "session started"
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let payload = match serve_request(&resolver, &mut store, &session, &args.view, &line) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "request failed");
                json!({ "ok": false, "error": format!("{err:#}") })
            }
        };
        writeln!(stdout, "{}", serde_json::to_string(&payload)?)?;
        stdout.flush()?;
    }
    Ok(())
}

fn serve_request(
    resolver: &Resolver<Box<dyn VisionLanguageModel>, CommandDetector>,
    store: &mut InstructionStore<JsonFileBackend>,
    session: &SessionContext,
    view: &ViewArgs,
    line: &str,
) -> Result<Value> {
    let request: SessionRequest =
        serde_json::from_str(line).context("request must be {\"ordinal\": n, \"image\": path}")?;
    ensure_image(&request.image)?;
    let transform = view_transform(view, &request.image)?;
    let resolution = resolver.resolve(store, session, request.ordinal, &request.image)?;
    let instruction = session.require_instruction(request.ordinal)?;
    let mut payload = resolution_json(&resolution, instruction, &request.image, transform.as_ref())?;
    if let Value::Object(map) = &mut payload {
        map.insert("ok".to_string(), json!(true));
    }
    Ok(payload)
}

fn command_detect(global: &GlobalArgs, args: DetectArgs) -> Result<()> {
    let config = load_config(global)?;
    ensure_image(&args.image)?;
    let threshold = args.threshold.unwrap_or(config.crop_threshold);
    if !(0.0..=1.0).contains(&threshold) {
        bail!("threshold must be within [0, 1], got {threshold}");
    }
    let prompt = object_prompt(&args.prompt);
    if prompt.is_empty() {
        bail!("prompt is empty");
    }

    let localizer = build_localizer(&config)?;
    let pass = localizer.detect(&args.image, &prompt, threshold)?;
    let best = select_best_box(&pass.boxes);
    if let Some(out) = &args.overlay {
        write_detection_overlay(&pass, best, out)
            .with_context(|| format!("failed to write overlay {}", out.display()))?;
    }

    print_json(&json!({
        "image": abs_path(&args.image),
        "prompt": prompt,
        "threshold": threshold,
        "width": pass.width,
        "height": pass.height,
        "count": pass.len(),
        "boxes": pass.boxes,
        "best": best,
        "region": pass.region(),
        "overlay": args.overlay.as_deref().map(abs_path),
    }))
}

fn command_locate(global: &GlobalArgs, args: LocateArgs) -> Result<()> {
    let config = load_config(global)?;
    ensure_image(&args.image)?;
    let transform = view_transform(&args.view, &args.image)?;
    let localizer = build_localizer(&config)?;

    let Some(localization) = localizer.localize_with_crop(
        &args.image,
        &args.prompt,
        config.crop_threshold,
        config.final_threshold,
    )?
    else {
        return print_json(&json!({
            "image": abs_path(&args.image),
            "prompt": args.prompt,
            "center": Value::Null,
        }));
    };

    let center = localization.center();
    let view_center = transform.map(|t| t.to_view(center));
    let crop_window = localization.crop.window();
    let kept_crop = args.keep_crop.then(|| localization.crop.keep());
    print_json(&json!({
        "image": abs_path(&args.image),
        "prompt": args.prompt,
        "center": center,
        "view_center": view_center,
        "crop_origin": localization.crop_origin,
        "crop_size": [crop_window.w, crop_window.h],
        "local_center": localization.local_center,
        "best": {
            "phrase": localization.best.phrase,
            "confidence": round_to(localization.best.confidence, 4),
        },
        "crop": kept_crop.as_deref().map(abs_path),
    }))
}

fn command_store(global: &GlobalArgs, args: StoreArgs) -> Result<()> {
    let config = load_config(global)?;
    let mut store = open_store(&config)?;
    match args.action {
        StoreAction::Show => print_json(&json!({
            "path": abs_path(&config.store_path),
            "count": store.entries().len(),
            "entries": store.entries(),
        })),
        StoreAction::Reset => {
            let removed = store.entries().len();
            store.reset()?;
            print_json(&json!({
                "path": abs_path(&config.store_path),
                "removed": removed,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use task_guide::geometry::Point;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn command_rows_match_subcommands() {
        let cmd = Cli::command();
        for row in command_rows() {
            let name = row["name"].as_str().unwrap();
            assert!(
                cmd.find_subcommand(name).is_some(),
                "missing subcommand {name}"
            );
        }
    }

    #[test]
    fn resolve_flags_parse() {
        let cli = Cli::try_parse_from([
            "task-guide",
            "--store",
            "s.json",
            "resolve",
            "--image",
            "frame.png",
            "--ordinal",
            "2",
            "--update-mode",
            "--view-width",
            "1920",
            "--view-height",
            "1080",
        ])
        .unwrap();
        assert_eq!(cli.global.store, Some(PathBuf::from("s.json")));
        match cli.command {
            Commands::Resolve(args) => {
                assert_eq!(args.ordinal, 2);
                assert!(args.update_mode);
                assert_eq!(args.view.view_width, Some(1920.0));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn view_width_requires_height() {
        assert!(Cli::try_parse_from([
            "task-guide",
            "locate",
            "--image",
            "frame.png",
            "--prompt",
            "knob",
            "--view-width",
            "100",
        ])
        .is_err());
    }

    #[test]
    fn resolution_payload_carries_view_center() {
        let resolution = Resolution {
            ordinal: 0,
            object: "blue switch".to_string(),
            action: "press".to_string(),
            center: Some(Point::new(50.0, 25.0)),
        };
        let transform = ViewTransform {
            image_width: 200.0,
            image_height: 100.0,
            view_width: 400.0,
            view_height: 200.0,
        };
        let payload = resolution_json(
            &resolution,
            "Press the blue switch",
            Path::new("frame.png"),
            Some(&transform),
        )
        .unwrap();
        assert_eq!(payload["center"], json!([50.0, 25.0]));
        assert_eq!(payload["view_center"], json!([100.0, 150.0]));
        assert_eq!(payload["action"], "press");
        assert_eq!(payload["instruction"], "Press the blue switch");
    }

    #[test]
    fn missing_center_serializes_as_null() {
        let resolution = Resolution {
            ordinal: 1,
            object: "red cup".to_string(),
            action: "pick-up".to_string(),
            center: None,
        };
        let payload = resolution_json(&resolution, "Pick up", Path::new("f.png"), None).unwrap();
        assert!(payload["center"].is_null());
        assert!(payload.get("view_center").is_none());
    }
}
