use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use argh::FromArgs;
use kornia_io::functional as F;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use assistive_vision::{
    Detection, Detections, Detector, DetectorConfig, ModelSize,
    annotate::{self, Annotator},
    announce::{Announcer, ConsoleVoice, Throttle, ThrottledAnnouncer},
    medicine::{Lookup, MedicineDb},
    scan::PackScanner,
};

#[derive(FromArgs)]
/// Assistive vision: object detection and medicine lookup
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Detect(DetectArgs),
    Medicine(MedicineArgs),
}

#[derive(FromArgs)]
/// detect objects in still images
#[argh(subcommand, name = "detect")]
struct DetectArgs {
    /// paths to input images, processed one after another
    #[argh(positional)]
    images: Vec<PathBuf>,

    /// the size of the model to use: n, s, m, l, x
    #[argh(option, default = "ModelSize::N")]
    size: ModelSize,

    /// the confidence threshold for the model
    #[argh(option, default = "0.5")]
    confidence: f32,

    /// the nms threshold for the model
    #[argh(option, default = "0.45")]
    nms: f32,

    /// longer side of the network input, a multiple of 32
    #[argh(option, default = "640")]
    image_size: usize,

    /// local safetensors weights instead of the hub download
    #[argh(option)]
    weights: Option<PathBuf>,

    /// run on the first CUDA device
    #[argh(switch)]
    cuda: bool,

    /// directory for annotated images
    #[argh(option)]
    output: Option<PathBuf>,

    /// TTF/OTF font used for box captions
    #[argh(option)]
    font: Option<PathBuf>,

    /// print detections as JSON lines instead of text
    #[argh(switch)]
    json: bool,

    /// stream image and boxes to a rerun viewer
    #[argh(switch)]
    show: bool,
}

#[derive(FromArgs)]
/// look up a medicine from a pack photo, a barcode or label text
#[argh(subcommand, name = "medicine")]
struct MedicineArgs {
    /// path to the medicine database
    #[argh(option, default = "PathBuf::from(\"meds.json\")")]
    db: PathBuf,

    /// photo of the medicine pack to scan
    #[argh(option)]
    image: Option<PathBuf>,

    /// barcode value, tried before any decoded from the photo
    #[argh(option)]
    barcode: Option<String>,

    /// label text, used instead of OCR
    #[argh(option)]
    text: Option<String>,

    /// text detection ONNX model for OCR
    #[argh(option)]
    det_model: Option<PathBuf>,

    /// text recognition ONNX model for OCR
    #[argh(option)]
    rec_model: Option<PathBuf>,

    /// character dictionary of the recognition model
    #[argh(option)]
    char_dict: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Args = argh::from_env();
    let mut voice = ThrottledAnnouncer::new(ConsoleVoice, Throttle::default());

    match args.command {
        Command::Detect(args) => detect(args, &mut voice),
        Command::Medicine(args) => medicine(args, &mut voice),
    }
}

fn detect(args: DetectArgs, voice: &mut ThrottledAnnouncer<ConsoleVoice>) -> Result<()> {
    anyhow::ensure!(!args.images.is_empty(), "no input images given");

    let config = DetectorConfig {
        size: args.size,
        confidence_threshold: args.confidence,
        nms_threshold: args.nms,
        image_size: args.image_size,
        use_cpu: !args.cuda,
        weights: args.weights,
    };
    let detector = Detector::new(config).context("failed to create detector")?;

    let annotator = match &args.font {
        Some(path) => Annotator::with_font_file(path)?,
        None => Annotator::default(),
    };

    #[cfg(feature = "rerun")]
    let rec = if args.show {
        Some(rerun::RecordingStreamBuilder::new("Assistive Vision").spawn()?)
    } else {
        None
    };
    #[cfg(not(feature = "rerun"))]
    if args.show {
        tracing::warn!("--show needs the `rerun` feature, ignoring");
    }

    if !args.json {
        voice.say("Object mode");
    }

    for path in &args.images {
        // read the image as RGB8
        let image = F::read_image_any(path)
            .with_context(|| format!("failed to read image {}", path.display()))?;

        let start = Instant::now();
        let detections = detector.detect(&image)?;
        tracing::info!(
            image = %path.display(),
            detections = detections.len(),
            elapsed = ?start.elapsed(),
            "detection done"
        );

        if args.json {
            let line = serde_json::json!({
                "image": path.display().to_string(),
                "width": detections.image_width,
                "height": detections.image_height,
                "detections": detections.iter().collect::<Vec<_>>(),
            });
            println!("{line}");
        } else {
            report(path, &detections, voice);
        }

        if let Some(dir) = &args.output {
            let labelled: Vec<Detection> = detections.iter().collect();
            let canvas = annotator.annotate(&image, &labelled)?;
            annotate::save(&canvas, annotated_path(dir, path))?;
        }

        #[cfg(feature = "rerun")]
        if let Some(rec) = &rec {
            show(rec, &image, &detections)?;
        }
    }

    Ok(())
}

fn report(path: &Path, detections: &Detections, voice: &mut ThrottledAnnouncer<ConsoleVoice>) {
    println!("{}: {} object(s)", path.display(), detections.len());
    for detection in detections.iter() {
        println!("  {detection}");
    }
    match detections.best() {
        Some(best) => voice.say(best.label),
        None => tracing::info!(image = %path.display(), "no objects detected"),
    }
}

fn annotated_path(dir: &Path, image: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    dir.join(format!("{stem}_annotated.png"))
}

#[cfg(feature = "rerun")]
fn show(
    rec: &rerun::RecordingStream,
    image: &kornia_image::Image<u8, 3>,
    detections: &Detections,
) -> Result<()> {
    rec.log(
        "image",
        &rerun::Image::from_elements(
            image.as_slice(),
            image.size().into(),
            rerun::ColorModel::RGB,
        ),
    )?;

    let mut boxes_mins = Vec::new();
    let mut boxes_sizes = Vec::new();
    let mut class_ids = Vec::new();
    let mut labels = Vec::new();
    for detection in detections.iter() {
        let b = detection.bbox;
        boxes_mins.push((b.xmin, b.ymin));
        boxes_sizes.push((b.width(), b.height()));
        class_ids.push(b.class as u16);
        labels.push(format!("{} {:.2}", detection.label, b.confidence));
    }

    rec.log(
        "boxes",
        &rerun::Boxes2D::from_mins_and_sizes(boxes_mins, boxes_sizes)
            .with_class_ids(class_ids)
            .with_labels(labels),
    )?;
    Ok(())
}

fn medicine(args: MedicineArgs, voice: &mut ThrottledAnnouncer<ConsoleVoice>) -> Result<()> {
    let db = MedicineDb::load(&args.db)
        .with_context(|| format!("failed to load medicine database {}", args.db.display()))?;
    tracing::debug!(records = db.len(), "medicine database ready");

    voice.say("Medicine mode");
    let lookup = match &args.image {
        Some(path) => {
            let image = F::read_image_any(path)
                .with_context(|| format!("failed to read image {}", path.display()))?;
            let image = annotate::to_rgb_image(&image)?;
            let scan = pack_scanner(&args)?.scan(
                &image,
                &db,
                args.barcode.as_deref(),
                args.text.as_deref(),
            )?;
            tracing::info!(barcodes = ?scan.barcodes, text = ?scan.text, "scanned pack");
            scan.lookup
        }
        None => db.lookup(args.barcode.as_deref(), args.text.as_deref()),
    };

    match lookup {
        Lookup::UnknownBarcode(code) => {
            tracing::warn!(barcode = %code, "no medicine record matches this barcode")
        }
        Lookup::Nothing => tracing::warn!("nothing to look up, pass --image, --barcode or --text"),
        found => {
            if let Some(message) = found.message() {
                voice.say(&message);
            }
        }
    }
    Ok(())
}

#[cfg(feature = "ocr")]
fn pack_scanner(args: &MedicineArgs) -> Result<PackScanner> {
    use assistive_vision::scan::OcrReader;

    match (&args.det_model, &args.rec_model, &args.char_dict) {
        (Some(det), Some(rec), Some(dict)) => Ok(PackScanner::with_reader(
            OcrReader::new(det, rec, dict).context("failed to load OCR models")?,
        )),
        (None, None, None) => Ok(PackScanner::default()),
        _ => anyhow::bail!("OCR needs --det-model, --rec-model and --char-dict together"),
    }
}

#[cfg(not(feature = "ocr"))]
fn pack_scanner(args: &MedicineArgs) -> Result<PackScanner> {
    if args.det_model.is_some() || args.rec_model.is_some() || args.char_dict.is_some() {
        tracing::warn!("OCR models need the `ocr` feature, reading barcodes only");
    }
    Ok(PackScanner::default())
}
