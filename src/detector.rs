use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Module, VarBuilder};
use kornia_image::{Image, ImageSize};
use serde::Serialize;

use super::{
    bounding_box::{BoundingBox, non_maximum_suppression},
    classes::{COCO_CLASSES, class_name},
    model::{Multiples, YoloV8},
};

/// Hugging Face hub repository holding the converted YOLOv8 weights.
const WEIGHTS_REPO: &str = "lmz/candle-yolo-v8";

/// Detector error enum.
#[derive(thiserror::Error, Debug)]
pub enum DetectorError {
    /// Failed to load the model weights or pick the device.
    #[error("Failed to load YOLOv8 model: {0}")]
    LoadModelError(String),

    /// Rejected configuration value.
    #[error("Invalid detector configuration: {0}")]
    ConfigError(String),

    /// The input image cannot be processed.
    #[error("Invalid input image: {0}")]
    InputError(String),

    /// Internal candle error.
    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    /// Kornia image error.
    #[error(transparent)]
    KorniaImageError(#[from] kornia_image::ImageError),

    /// Hugging Face API error.
    #[error(transparent)]
    ApiError(#[from] hf_hub::api::sync::ApiError),
}

/// YOLOv8 model size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelSize {
    /// Nano.
    #[default]
    N,
    /// Small.
    S,
    /// Medium.
    M,
    /// Large.
    L,
    /// Extra large.
    X,
}

impl ModelSize {
    fn multiples(self) -> Multiples {
        match self {
            ModelSize::N => Multiples::n(),
            ModelSize::S => Multiples::s(),
            ModelSize::M => Multiples::m(),
            ModelSize::L => Multiples::l(),
            ModelSize::X => Multiples::x(),
        }
    }
}

impl FromStr for ModelSize {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "n" => ModelSize::N,
            "s" => ModelSize::S,
            "m" => ModelSize::M,
            "l" => ModelSize::L,
            "x" => ModelSize::X,
            _ => return Err(DetectorError::ConfigError(format!("invalid size: {s}"))),
        })
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ModelSize::N => "n",
                ModelSize::S => "s",
                ModelSize::M => "m",
                ModelSize::L => "l",
                ModelSize::X => "x",
            }
        )
    }
}

/// Detector configuration.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// The size of the model to use: n, s, m, l, x
    pub size: ModelSize,
    /// Minimum class score for a prediction to be kept
    pub confidence_threshold: f32,
    /// IoU above which overlapping boxes of one class are suppressed
    pub nms_threshold: f32,
    /// Length of the longer input side fed to the network, a multiple of 32
    pub image_size: usize,
    /// Whether to use the CPU or the first CUDA device
    pub use_cpu: bool,
    /// Local safetensors weights; downloaded from the hub when unset
    pub weights: Option<PathBuf>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            size: ModelSize::N,
            confidence_threshold: 0.5,
            nms_threshold: 0.45,
            image_size: 640,
            use_cpu: true,
            weights: None,
        }
    }
}

impl DetectorConfig {
    /// Check thresholds and the network input size.
    pub fn validate(&self) -> Result<(), DetectorError> {
        for (name, value) in [
            ("confidence threshold", self.confidence_threshold),
            ("nms threshold", self.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DetectorError::ConfigError(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.image_size == 0 || self.image_size % 32 != 0 {
            return Err(DetectorError::ConfigError(format!(
                "image size must be a positive multiple of 32, got {}",
                self.image_size
            )));
        }
        Ok(())
    }
}

/// A kept box together with its class label.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Detection {
    /// Human readable class label.
    pub label: &'static str,
    /// Box, score and class index.
    #[serde(flatten)]
    pub bbox: BoundingBox,
}

impl From<BoundingBox> for Detection {
    fn from(bbox: BoundingBox) -> Self {
        Self {
            label: class_name(bbox.class).unwrap_or("unknown"),
            bbox,
        }
    }
}

impl std::fmt::Display for Detection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = &self.bbox;
        write!(
            f,
            "{} {:.2} [{:.0}, {:.0}, {:.0}, {:.0}]",
            self.label, b.confidence, b.xmin, b.ymin, b.xmax, b.ymax
        )
    }
}

/// Result of running the detector on one image.
#[derive(Debug, Clone, Serialize)]
pub struct Detections {
    /// Kept boxes, grouped by class and sorted by confidence within a class.
    pub boxes: Vec<BoundingBox>,
    /// Width of the source image.
    pub image_width: usize,
    /// Height of the source image.
    pub image_height: usize,
}

impl Detections {
    /// Number of kept boxes.
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    /// Whether nothing was detected.
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// The most confident detection over all classes.
    pub fn best(&self) -> Option<Detection> {
        self.boxes
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .map(|b| Detection::from(*b))
    }

    /// Labelled view of the kept boxes.
    pub fn iter(&self) -> impl Iterator<Item = Detection> + '_ {
        self.boxes.iter().map(|b| Detection::from(*b))
    }
}

/// YOLOv8 object detector.
pub struct Detector {
    config: DetectorConfig,
    device: Device,
    model: YoloV8,
}

impl Detector {
    /// Pick the device and load the weights described by `config`.
    pub fn new(config: DetectorConfig) -> Result<Self, DetectorError> {
        config.validate()?;
        let device = if config.use_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available(0)
                .map_err(|e| DetectorError::LoadModelError(format!("cuda:0 error: {e}")))?
        };
        let vb = Self::load_weights(&config, &device)?;
        Self::from_var_builder(config, vb, device)
    }

    /// Build the network from already resolved weights.
    pub(crate) fn from_var_builder(
        config: DetectorConfig,
        vb: VarBuilder,
        device: Device,
    ) -> Result<Self, DetectorError> {
        config.validate()?;
        let model = YoloV8::load(vb, config.size.multiples(), COCO_CLASSES.len())?;
        Ok(Self {
            config,
            device,
            model,
        })
    }

    /// The configuration the detector was built with.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detect objects in an rgb8 image.
    pub fn detect(&self, image: &Image<u8, 3>) -> Result<Detections, DetectorError> {
        let start = Instant::now();
        let (image_t, w_ratio, h_ratio) = self.preprocess_image(image)?;
        tracing::debug!(dims = ?image_t.dims(), elapsed = ?start.elapsed(), "preprocessed");

        let start = Instant::now();
        let pred = self.model.forward(&image_t)?.squeeze(0)?;
        tracing::debug!(elapsed = ?start.elapsed(), "forward");

        let rows = pred.t()?.to_vec2::<f32>()?;
        let boxes = decode_predictions(
            &rows,
            (w_ratio, h_ratio),
            (image.width() as f32, image.height() as f32),
            self.config.confidence_threshold,
            self.config.nms_threshold,
        );
        tracing::debug!(candidates = rows.len(), kept = boxes.len(), "postprocessed");

        Ok(Detections {
            boxes,
            image_width: image.width(),
            image_height: image.height(),
        })
    }

    fn preprocess_image(&self, image: &Image<u8, 3>) -> Result<(Tensor, f32, f32), DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::InputError(format!(
                "empty image {}x{}",
                image.width(),
                image.height()
            )));
        }

        let (width, height) = network_input_size(image.width(), image.height(), self.config.image_size);
        let w_ratio = image.width() as f32 / width as f32;
        let h_ratio = image.height() as f32 / height as f32;

        let mut image_resized = Image::from_size_val(ImageSize { width, height }, 0)?;
        kornia_imgproc::resize::resize_fast(
            image,
            &mut image_resized,
            kornia_imgproc::interpolation::InterpolationMode::Nearest,
        )?;

        let image_resized = image_resized.map(|&x| x as f32 / 255.0);

        let image_t =
            Tensor::from_vec::<_, f32>(image_resized.into_vec(), (height, width, 3), &self.device)?
                .permute((2, 0, 1))?
                .unsqueeze(0)?;

        Ok((image_t, w_ratio, h_ratio))
    }

    fn load_weights<'a>(
        config: &DetectorConfig,
        device: &Device,
    ) -> Result<VarBuilder<'a>, DetectorError> {
        let model_path = match &config.weights {
            Some(path) if !path.exists() => {
                return Err(DetectorError::LoadModelError(format!(
                    "weights file not found: {}",
                    path.display()
                )));
            }
            Some(path) => path.clone(),
            // cached by hf-hub after the first download
            None => hf_hub::api::sync::Api::new()?
                .model(WEIGHTS_REPO.to_string())
                .get(&format!("yolov8{}.safetensors", config.size))?,
        };
        tracing::info!(size = %config.size, path = %model_path.display(), "loading YOLOv8 weights");

        Ok(unsafe { VarBuilder::from_mmaped_safetensors(&[model_path], DType::F32, device)? })
    }
}

/// Network input size keeping the aspect ratio: the longer side becomes
/// `image_size`, the shorter one is rounded down to a multiple of 32.
pub fn network_input_size(width: usize, height: usize, image_size: usize) -> (usize, usize) {
    let shorter = |num: usize, den: usize| (num * image_size / den / 32 * 32).max(32);
    if width < height {
        (shorter(width, height), image_size)
    } else {
        (image_size, shorter(height, width))
    }
}

/// Turn raw rows of `[cx, cy, w, h, class scores..]` into boxes in source
/// image coordinates, then run per-class NMS.
fn decode_predictions(
    rows: &[Vec<f32>],
    (w_ratio, h_ratio): (f32, f32),
    (image_width, image_height): (f32, f32),
    confidence_threshold: f32,
    nms_threshold: f32,
) -> Vec<BoundingBox> {
    let nclasses = rows.first().map_or(0, |r| r.len().saturating_sub(4));
    let mut bboxes: Vec<Vec<BoundingBox>> = (0..nclasses).map(|_| Vec::new()).collect();
    for pred in rows {
        let best = pred
            .get(4..)
            .unwrap_or_default()
            .iter()
            .enumerate()
            .filter(|(_, x)| !x.is_nan())
            .max_by(|(_, x), (_, y)| x.total_cmp(y));
        let Some((class_index, &confidence)) = best else {
            continue;
        };
        if !(confidence > confidence_threshold && confidence > 0.) {
            continue;
        }
        let bbox = BoundingBox {
            xmin: (pred[0] - pred[2] / 2.0) * w_ratio,
            ymin: (pred[1] - pred[3] / 2.0) * h_ratio,
            xmax: (pred[0] + pred[2] / 2.0) * w_ratio,
            ymax: (pred[1] + pred[3] / 2.0) * h_ratio,
            confidence,
            class: class_index as u32,
        }
        .clamp(image_width, image_height);
        if bbox.area() <= 0. {
            continue;
        }
        bboxes[class_index].push(bbox);
    }

    non_maximum_suppression(&mut bboxes, nms_threshold);

    bboxes.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cx: f32, cy: f32, w: f32, h: f32, scores: &[f32]) -> Vec<f32> {
        let mut r = vec![cx, cy, w, h];
        r.extend_from_slice(scores);
        r
    }

    #[test]
    fn test_network_input_size() {
        assert_eq!(network_input_size(1280, 720, 640), (640, 352));
        assert_eq!(network_input_size(720, 1280, 640), (352, 640));
        assert_eq!(network_input_size(500, 500, 320), (320, 320));
        assert_eq!(network_input_size(4000, 10, 640), (640, 32));
    }

    #[test]
    fn test_model_size_parse() -> Result<(), DetectorError> {
        assert_eq!("m".parse::<ModelSize>()?, ModelSize::M);
        assert_eq!("X".parse::<ModelSize>()?, ModelSize::X);
        assert!("q".parse::<ModelSize>().is_err());
        assert_eq!(ModelSize::L.to_string(), "l");
        Ok(())
    }

    #[test]
    fn test_config_validation() {
        assert!(DetectorConfig::default().validate().is_ok());

        let config = DetectorConfig {
            confidence_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DetectorError::ConfigError(_))));

        let config = DetectorConfig {
            image_size: 600,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DetectorError::ConfigError(_))));
    }

    #[test]
    fn test_missing_weights_file() {
        let config = DetectorConfig {
            weights: Some(PathBuf::from("does/not/exist.safetensors")),
            ..Default::default()
        };
        assert!(matches!(
            Detector::new(config),
            Err(DetectorError::LoadModelError(_))
        ));
    }

    #[test]
    fn test_decode_predictions() {
        let rows = vec![
            // class 1, scaled by 2 in both directions
            row(50., 50., 20., 20., &[0.1, 0.9, 0.0]),
            // overlaps the first one, same class, lower score
            row(51., 51., 20., 20., &[0.0, 0.7, 0.0]),
            // below threshold
            row(10., 10., 4., 4., &[0.2, 0.1, 0.3]),
            // class 2, partly outside the frame
            row(5., 5., 20., 20., &[0.0, 0.0, 0.6]),
            // NaN score is never above the threshold
            row(70., 70., 4., 4., &[f32::NAN, 0.1, 0.0]),
            // collapses to zero area once clamped to the frame
            row(-20., 50., 10., 10., &[0.95, 0.0, 0.0]),
        ];

        let boxes = decode_predictions(&rows, (2., 2.), (200., 200.), 0.5, 0.45);

        assert_eq!(boxes.len(), 2);
        let b = boxes[0];
        assert_eq!(b.class, 1);
        assert_eq!((b.xmin, b.ymin, b.xmax, b.ymax), (80., 80., 120., 120.));
        assert_eq!(b.confidence, 0.9);

        let b = boxes[1];
        assert_eq!(b.class, 2);
        assert_eq!((b.xmin, b.ymin), (0., 0.));
        assert_eq!((b.xmax, b.ymax), (30., 30.));
    }

    #[test]
    fn test_best_detection() {
        let detections = Detections {
            boxes: vec![
                BoundingBox {
                    xmin: 0.,
                    ymin: 0.,
                    xmax: 1.,
                    ymax: 1.,
                    confidence: 0.6,
                    class: 0,
                },
                BoundingBox {
                    xmin: 0.,
                    ymin: 0.,
                    xmax: 1.,
                    ymax: 1.,
                    confidence: 0.8,
                    class: 16,
                },
            ],
            image_width: 1,
            image_height: 1,
        };

        let best = detections.best().map(|d| d.label);
        assert_eq!(best, Some("dog"));
        assert_eq!(detections.iter().count(), 2);
        assert!(Detections { boxes: vec![], ..detections }.best().is_none());
    }

    #[test]
    fn test_detect_offline() -> Result<(), Box<dyn std::error::Error>> {
        let config = DetectorConfig {
            image_size: 320,
            confidence_threshold: 0.5,
            ..Default::default()
        };
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let detector = Detector::from_var_builder(config, vb, Device::Cpu)?;

        let image = Image::<u8, 3>::from_size_val(
            ImageSize {
                width: 320,
                height: 200,
            },
            127,
        )?;
        let detections = detector.detect(&image)?;

        assert_eq!((detections.image_width, detections.image_height), (320, 200));
        // zero weights score every class at sigmoid(0) = 0.5
        assert!(detections.is_empty());
        assert!(detections.best().is_none());
        Ok(())
    }

    #[test]
    #[ignore = "downloads weights from the Hugging Face hub"]
    fn test_detector_inference() -> Result<(), Box<dyn std::error::Error>> {
        let detector = Detector::new(DetectorConfig {
            confidence_threshold: 0.25,
            ..Default::default()
        })?;
        let image = Image::<u8, 3>::from_size_val(
            ImageSize {
                width: 320,
                height: 240,
            },
            127,
        )?;
        let detections = detector.detect(&image)?;
        assert_eq!((detections.image_width, detections.image_height), (320, 240));
        Ok(())
    }
}
