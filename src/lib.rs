#![deny(missing_docs)]

//! Assistive vision in Rust
//!
//! Runs a pre-trained YOLOv8 detector on still images, announces what it
//! sees and resolves medicine information from a local database.
//!
//! # Examples
//!
//! ```no_run
//! use assistive_vision::{Detector, DetectorConfig};
//!
//! let detector = Detector::new(DetectorConfig::default()).expect("Failed to load YOLOv8");
//!
//! let image = kornia_io::functional::read_image_any("path/to/image.jpg")
//!     .expect("Failed to read image");
//!
//! let detections = detector.detect(&image).expect("Failed to run detection");
//! if let Some(best) = detections.best() {
//!     println!("Most confident: {best}");
//! }
//! ```

/// Drawing detections on images
pub mod annotate;

/// Console announcements with repeat suppression
pub mod announce;

/// Bounding box module with non-maximum suppression
mod bounding_box;

/// COCO class labels
mod classes;

/// YOLOv8 high level interface
mod detector;

/// Local medicine database
pub mod medicine;

/// YOLOv8 model definition in candle
mod model;

/// Barcode decoding and label text reading on medicine packs
pub mod scan;

pub use bounding_box::{BoundingBox, iou, non_maximum_suppression};
pub use classes::{COCO_CLASSES, class_name};
pub use detector::{
    Detection, Detections, Detector, DetectorConfig, DetectorError, ModelSize, network_input_size,
};
