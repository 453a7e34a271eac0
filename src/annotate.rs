use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use kornia_image::Image;

use crate::detector::Detection;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: i32 = 2;
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_OFFSET: i32 = 8;

/// Annotation error enum.
#[derive(thiserror::Error, Debug)]
pub enum AnnotateError {
    /// Failed to read the font or write the output file.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Failed to encode the output image.
    #[error(transparent)]
    ImageError(#[from] image::ImageError),

    /// The font file could not be parsed.
    #[error("Invalid font file: {0}")]
    FontError(String),

    /// The pixel buffer does not match the image size.
    #[error("Image buffer of {len} bytes does not fit {width}x{height} rgb8")]
    BufferError {
        /// Buffer length.
        len: usize,
        /// Image width.
        width: usize,
        /// Image height.
        height: usize,
    },
}

/// Draws detection boxes, and captions when a font is available.
#[derive(Default)]
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    /// Annotator that also writes `"{label} {confidence}"` captions.
    pub fn with_font_file(path: impl AsRef<Path>) -> Result<Self, AnnotateError> {
        let data = std::fs::read(path.as_ref())?;
        let font = FontVec::try_from_vec(data)
            .map_err(|e| AnnotateError::FontError(format!("{}: {e}", path.as_ref().display())))?;
        Ok(Self { font: Some(font) })
    }

    /// Copy `image` and draw `detections` on it.
    pub fn annotate(
        &self,
        image: &Image<u8, 3>,
        detections: &[Detection],
    ) -> Result<RgbImage, AnnotateError> {
        let mut canvas = to_rgb_image(image)?;
        for detection in detections {
            self.draw_detection(&mut canvas, detection);
        }
        Ok(canvas)
    }

    fn draw_detection(&self, canvas: &mut RgbImage, detection: &Detection) {
        let color = BOX_COLOR;
        let b = &detection.bbox;
        let x = b.xmin.floor() as i32;
        let y = b.ymin.floor() as i32;
        let w = b.xmax.ceil() as i32 - x;
        let h = b.ymax.ceil() as i32 - y;

        for t in 0..BOX_THICKNESS {
            let (w, h) = (w - 2 * t, h - 2 * t);
            if w <= 0 || h <= 0 {
                break;
            }
            draw_hollow_rect_mut(canvas, Rect::at(x + t, y + t).of_size(w as u32, h as u32), color);
        }
        if w <= 0 || h <= 0 {
            tracing::warn!(label = detection.label, "skipping degenerate box");
            return;
        }

        let Some(font) = &self.font else {
            return;
        };
        let caption = format!("{} {:.2}", detection.label, b.confidence);
        let scale = PxScale::from(LABEL_FONT_SIZE);
        let (_, text_h) = text_size(scale, font, &caption);
        let text_y = (y - LABEL_OFFSET - text_h as i32).max(0);
        draw_text_mut(canvas, color, x.max(0), text_y, scale, font, &caption);
    }
}

/// Copy a kornia rgb8 image into an `image` buffer.
pub fn to_rgb_image(image: &Image<u8, 3>) -> Result<RgbImage, AnnotateError> {
    let (width, height) = (image.width(), image.height());
    RgbImage::from_raw(width as u32, height as u32, image.as_slice().to_vec()).ok_or(
        AnnotateError::BufferError {
            len: image.as_slice().len(),
            width,
            height,
        },
    )
}

/// Write an annotated image, creating parent directories as needed.
pub fn save(image: &RgbImage, path: impl AsRef<Path>) -> Result<(), AnnotateError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    image.save(path)?;
    tracing::info!(path = %path.display(), "saved annotated image");
    Ok(())
}
