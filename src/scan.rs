use image::{RgbImage, imageops};

use crate::medicine::{Lookup, MedicineDb};

/// Share of the image height kept by the centre crop handed to OCR.
const CROP_HEIGHT_FRACTION: f32 = 0.6;
/// Share of the image width kept by the centre crop handed to OCR.
const CROP_WIDTH_FRACTION: f32 = 0.9;

/// Pack scanning error enum.
#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    /// The OCR engine failed to load or to read the crop.
    #[error("OCR failed: {0}")]
    OcrError(String),
}

/// Reads the text printed in an image.
pub trait TextReader {
    /// All recognised text, joined into one line.
    fn read_text(&self, image: &RgbImage) -> Result<String, ScanError>;
}

/// Pixel region of the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width.
    pub width: u32,
    /// Height.
    pub height: u32,
}

/// Centred region covering 90% of the width and 60% of the height.
pub fn centre_region(width: u32, height: u32) -> Region {
    let crop_w = (width as f32 * CROP_WIDTH_FRACTION) as u32;
    let crop_h = (height as f32 * CROP_HEIGHT_FRACTION) as u32;
    Region {
        x: (width - crop_w) / 2,
        y: (height - crop_h) / 2,
        width: crop_w,
        height: crop_h,
    }
}

/// Decode every 1D/2D barcode rxing finds in the image.
pub fn decode_barcodes(image: &RgbImage) -> Vec<String> {
    let luma = imageops::grayscale(image);
    let (width, height) = luma.dimensions();
    match rxing::helpers::detect_multiple_in_luma(luma.into_raw(), width, height) {
        Ok(results) => results.iter().map(|r| r.getText().to_string()).collect(),
        Err(e) => {
            tracing::debug!(error = %e, "no barcode found");
            Vec::new()
        }
    }
}

/// What a pack scan found and what it resolved to.
#[derive(Debug)]
pub struct PackScan<'d> {
    /// Barcodes tried, manual ones first.
    pub barcodes: Vec<String>,
    /// Text used for the name lookup, if any.
    pub text: Option<String>,
    /// The lookup outcome.
    pub lookup: Lookup<'d>,
}

/// Resolves a medicine pack photo: barcodes first, then OCR of the centre.
#[derive(Default)]
pub struct PackScanner {
    reader: Option<Box<dyn TextReader>>,
}

impl PackScanner {
    /// Scanner that also reads text with `reader` when no barcode matches.
    pub fn with_reader(reader: impl TextReader + 'static) -> Self {
        Self {
            reader: Some(Box::new(reader)),
        }
    }

    /// Scan `image` against `db`. `barcode` is tried before the decoded ones
    /// and `text` replaces OCR.
    pub fn scan<'d>(
        &self,
        image: &RgbImage,
        db: &'d MedicineDb,
        barcode: Option<&str>,
        text: Option<&str>,
    ) -> Result<PackScan<'d>, ScanError> {
        let mut barcodes: Vec<String> = barcode.map(str::to_string).into_iter().collect();
        barcodes.extend(decode_barcodes(image));
        tracing::debug!(?barcodes, "barcodes");

        let codes: Vec<&str> = barcodes.iter().map(String::as_str).collect();
        if let Some(record) = codes.iter().find_map(|code| db.lookup_by_barcode(code)) {
            return Ok(PackScan {
                barcodes,
                text: None,
                lookup: Lookup::Found(record),
            });
        }

        let text = match (text, &self.reader) {
            (Some(text), _) => Some(text.to_string()),
            (None, Some(reader)) => {
                let region = centre_region(image.width(), image.height());
                let crop =
                    imageops::crop_imm(image, region.x, region.y, region.width, region.height)
                        .to_image();
                let text = reader.read_text(&crop)?;
                tracing::debug!(?region, %text, "read centre crop");
                Some(text)
            }
            (None, None) => None,
        };
        let lookup = db.lookup_any(&codes, text.as_deref());
        Ok(PackScan {
            barcodes,
            text,
            lookup,
        })
    }
}

/// [`TextReader`] backed by an oar-ocr detection and recognition pipeline.
#[cfg(feature = "ocr")]
pub struct OcrReader {
    ocr: oar_ocr::oarocr::OAROCR,
}

#[cfg(feature = "ocr")]
impl OcrReader {
    /// Load the text detection and recognition ONNX models and the
    /// character dictionary.
    pub fn new(
        detection_model: impl Into<std::path::PathBuf>,
        recognition_model: impl Into<std::path::PathBuf>,
        char_dict: impl Into<std::path::PathBuf>,
    ) -> Result<Self, ScanError> {
        let ocr =
            oar_ocr::oarocr::OAROCRBuilder::new(detection_model, recognition_model, char_dict)
                .build()
                .map_err(|e| ScanError::OcrError(e.to_string()))?;
        Ok(Self { ocr })
    }
}

#[cfg(feature = "ocr")]
impl TextReader for OcrReader {
    fn read_text(&self, image: &RgbImage) -> Result<String, ScanError> {
        let results = self
            .ocr
            .predict(vec![image.clone()])
            .map_err(|e| ScanError::OcrError(e.to_string()))?;
        let texts: Vec<&str> = results
            .iter()
            .flat_map(|r| r.text_regions.iter())
            .filter_map(|region| region.text.as_deref())
            .collect();
        Ok(texts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use image::{GrayImage, Luma, Rgb};
    use rxing::{BarcodeFormat, MultiFormatWriter, Writer};

    use super::*;
    use crate::medicine::MedicineRecord;

    const EAN: &str = "8901234567890";

    struct FixedText {
        text: &'static str,
        crop: Cell<Option<(u32, u32)>>,
    }

    impl FixedText {
        fn new(text: &'static str) -> Self {
            Self {
                text,
                crop: Cell::new(None),
            }
        }
    }

    impl TextReader for std::rc::Rc<FixedText> {
        fn read_text(&self, image: &RgbImage) -> Result<String, ScanError> {
            self.crop.set(Some(image.dimensions()));
            Ok(self.text.to_string())
        }
    }

    fn db() -> MedicineDb {
        MedicineDb::from_records(vec![
            MedicineRecord {
                brand: Some("Dolo 650".into()),
                generic: Some("Paracetamol".into()),
                strength: Some("650 mg".into()),
                ..Default::default()
            },
            MedicineRecord {
                generic: Some("Cetirizine".into()),
                barcode: Some(EAN.into()),
                ..Default::default()
            },
        ])
    }

    fn blank(width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([255, 255, 255]))
    }

    fn ean13_image() -> Result<RgbImage, Box<dyn std::error::Error>> {
        let matrix = MultiFormatWriter::default().encode(EAN, &BarcodeFormat::EAN_13, 300, 120)?;
        let gray = GrayImage::from_fn(matrix.getWidth(), matrix.getHeight(), |x, y| {
            if matrix.get(x, y) { Luma([0]) } else { Luma([255]) }
        });
        Ok(image::DynamicImage::ImageLuma8(gray).to_rgb8())
    }

    #[test]
    fn test_centre_region() {
        assert_eq!(
            centre_region(100, 50),
            Region {
                x: 5,
                y: 10,
                width: 90,
                height: 30,
            }
        );
    }

    #[test]
    fn test_decode_barcodes() -> Result<(), Box<dyn std::error::Error>> {
        assert!(decode_barcodes(&blank(64, 64)).is_empty());
        assert_eq!(decode_barcodes(&ean13_image()?), vec![EAN.to_string()]);
        Ok(())
    }

    #[test]
    fn test_scan_barcode_skips_ocr() -> Result<(), Box<dyn std::error::Error>> {
        let db = db();
        let reader = std::rc::Rc::new(FixedText::new("dolo"));
        let scanner = PackScanner::with_reader(reader.clone());

        let scan = scanner.scan(&ean13_image()?, &db, None, None)?;

        assert!(matches!(scan.lookup, Lookup::Found(r) if r.generic.as_deref() == Some("Cetirizine")));
        assert_eq!(reader.crop.get(), None);
        Ok(())
    }

    #[test]
    fn test_scan_reads_centre_crop() -> Result<(), Box<dyn std::error::Error>> {
        let db = db();
        let reader = std::rc::Rc::new(FixedText::new("PARACETAMOL 650mg"));
        let scanner = PackScanner::with_reader(reader.clone());

        let scan = scanner.scan(&blank(100, 50), &db, Some("0000"), None)?;

        assert_eq!(reader.crop.get(), Some((90, 30)));
        assert_eq!(scan.barcodes, vec!["0000".to_string()]);
        assert_eq!(scan.text.as_deref(), Some("PARACETAMOL 650mg"));
        assert!(matches!(scan.lookup, Lookup::Found(r) if r.brand.as_deref() == Some("Dolo 650")));
        Ok(())
    }

    #[test]
    fn test_scan_manual_text_and_no_reader() -> Result<(), Box<dyn std::error::Error>> {
        let db = db();
        let scanner = PackScanner::default();

        let scan = scanner.scan(&blank(40, 40), &db, None, Some("ibuprofen 400mg"))?;
        assert_eq!(
            scan.lookup.message().as_deref(),
            Some("Detected text ibuprofen 400mg... 400mg")
        );

        let scan = scanner.scan(&blank(40, 40), &db, None, None)?;
        assert_eq!(scan.lookup, Lookup::Nothing);
        Ok(())
    }
}
