use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Number of characters of unmatched text repeated back to the user.
const UNMATCHED_PREVIEW_CHARS: usize = 40;

/// Medicine database error enum.
#[derive(thiserror::Error, Debug)]
pub enum MedicineDbError {
    /// The database file exists but could not be read.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// The database file is not a JSON array of records.
    #[error("Invalid medicine database: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// One medicine entry. Every field is optional in the JSON file; numbers
/// are read as their decimal text and other non-string values are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedicineRecord {
    /// Brand name, e.g. "Dolo 650".
    #[serde(deserialize_with = "lenient_string")]
    pub brand: Option<String>,
    /// Generic name, e.g. "Paracetamol".
    #[serde(deserialize_with = "lenient_string")]
    pub generic: Option<String>,
    /// Strength, e.g. "650 mg".
    #[serde(deserialize_with = "lenient_string")]
    pub strength: Option<String>,
    /// What it is used for.
    #[serde(deserialize_with = "lenient_string")]
    pub uses: Option<String>,
    /// Warnings to read out.
    #[serde(deserialize_with = "lenient_string")]
    pub warnings: Option<String>,
    /// EAN/UPC code printed on the pack.
    #[serde(deserialize_with = "lenient_string")]
    pub barcode: Option<String>,
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

impl MedicineRecord {
    /// Spoken summary of the record.
    pub fn summary(&self) -> String {
        let name = self
            .brand
            .as_deref()
            .or(self.generic.as_deref())
            .unwrap_or("Medicine");
        format!(
            "{name} {}. Uses: {}. Warnings: {}",
            self.strength.as_deref().unwrap_or_default(),
            self.uses.as_deref().unwrap_or_default(),
            self.warnings.as_deref().unwrap_or_default(),
        )
    }

    fn haystack(&self) -> String {
        [&self.brand, &self.generic, &self.strength]
            .map(|f| f.as_deref().unwrap_or_default())
            .join(" ")
            .to_lowercase()
    }
}

/// Outcome of a medicine lookup.
#[derive(Debug, PartialEq)]
pub enum Lookup<'a> {
    /// A record matched the barcode or the text.
    Found(&'a MedicineRecord),
    /// Only barcodes were given and none is in the database.
    UnknownBarcode(String),
    /// Text was given but nothing matched it.
    Unmatched {
        /// The text that was searched.
        text: String,
        /// Strength token found in the text, possibly empty.
        strength: String,
    },
    /// Nothing to search with.
    Nothing,
}

impl Lookup<'_> {
    /// What to tell the user, if anything.
    pub fn message(&self) -> Option<String> {
        match self {
            Lookup::Found(record) => Some(record.summary()),
            Lookup::Unmatched { text, strength } => Some(unmatched_message(text, strength)),
            Lookup::UnknownBarcode(_) | Lookup::Nothing => None,
        }
    }
}

/// Local medicine database loaded from a JSON array.
#[derive(Debug, Clone, Default)]
pub struct MedicineDb {
    records: Vec<MedicineRecord>,
}

impl MedicineDb {
    /// Load the database; a missing file gives an empty database.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MedicineDbError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "medicine database not found, starting empty");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let records: Vec<MedicineRecord> = serde_json::from_str(&data)?;
        tracing::info!(path = %path.display(), records = records.len(), "loaded medicine database");
        Ok(Self { records })
    }

    /// Database over in-memory records.
    pub fn from_records(records: Vec<MedicineRecord>) -> Self {
        Self { records }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the database has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// First record whose brand, generic name or strength contains any word
    /// of `text`, ignoring case.
    pub fn lookup_by_name(&self, text: &str) -> Option<&MedicineRecord> {
        let text = text.to_lowercase();
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            return None;
        }
        self.records.iter().find(|r| {
            let hay = r.haystack();
            tokens.iter().any(|tok| hay.contains(tok))
        })
    }

    /// Record with exactly this barcode.
    pub fn lookup_by_barcode(&self, code: &str) -> Option<&MedicineRecord> {
        self.records
            .iter()
            .find(|r| r.barcode.as_deref() == Some(code))
    }

    /// Try the barcode first, then the recognised text.
    pub fn lookup(&self, barcode: Option<&str>, text: Option<&str>) -> Lookup<'_> {
        let barcodes: Vec<&str> = barcode.into_iter().collect();
        self.lookup_any(&barcodes, text)
    }

    /// Try every barcode in order, then the recognised text.
    pub fn lookup_any(&self, barcodes: &[&str], text: Option<&str>) -> Lookup<'_> {
        if let Some(record) = barcodes.iter().find_map(|code| self.lookup_by_barcode(code)) {
            return Lookup::Found(record);
        }
        let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
            return match barcodes.first() {
                Some(code) => Lookup::UnknownBarcode(code.to_string()),
                None => Lookup::Nothing,
            };
        };
        match self.lookup_by_name(text) {
            Some(record) => Lookup::Found(record),
            None => Lookup::Unmatched {
                text: text.to_string(),
                strength: extract_strength(text).to_string(),
            },
        }
    }
}

/// First word that looks like a dose, e.g. "500mg" or "mcg".
pub fn extract_strength(text: &str) -> &str {
    text.split_whitespace()
        .find(|t| {
            let t = t.to_lowercase();
            t.contains("mg") || t.contains("mcg")
        })
        .unwrap_or_default()
}

/// Message for text that matched no record.
pub fn unmatched_message(text: &str, strength: &str) -> String {
    let preview: String = text.chars().take(UNMATCHED_PREVIEW_CHARS).collect();
    format!("Detected text {preview}... {strength}")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> MedicineDb {
        MedicineDb::from_records(vec![
            MedicineRecord {
                brand: Some("Dolo 650".into()),
                generic: Some("Paracetamol".into()),
                strength: Some("650 mg".into()),
                uses: Some("Fever, pain".into()),
                warnings: Some("Liver disease caution".into()),
                barcode: None,
            },
            MedicineRecord {
                generic: Some("Cetirizine".into()),
                strength: Some("10 mg".into()),
                barcode: Some("8901234567890".into()),
                ..Default::default()
            },
        ])
    }

    #[test]
    fn test_lookup_by_name() {
        let db = db();
        let found = db.lookup_by_name("PARACETAMOL tablets IP");
        assert_eq!(found.and_then(|r| r.brand.as_deref()), Some("Dolo 650"));
        assert!(db.lookup_by_name("ibuprofen").is_none());
        assert!(db.lookup_by_name("   ").is_none());
    }

    #[test]
    fn test_lookup_by_barcode() {
        let db = db();
        let found = db.lookup_by_barcode("8901234567890");
        assert_eq!(found.and_then(|r| r.generic.as_deref()), Some("Cetirizine"));
        assert!(db.lookup_by_barcode("890123456789").is_none());
    }

    #[test]
    fn test_lookup_prefers_barcode() {
        let db = db();
        let lookup = db.lookup(Some("8901234567890"), Some("dolo"));
        assert_eq!(
            lookup.message().as_deref(),
            Some("Cetirizine 10 mg. Uses: . Warnings: ")
        );

        let lookup = db.lookup(Some("0000"), Some("dolo"));
        assert_eq!(
            lookup.message().as_deref(),
            Some("Dolo 650 650 mg. Uses: Fever, pain. Warnings: Liver disease caution")
        );

        assert_eq!(db.lookup(None, None), Lookup::Nothing);
        assert_eq!(
            db.lookup(Some("0000"), Some("  ")),
            Lookup::UnknownBarcode("0000".into())
        );
        assert_eq!(db.lookup(Some("0000"), None).message(), None);
    }

    #[test]
    fn test_lookup_any_tries_every_barcode() {
        let db = db();
        let lookup = db.lookup_any(&["1111", "8901234567890"], None);
        assert!(matches!(lookup, Lookup::Found(r) if r.generic.as_deref() == Some("Cetirizine")));
        assert_eq!(
            db.lookup_any(&["1111", "2222"], None),
            Lookup::UnknownBarcode("1111".into())
        );
    }

    #[test]
    fn test_unmatched() {
        let db = db();
        let lookup = db.lookup(None, Some("Ibuprofen 400MG tablets"));
        assert_eq!(
            lookup,
            Lookup::Unmatched {
                text: "Ibuprofen 400MG tablets".into(),
                strength: "400MG".into(),
            }
        );
        assert_eq!(
            lookup.message().as_deref(),
            Some("Detected text Ibuprofen 400MG tablets... 400MG")
        );
        assert_eq!(unmatched_message("abc", ""), "Detected text abc...");
    }

    #[test]
    fn test_extract_strength() {
        assert_eq!(extract_strength("take 250mg daily"), "250mg");
        assert_eq!(extract_strength("Vitamin B12 500 MCG"), "MCG");
        assert_eq!(extract_strength("no dose here"), "");
    }

    #[test]
    fn test_summary_fallbacks() {
        let record = MedicineRecord::default();
        assert_eq!(record.summary(), "Medicine . Uses: . Warnings: ");
    }

    #[test]
    fn test_load() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;

        let missing = MedicineDb::load(dir.path().join("meds.json"))?;
        assert!(missing.is_empty());

        let path = dir.path().join("meds.json");
        std::fs::write(
            &path,
            r#"[{"brand":"Dolo 650","generic":"Paracetamol","strength":"650 mg"},{"generic":"Cetirizine"}]"#,
        )?;
        let db = MedicineDb::load(&path)?;
        assert_eq!(db.len(), 2);
        assert!(db.lookup_by_name("cetirizine").is_some());

        std::fs::write(
            &path,
            r#"[{"brand":"Dolo 650","generic":"Paracetamol","barcode":8901234567890,"strength":650,"uses":null,"warnings":["x"]}]"#,
        )?;
        let db = MedicineDb::load(&path)?;
        let record = db.lookup_by_barcode("8901234567890");
        assert_eq!(record.and_then(|r| r.brand.as_deref()), Some("Dolo 650"));
        assert_eq!(record.and_then(|r| r.strength.as_deref()), Some("650"));
        assert_eq!(record.and_then(|r| r.warnings.as_deref()), None);

        std::fs::write(&path, "{not json")?;
        assert!(matches!(
            MedicineDb::load(&path),
            Err(MedicineDbError::ParseError(_))
        ));
        Ok(())
    }
}
