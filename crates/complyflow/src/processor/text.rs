use crate::error::ProcessError;
use crate::processor::{DocumentFormat, DocumentProcessor, ExtractedText};

pub struct TextProcessor;

impl TextProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TextProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentProcessor for TextProcessor {
    fn extract(&self, source_key: &str, bytes: &[u8]) -> Result<ExtractedText, ProcessError> {
        let text = String::from_utf8(bytes.to_vec()).map_err(|e| {
            ProcessError::TextExtraction(format!("'{}' is not valid UTF-8: {}", source_key, e))
        })?;
        // Strip a UTF-8 byte order mark left by some editors.
        let text = text.trim_start_matches('\u{feff}').to_string();
        Ok(ExtractedText {
            text,
            format: DocumentFormat::Text,
            page_count: 1,
        })
    }

    fn supports(&self, format: DocumentFormat) -> bool {
        matches!(format, DocumentFormat::Text)
    }
}
