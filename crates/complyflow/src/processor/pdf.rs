use crate::error::ProcessError;
use crate::processor::{DocumentFormat, DocumentProcessor, ExtractedText};

pub struct PdfProcessor;

impl PdfProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PdfProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentProcessor for PdfProcessor {
    fn extract(&self, source_key: &str, bytes: &[u8]) -> Result<ExtractedText, ProcessError> {
        let _span = tracing::info_span!("processor.pdf", key = source_key).entered();

        let doc = lopdf::Document::load_mem(bytes).map_err(|e| {
            ProcessError::PdfProcessing(format!("failed to load '{}': {}", source_key, e))
        })?;

        let pages = doc.get_pages();
        let mut text = String::new();
        for page_num in pages.keys() {
            match doc.extract_text(&[*page_num]) {
                Ok(page_text) => {
                    text.push_str(&page_text);
                    text.push('\n');
                }
                Err(e) => tracing::warn!("Skipping page {} of {}: {}", page_num, source_key, e),
            }
        }

        Ok(ExtractedText {
            text,
            format: DocumentFormat::Pdf,
            page_count: pages.len(),
        })
    }

    fn supports(&self, format: DocumentFormat) -> bool {
        matches!(format, DocumentFormat::Pdf)
    }
}
