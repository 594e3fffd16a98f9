//! Text extraction from source documents.

pub mod pdf;
pub mod text;

use std::fmt;

use crate::error::ProcessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Text,
}

impl DocumentFormat {
    /// Detects the format from the object key, falling back to the PDF
    /// magic bytes for keys without a usable extension.
    pub fn detect(source_key: &str, bytes: &[u8]) -> Option<Self> {
        if let Some(mime) = mime_guess::from_path(source_key).first() {
            if mime == mime_guess::mime::APPLICATION_PDF {
                return Some(DocumentFormat::Pdf);
            }
            if mime.type_() == mime_guess::mime::TEXT {
                return Some(DocumentFormat::Text);
            }
        }
        if bytes.starts_with(b"%PDF-") {
            return Some(DocumentFormat::Pdf);
        }
        None
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Text => "text",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    pub text: String,
    pub format: DocumentFormat,
    pub page_count: usize,
}

pub trait DocumentProcessor: Send + Sync {
    fn extract(&self, source_key: &str, bytes: &[u8]) -> Result<ExtractedText, ProcessError>;
    fn supports(&self, format: DocumentFormat) -> bool;
}

pub struct ProcessorRegistry {
    processors: Vec<Box<dyn DocumentProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            processors: vec![
                Box::new(text::TextProcessor::new()),
                Box::new(pdf::PdfProcessor::new()),
            ],
        }
    }

    /// Extracts the text of a document. A document that yields no text is
    /// malformed input, not a transient failure.
    pub fn extract(&self, source_key: &str, bytes: &[u8]) -> Result<ExtractedText, ProcessError> {
        let format = DocumentFormat::detect(source_key, bytes)
            .ok_or_else(|| ProcessError::UnsupportedFormat(source_key.to_string()))?;

        let processor = self
            .processors
            .iter()
            .find(|p| p.supports(format))
            .ok_or_else(|| ProcessError::UnsupportedFormat(format.to_string()))?;

        let extracted = processor.extract(source_key, bytes)?;
        if extracted.text.trim().is_empty() {
            return Err(ProcessError::EmptyDocument(source_key.to_string()));
        }
        Ok(extracted)
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_by_extension() {
        assert_eq!(DocumentFormat::detect("uploads/a.pdf", b""), Some(DocumentFormat::Pdf));
        assert_eq!(DocumentFormat::detect("uploads/a.txt", b""), Some(DocumentFormat::Text));
        assert_eq!(DocumentFormat::detect("uploads/a.md", b""), Some(DocumentFormat::Text));
        assert_eq!(DocumentFormat::detect("uploads/a.xyz", b"junk"), None);
    }

    #[test]
    fn test_detect_by_magic_bytes() {
        assert_eq!(
            DocumentFormat::detect("uploads/noext", b"%PDF-1.5 ..."),
            Some(DocumentFormat::Pdf)
        );
    }

    #[test]
    fn test_registry_routes_text() {
        let registry = ProcessorRegistry::new();
        let extracted = registry
            .extract("uploads/rule.txt", b"Operators shall report quarterly.")
            .unwrap();
        assert_eq!(extracted.format, DocumentFormat::Text);
        assert!(extracted.text.contains("quarterly"));
    }

    #[test]
    fn test_empty_document_is_rejected() {
        let registry = ProcessorRegistry::new();
        let err = registry.extract("uploads/blank.txt", b"   \n\t").unwrap_err();
        assert!(matches!(err, ProcessError::EmptyDocument(_)));
    }

    #[test]
    fn test_unsupported_format() {
        let registry = ProcessorRegistry::new();
        let err = registry.extract("uploads/image.bin", b"\x00\x01").unwrap_err();
        assert!(matches!(err, ProcessError::UnsupportedFormat(_)));
    }
}
