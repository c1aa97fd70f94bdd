//! PDF-to-text conversion feeding C8/C9. Ported in meaning from the
//! teacher's `extract::extract_pdf_text`, extended to a page map since C8/C9
//! both need per-page text rather than one flat string.

use crate::extract::{detect_content_kind, extract_pdf_text, extract_utf8, ContentKind};
use crate::fulltext::{ConversionResult, DocumentConverter};
use std::path::Path;

pub struct PdfConverter;

impl DocumentConverter for PdfConverter {
    fn convert(&self, local_path: &Path) -> Option<ConversionResult> {
        let bytes = std::fs::read(local_path).ok()?;
        let filename = local_path.file_name().and_then(|n| n.to_str());
        let mime = mime_for(local_path);
        let kind = detect_content_kind(&mime, filename);

        let text = match kind {
            ContentKind::Pdf => extract_pdf_text(&bytes)?,
            ContentKind::Text | ContentKind::Markdown | ContentKind::Json => extract_utf8(&bytes).ok()?,
            ContentKind::Unsupported => return None,
        };

        // pdf-extract separates pages with form-feed characters; documents
        // without page breaks (or non-PDF sources) collapse to a single page.
        let pages = text
            .split('\u{000C}')
            .enumerate()
            .map(|(i, page_text)| (i as u32 + 1, page_text.to_string()))
            .collect();

        Some(ConversionResult { pages })
    }
}

fn mime_for(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase().as_str() {
        "pdf" => "application/pdf".to_string(),
        "md" | "markdown" => "text/markdown".to_string(),
        "json" => "application/json".to_string(),
        _ => "text/plain".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_file_converts_to_a_single_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, "hello world").unwrap();

        let result = PdfConverter.convert(&path).unwrap();
        assert_eq!(result.pages.len(), 1);
        assert_eq!(result.pages[&1], "hello world");
    }
}
