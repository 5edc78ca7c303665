//! Text extraction for uploaded documents (PDF, DOCX/DOC, TXT/MD).
//!
//! Extraction dispatches on the caller's declared format and returns plain
//! UTF-8 text plus basic page/paragraph counts. Corrupt or undeclared input
//! fails closed here instead of being chunked into garbage downstream.

use std::io::Read;
use thiserror::Error;

use crate::models::DocumentFormat;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb
/// protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("text is not valid UTF-8: {0}")]
    InvalidEncoding(String),
}

/// Extracted text plus the metadata the document row carries.
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub text: String,
    pub page_count: i64,
    pub paragraph_count: i64,
}

/// Resolve a declared format string or filename extension, failing closed
/// on anything unsupported.
pub fn resolve_format(declared: Option<&str>, filename: &str) -> Result<DocumentFormat, ExtractError> {
    let ext = match declared {
        Some(f) => f.to_string(),
        None => filename
            .rsplit('.')
            .next()
            .filter(|e| *e != filename)
            .unwrap_or_default()
            .to_string(),
    };
    DocumentFormat::from_extension(&ext).ok_or(ExtractError::UnsupportedFormat(ext))
}

/// Extract plain text from raw bytes of the declared format.
pub fn extract_text(bytes: &[u8], format: DocumentFormat) -> Result<ExtractedDocument, ExtractError> {
    match format {
        DocumentFormat::Pdf => extract_pdf(bytes),
        // Pre-OOXML .doc binaries are not ZIP archives and surface an
        // explicit Ooxml error here rather than garbage text.
        DocumentFormat::Docx | DocumentFormat::Doc => extract_docx(bytes),
        DocumentFormat::Txt | DocumentFormat::Md => extract_plain(bytes),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<ExtractedDocument, ExtractError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    // pdf-extract emits form feeds between pages.
    let page_count = (text.matches('\u{c}').count() + 1) as i64;
    let paragraph_count = count_paragraphs(&text);
    Ok(ExtractedDocument {
        text,
        page_count,
        paragraph_count,
    })
}

fn extract_plain(bytes: &[u8]) -> Result<ExtractedDocument, ExtractError> {
    let text = String::from_utf8(bytes.to_vec())
        .map_err(|e| ExtractError::InvalidEncoding(e.to_string()))?;
    let paragraph_count = count_paragraphs(&text);
    Ok(ExtractedDocument {
        text,
        page_count: 1,
        paragraph_count,
    })
}

fn extract_docx(bytes: &[u8]) -> Result<ExtractedDocument, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Ooxml("word/document.xml not found".to_string()))?;
    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    let (text, paragraph_count) = extract_w_t_elements(&doc_xml)?;
    Ok(ExtractedDocument {
        text,
        page_count: 0,
        paragraph_count,
    })
}

/// Walk `word/document.xml`, collecting `w:t` text runs and counting `w:p`
/// paragraph elements. Paragraph boundaries become blank lines so the
/// chunker's sentence heuristics still see document structure.
fn extract_w_t_elements(xml: &[u8]) -> Result<(String, i64), ExtractError> {
    let mut out = String::new();
    let mut paragraphs: i64 = 0;
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"p" {
                    paragraphs += 1;
                    if !out.is_empty() {
                        out.push_str("\n\n");
                    }
                } else if name.as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        out.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok((out, paragraphs))
}

fn count_paragraphs(text: &str) -> i64 {
    text.split("\n\n").filter(|p| !p.trim().is_empty()).count() as i64
}
