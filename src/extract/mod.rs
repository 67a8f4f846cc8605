//! Content extraction: file bytes in, plain text out.
//!
//! Dispatch is by file extension only, through the closed [`FileFormat`]
//! registry. Every handler caps the work it does (pages, sheets, rows,
//! bytes, archive entries) and reports malformed input as an
//! [`ExtractError`]; [`Extractor::extract`] turns that into `None` for the one
//! file, so a bad document never stops a crawl.
//!
//! PDFs whose text layer is thinner than [`OCR_TRIGGER_CHARS`] are rasterized
//! page by page and sent through the OCR chain.

mod archive;
mod legacy;
mod ooxml;
mod pdf;
mod text;

use std::io::Read;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{ExtractConfig, ZipMode};
use crate::models::file_extension;
use crate::ocr::OcrServices;
use crate::progress::{CrawlProgressEvent, CrawlProgressReporter};

/// Text layers with fewer trimmed characters than this go to OCR.
pub const OCR_TRIGGER_CHARS: usize = 50;

/// Every format the extractor knows, plus the explicit fallthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Pdf,
    Docx,
    Doc,
    Pptx,
    Ppt,
    Pub,
    Xlsx,
    Image,
    Text,
    Csv,
    Json,
    Zip,
    Unsupported,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => FileFormat::Pdf,
            "docx" => FileFormat::Docx,
            "doc" => FileFormat::Doc,
            "pptx" => FileFormat::Pptx,
            "ppt" => FileFormat::Ppt,
            "pub" => FileFormat::Pub,
            "xlsx" | "xlsm" | "xltx" | "xltm" => FileFormat::Xlsx,
            "png" | "jpg" | "jpeg" | "tiff" | "bmp" | "gif" => FileFormat::Image,
            "txt" | "md" | "markdown" => FileFormat::Text,
            "csv" => FileFormat::Csv,
            "json" => FileFormat::Json,
            "zip" => FileFormat::Zip,
            _ => FileFormat::Unsupported,
        }
    }

    pub fn from_name(name: &str) -> Self {
        file_extension(name)
            .map(|ext| Self::from_extension(&ext))
            .unwrap_or(FileFormat::Unsupported)
    }

    pub fn is_supported(&self) -> bool {
        *self != FileFormat::Unsupported
    }

    /// Formats extracted from inside a `.zip` in extract mode.
    fn is_archive_member(&self) -> bool {
        matches!(
            self,
            FileFormat::Pdf
                | FileFormat::Docx
                | FileFormat::Doc
                | FileFormat::Pptx
                | FileFormat::Text
                | FileFormat::Csv
                | FileFormat::Json
                | FileFormat::Xlsx
        )
    }
}

/// Why a handler gave up on a file.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("legacy Office extraction failed: {0}")]
    Legacy(String),
    #[error("archive extraction failed: {0}")]
    Archive(String),
    #[error("parser panicked: {0}")]
    Panic(String),
}

/// Per-handler ceilings. Hitting one truncates silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractLimits {
    pub pdf_max_pages: usize,
    pub xlsx_max_sheets: usize,
    pub xlsx_max_rows: usize,
    pub csv_max_rows: usize,
    pub json_max_bytes: usize,
    pub zip_max_entries: usize,
    pub zip_entry_max_chars: usize,
    pub zip_list_max: usize,
    pub entry_max_bytes: u64,
}

impl ExtractLimits {
    pub fn from_config(config: &ExtractConfig) -> Self {
        Self {
            pdf_max_pages: config.pdf_max_pages,
            xlsx_max_sheets: config.xlsx_max_sheets,
            xlsx_max_rows: config.xlsx_max_rows,
            csv_max_rows: config.csv_max_rows,
            json_max_bytes: config.json_max_bytes,
            zip_max_entries: config.zip_max_entries,
            zip_entry_max_chars: config.zip_entry_max_chars,
            zip_list_max: config.zip_list_max,
            entry_max_bytes: config.zip_entry_max_bytes,
        }
    }

    /// Tighter ceilings for documents found inside an archive.
    pub fn nested(&self) -> Self {
        Self {
            pdf_max_pages: self.pdf_max_pages.min(10),
            xlsx_max_sheets: self.xlsx_max_sheets.min(3),
            xlsx_max_rows: self.xlsx_max_rows.min(50),
            csv_max_rows: self.csv_max_rows.min(50),
            json_max_bytes: self.json_max_bytes.min(5000),
            ..*self
        }
    }
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self::from_config(&ExtractConfig::default())
    }
}

pub struct Extractor {
    limits: ExtractLimits,
    zip_mode: ZipMode,
    ocr: Option<OcrServices>,
    progress: Arc<dyn CrawlProgressReporter>,
}

impl Extractor {
    pub fn new(
        limits: ExtractLimits,
        zip_mode: ZipMode,
        ocr: Option<OcrServices>,
        progress: Arc<dyn CrawlProgressReporter>,
    ) -> Self {
        Self {
            limits,
            zip_mode,
            ocr,
            progress,
        }
    }

    /// Extract text from one file. `None` means the file could not be read
    /// (or held no recognisable content, for images and legacy Word files).
    pub async fn extract(&self, name: &str, bytes: &[u8]) -> Option<String> {
        let format = FileFormat::from_name(name);
        match self.try_extract(format, name, bytes).await {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    file = name,
                    extension = file_extension(name).unwrap_or_default(),
                    error = %e,
                    "Extraction failed"
                );
                None
            }
        }
    }

    pub async fn try_extract(
        &self,
        format: FileFormat,
        name: &str,
        bytes: &[u8],
    ) -> Result<Option<String>, ExtractError> {
        match format {
            FileFormat::Pdf => self.pdf(name, bytes).await.map(Some),
            FileFormat::Image => Ok(self.image(name, bytes).await),
            FileFormat::Zip => match self.zip_mode {
                ZipMode::List => archive::list(name, bytes, self.limits.zip_list_max).map(Some),
                ZipMode::Extract => archive::extract(bytes, &self.limits).map(Some),
            },
            FileFormat::Ppt => Ok(Some(legacy::note(name, "Legacy PowerPoint (.ppt)"))),
            FileFormat::Pub => Ok(Some(legacy::note(name, "Microsoft Publisher (.pub)"))),
            FileFormat::Unsupported => Ok(None),
            other => extract_structured(other, bytes, &self.limits, SlideHeading::Banner),
        }
    }

    async fn pdf(&self, name: &str, bytes: &[u8]) -> Result<String, ExtractError> {
        if let Some(di) = self
            .ocr
            .as_ref()
            .and_then(|o| o.document_intelligence.as_ref())
            .filter(|di| di.should_use(name))
        {
            match di.analyze(bytes).await {
                Ok(text) if !text.trim().is_empty() => return Ok(text),
                Ok(_) => debug!(file = name, "Document intelligence returned no text"),
                Err(e) => warn!(file = name, error = %e, "Document intelligence failed"),
            }
        }

        let document = pdf::PdfDocument::load(bytes, self.limits.pdf_max_pages)?;
        let primary = document.text_layer();
        let thin = match &primary {
            Ok(text) => text.trim().chars().count() < OCR_TRIGGER_CHARS,
            Err(_) => true,
        };
        if !thin {
            return primary;
        }

        let ocr_text = match &self.ocr {
            Some(ocr) => self.ocr_pages(ocr, name, &document).await,
            None => String::new(),
        };
        if ocr_text.trim().is_empty() {
            primary
        } else {
            Ok(ocr_text)
        }
    }

    async fn ocr_pages(&self, ocr: &OcrServices, name: &str, document: &pdf::PdfDocument<'_>) -> String {
        let total = document.page_count();
        let mut parts = Vec::new();
        for page in 1..=total {
            let image = match ocr
                .rasterizer
                .render_page(document.bytes(), page, ocr.dpi)
                .await
            {
                Ok(image) => image,
                Err(e) => {
                    warn!(file = name, page, error = %e, "Page rasterization failed");
                    continue;
                }
            };
            let output = ocr.chain.recognize(&image).await;
            self.progress.report(CrawlProgressEvent::OcrPage {
                file: name.to_string(),
                engine: output.as_ref().map(|o| o.engine).unwrap_or("none"),
                page,
                total,
            });
            if let Some(output) = output {
                parts.push(format!("=== Page {} ===\n{}\n", page, output.text));
            }
        }
        parts.join("\n")
    }

    async fn image(&self, name: &str, bytes: &[u8]) -> Option<String> {
        let Some(ocr) = &self.ocr else {
            debug!(file = name, "No OCR engine configured for image");
            return None;
        };
        let output = ocr.chain.recognize(bytes).await;
        self.progress.report(CrawlProgressEvent::OcrPage {
            file: name.to_string(),
            engine: output.as_ref().map(|o| o.engine).unwrap_or("none"),
            page: 1,
            total: 1,
        });
        output.map(|o| o.text)
    }
}

/// How slide headings are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlideHeading {
    /// `=== Slide N ===`
    Banner,
    /// `Slide N:`
    Plain,
}

/// Handlers that need no OCR and no network, shared by top-level files and
/// archive members.
fn extract_structured(
    format: FileFormat,
    bytes: &[u8],
    limits: &ExtractLimits,
    slides: SlideHeading,
) -> Result<Option<String>, ExtractError> {
    let text = match format {
        FileFormat::Pdf => pdf::PdfDocument::load(bytes, limits.pdf_max_pages)?.text_layer()?,
        FileFormat::Docx => ooxml::docx(bytes)?,
        FileFormat::Doc => return legacy::doc(bytes),
        FileFormat::Pptx => ooxml::pptx(bytes, slides)?,
        FileFormat::Xlsx => ooxml::xlsx(bytes, limits.xlsx_max_sheets, limits.xlsx_max_rows)?,
        FileFormat::Text => text::plain(bytes),
        FileFormat::Csv => text::csv(bytes, limits.csv_max_rows),
        FileFormat::Json => text::json(bytes, limits.json_max_bytes),
        _ => return Ok(None),
    };
    Ok(Some(text))
}

/// Read a zip entry, refusing entries that decompress past `max_bytes`.
fn read_bounded(reader: impl Read, max_bytes: u64, what: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    reader
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.len() as u64 >= max_bytes {
        return Err(format!("{} exceeds size limit ({} bytes)", what, max_bytes));
    }
    Ok(out)
}

/// First `max` characters of `text`.
pub(crate) fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;

    fn extractor() -> Extractor {
        Extractor::new(
            ExtractLimits::default(),
            ZipMode::List,
            None,
            Arc::new(NoProgress),
        )
    }

    #[test]
    fn dispatch_is_by_extension_only() {
        assert_eq!(FileFormat::from_name("Report.PDF"), FileFormat::Pdf);
        assert_eq!(FileFormat::from_name("budget.xltm"), FileFormat::Xlsx);
        assert_eq!(FileFormat::from_name("notes.markdown"), FileFormat::Text);
        assert_eq!(FileFormat::from_name("scan.jpeg"), FileFormat::Image);
        assert_eq!(FileFormat::from_name("movie.mp4"), FileFormat::Unsupported);
        assert_eq!(FileFormat::from_name("Makefile"), FileFormat::Unsupported);
        assert!(!FileFormat::Unsupported.is_supported());
    }

    #[test]
    fn nested_limits_are_tighter() {
        let nested = ExtractLimits::default().nested();
        assert_eq!(nested.pdf_max_pages, 10);
        assert_eq!(nested.xlsx_max_sheets, 3);
        assert_eq!(nested.csv_max_rows, 50);
        assert_eq!(nested.json_max_bytes, 5000);
        assert_eq!(nested.zip_entry_max_chars, 2000);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[tokio::test]
    async fn malformed_input_yields_none() {
        let ex = extractor();
        assert!(ex.extract("broken.pdf", b"not a pdf").await.is_none());
        assert!(ex.extract("broken.docx", b"not a zip").await.is_none());
        assert!(ex.extract("broken.zip", b"not a zip").await.is_none());
    }

    #[tokio::test]
    async fn unsupported_and_imageless_ocr_yield_none() {
        let ex = extractor();
        assert!(ex.extract("clip.mp4", b"\x00\x01").await.is_none());
        assert!(ex.extract("photo.png", b"\x89PNG").await.is_none());
    }

    #[tokio::test]
    async fn publisher_files_get_a_note() {
        let text = extractor().extract("flyer.pub", b"binary").await.unwrap();
        assert_eq!(
            text,
            "File: flyer.pub\nType: Microsoft Publisher (.pub)\nNote: Full-text extraction not supported"
        );
    }
}
