use std::borrow::Cow;
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::ExtractError;

/// A PDF cut down to at most `max_pages` pages.
pub(super) struct PdfDocument<'a> {
    bytes: Cow<'a, [u8]>,
    pages: usize,
}

impl<'a> PdfDocument<'a> {
    /// Parse the page tree and drop every page past the ceiling.
    pub(super) fn load(bytes: &'a [u8], max_pages: usize) -> Result<Self, ExtractError> {
        let mut doc =
            lopdf::Document::load_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
        let total = doc.get_pages().len();
        if total <= max_pages {
            return Ok(Self {
                bytes: Cow::Borrowed(bytes),
                pages: total,
            });
        }

        let beyond: Vec<u32> = ((max_pages as u32 + 1)..=(total as u32)).collect();
        doc.delete_pages(&beyond);
        let mut out = Vec::new();
        doc.save_to(&mut out)
            .map_err(|e| ExtractError::Pdf(e.to_string()))?;
        Ok(Self {
            bytes: Cow::Owned(out),
            pages: max_pages,
        })
    }

    pub(super) fn page_count(&self) -> usize {
        self.pages
    }

    pub(super) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Text of every kept page, pages separated by a newline.
    ///
    /// `pdf-extract` can panic on odd font tables; that is caught and reported
    /// as an error for this file.
    pub(super) fn text_layer(&self) -> Result<String, ExtractError> {
        let bytes: &[u8] = &self.bytes;
        let pages = catch_unwind(AssertUnwindSafe(|| {
            pdf_extract::extract_text_from_mem_by_pages(bytes)
        }));
        match pages {
            Ok(Ok(pages)) => Ok(pages
                .iter()
                .map(|p| p.trim_end())
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()),
            Ok(Err(e)) => Err(ExtractError::Pdf(e.to_string())),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(ExtractError::Panic(msg))
            }
        }
    }
}
