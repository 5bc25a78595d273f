//! crates/cv_pipeline_core/src/aggregator.rs
//!
//! Joins per-page OCR text into one document string. Pages are appended in
//! page order with a boundary marker between non-empty contributions, so the
//! analysis stage can tell where repeated content came from.

use crate::error::PipelineError;

/// Share of the 0-100 progress range owned by page extraction.
pub const EXTRACTION_PROGRESS_SHARE: f64 = 50.0;

/// The boundary inserted before the text of `page_number`.
pub fn page_marker(page_number: usize) -> String {
    format!("\n\n--- PAGE {page_number} ---\n\n")
}

/// Progress after finishing page `page_number` of `total_pages`.
pub fn extraction_progress(page_number: usize, total_pages: usize) -> f64 {
    if total_pages == 0 {
        return EXTRACTION_PROGRESS_SHARE;
    }
    let done = page_number.min(total_pages) as f64;
    done / total_pages as f64 * EXTRACTION_PROGRESS_SHARE
}

/// Fails with `InsufficientText` when `text`, trimmed, is shorter than `min_chars`.
pub fn ensure_min_text(text: &str, min_chars: usize) -> Result<(), PipelineError> {
    let chars = text.trim().chars().count();
    if chars < min_chars {
        return Err(PipelineError::InsufficientText {
            chars,
            minimum: min_chars,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct PageAggregator {
    text: String,
    contributions: usize,
}

impl PageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues from text persisted by an earlier page extraction.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let contributions = usize::from(!text.trim().is_empty());
        Self { text, contributions }
    }

    /// Appends one page. Blank pages add nothing, not even a marker.
    pub fn push(&mut self, page_number: usize, page_text: &str) {
        if page_text.trim().is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push_str(&page_marker(page_number));
        }
        self.text.push_str(page_text);
        self.contributions += 1;
    }

    /// Drops everything from byte `offset` on, so the page that started
    /// there can be pushed again. Offsets past the end or inside a character
    /// leave the text as it is.
    pub fn rewind(&mut self, offset: usize) {
        if offset < self.text.len() && self.text.is_char_boundary(offset) {
            self.text.truncate(offset);
            self.contributions = usize::from(!self.text.trim().is_empty())
                + self.text.matches("\n\n--- PAGE ").count();
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Byte length of the text so far; where the next page will start.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// How many pages have contributed text so far.
    pub fn contributions(&self) -> usize {
        self.contributions
    }

    /// Validates the minimum length and returns the trimmed document text.
    pub fn finish(self, min_chars: usize) -> Result<String, PipelineError> {
        ensure_min_text(&self.text, min_chars)?;
        Ok(self.text.trim().to_string())
    }
}
