//! Export of the three variants as one Markdown document.

use crate::document::SourceDocument;

/// Placed between consecutive variants.
pub const SEPARATOR: &str = "\n\n***\n\n";

const PREFIX: &str = "Bo_3_De_Thi_";
const FALLBACK_STEM: &str = "ExamGen_Output";

/// Joins the three step buffers in step order.
pub fn compose(buffers: &[String; 3]) -> String {
    buffers.join(SEPARATOR)
}

/// Export file name without extension, derived from the source document.
pub fn file_stem(document: Option<&SourceDocument>) -> String {
    match document {
        Some(document) => format!("{PREFIX}{}", document.stem()),
        None => FALLBACK_STEM.to_string(),
    }
}
