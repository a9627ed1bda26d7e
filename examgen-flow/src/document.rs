use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// The uploaded source exam. Only step 1 sends it to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub name: String,
    pub mime_type: String,
    /// Base64 payload, sent as an inline blob.
    pub data: String,
}

impl SourceDocument {
    pub fn from_base64(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self::from_base64(name, mime_type, STANDARD.encode(bytes))
    }

    pub fn is_empty(&self) -> bool {
        self.data.trim().is_empty()
    }

    /// Fails with `MissingInput` when there is no payload to send.
    pub fn ensure_present(&self) -> Result<()> {
        if self.is_empty() {
            return Err(FlowError::MissingInput(format!(
                "document '{}' has no content",
                self.name
            )));
        }
        Ok(())
    }

    /// File name up to its first dot.
    pub fn stem(&self) -> &str {
        self.name.split('.').next().unwrap_or_default()
    }
}

/// Best guess of the MIME type from a file extension.
pub fn mime_from_extension(path: &str) -> Option<&'static str> {
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => return None,
    };
    Some(mime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_base64_encoded() {
        let doc = SourceDocument::from_bytes("exam.pdf", "application/pdf", b"hello");
        assert_eq!(doc.data, "aGVsbG8=");
        assert!(doc.ensure_present().is_ok());
    }

    #[test]
    fn empty_payload_is_missing_input() {
        let doc = SourceDocument::from_base64("exam.pdf", "application/pdf", "  ");
        assert!(matches!(doc.ensure_present(), Err(FlowError::MissingInput(_))));
    }

    #[test]
    fn stem_stops_at_first_dot() {
        let doc = SourceDocument::from_base64("de.thi.hk1.pdf", "application/pdf", "x");
        assert_eq!(doc.stem(), "de");
        let doc = SourceDocument::from_base64("README", "text/plain", "x");
        assert_eq!(doc.stem(), "README");
    }

    #[test]
    fn mime_guess_is_case_insensitive() {
        assert_eq!(mime_from_extension("Scan.JPG"), Some("image/jpeg"));
        assert_eq!(mime_from_extension("exam.pdf"), Some("application/pdf"));
        assert_eq!(mime_from_extension("archive.zip"), None);
        assert_eq!(mime_from_extension("noext"), None);
    }
}
