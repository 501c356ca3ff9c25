//! Suggested-fix payloads attached to bugs, and the caps that bound them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FixKind {
    /// Patch an existing file; requires an anchor snippet.
    Modify,
    /// Add a new file.
    New,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedFix {
    #[serde(rename = "type")]
    pub kind: FixKind,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_snippet: Option<String>,
    pub updated_snippet: String,
}

/// Size bounds for a bug's suggested fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixLimits {
    pub max_items: usize,
    pub max_snippet_bytes: usize,
    pub max_total_bytes: usize,
}

impl Default for FixLimits {
    fn default() -> Self {
        Self {
            max_items: 10,
            max_snippet_bytes: 8 * 1024,
            max_total_bytes: 32 * 1024,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FixError {
    #[error("suggestedFixes[{index}] has an empty filePath")]
    EmptyPath { index: usize },

    #[error(
        "suggestedFixes[{index}] for {file_path} is type 'modify' but has no existingSnippet; \
         include the exact lines being replaced"
    )]
    MissingAnchor { index: usize, file_path: String },

    #[error("too many suggestedFixes: {count} (max {max}); keep only the most important")]
    TooMany { count: usize, max: usize },

    #[error(
        "suggestedFixes[{index}] snippet is {bytes} bytes (max {max}); shorten it to the changed lines"
    )]
    SnippetTooLarge { index: usize, bytes: usize, max: usize },

    #[error("suggestedFixes payload is {bytes} bytes (max {max}); send fewer or smaller fixes")]
    PayloadTooLarge { bytes: usize, max: usize },
}

impl FixError {
    /// Size violations the model can resolve by shrinking its payload.
    pub fn is_size_limit(&self) -> bool {
        matches!(
            self,
            Self::TooMany { .. } | Self::SnippetTooLarge { .. } | Self::PayloadTooLarge { .. }
        )
    }
}

/// Validate a fix list against the anchor rule and the size caps. Nothing is
/// truncated: an oversized list is rejected as a whole.
pub fn validate_fixes(fixes: &[SuggestedFix], limits: &FixLimits) -> Result<(), FixError> {
    if fixes.len() > limits.max_items {
        return Err(FixError::TooMany {
            count: fixes.len(),
            max: limits.max_items,
        });
    }

    for (index, fix) in fixes.iter().enumerate() {
        if fix.file_path.trim().is_empty() {
            return Err(FixError::EmptyPath { index });
        }
        let anchor = fix.existing_snippet.as_deref().unwrap_or_default();
        if fix.kind == FixKind::Modify && anchor.trim().is_empty() {
            return Err(FixError::MissingAnchor {
                index,
                file_path: fix.file_path.clone(),
            });
        }
        let bytes = fix.updated_snippet.len().max(anchor.len());
        if bytes > limits.max_snippet_bytes {
            return Err(FixError::SnippetTooLarge {
                index,
                bytes,
                max: limits.max_snippet_bytes,
            });
        }
    }

    // Serialization of plain strings cannot fail; treat a failure as oversized.
    let bytes = serde_json::to_vec(fixes)
        .map(|v| v.len())
        .unwrap_or(usize::MAX);
    if bytes > limits.max_total_bytes {
        return Err(FixError::PayloadTooLarge {
            bytes,
            max: limits.max_total_bytes,
        });
    }
    Ok(())
}
