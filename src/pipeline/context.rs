//! Append-only context threaded from the ingestion stage to the
//! execution stage.
//!
//! A `Context` is a value: [`Context::with_block`] consumes it and returns
//! the extended one, so the order in which blocks were added is visible at
//! every call site and nothing can rewrite a block after the fact.

use std::fmt;

use crate::error::ContextError;

/// Marker appended to blocks cut at the byte limit.
const TRUNCATION_MARKER: &str = "\n[... truncated]";

/// What a context block describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Which file to use and its declared columns
    FilePrompt,
    /// Raw excerpt (or full content) of the artifact
    ArtifactPreview,
    /// Model-written description of the artifact
    ArtifactDescription,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BlockKind::FilePrompt => "File",
            BlockKind::ArtifactPreview => "Data preview",
            BlockKind::ArtifactDescription => "Data description",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextBlock {
    pub kind: BlockKind,
    pub text: String,
}

/// Size bounds applied while the context grows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextLimits {
    pub max_blocks: usize,
    pub max_block_bytes: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_blocks: 8,
            max_block_bytes: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    blocks: Vec<ContextBlock>,
    limits: ContextLimits,
}

impl Context {
    pub fn new(limits: ContextLimits) -> Self {
        Self {
            blocks: Vec::new(),
            limits,
        }
    }

    /// Returns this context extended by one block.
    ///
    /// Text longer than `max_block_bytes` is cut on a char boundary and
    /// marked. Going past `max_blocks` is an error.
    pub fn with_block(mut self, kind: BlockKind, text: impl Into<String>) -> Result<Self, ContextError> {
        if self.blocks.len() >= self.limits.max_blocks {
            return Err(ContextError::TooManyBlocks {
                limit: self.limits.max_blocks,
            });
        }
        let text = bound(text.into(), self.limits.max_block_bytes);
        self.blocks.push(ContextBlock { kind, text });
        Ok(self)
    }

    pub fn blocks(&self) -> &[ContextBlock] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total bytes of block text.
    pub fn total_bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.text.len()).sum()
    }

    /// Renders the blocks as labelled sections, in insertion order.
    pub fn render(&self) -> String {
        self.blocks
            .iter()
            .map(|b| format!("## {}\n{}", b.kind, b.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn bound(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(TRUNCATION_MARKER);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_keep_insertion_order() {
        let context = Context::new(ContextLimits::default())
            .with_block(BlockKind::FilePrompt, "use data.csv")
            .unwrap()
            .with_block(BlockKind::ArtifactDescription, "10 rows")
            .unwrap();
        let kinds: Vec<BlockKind> = context.blocks().iter().map(|b| b.kind).collect();
        assert_eq!(kinds, [BlockKind::FilePrompt, BlockKind::ArtifactDescription]);
        assert_eq!(context.len(), 2);
        assert_eq!(context.total_bytes(), "use data.csv".len() + "10 rows".len());
    }

    #[test]
    fn test_extending_leaves_earlier_value_untouched() {
        let base = Context::new(ContextLimits::default())
            .with_block(BlockKind::FilePrompt, "use data.csv")
            .unwrap();
        let snapshot = base.clone();
        let extended = base.with_block(BlockKind::ArtifactDescription, "more").unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(extended.len(), 2);
        assert_eq!(extended.blocks()[0], snapshot.blocks()[0]);
    }

    #[test]
    fn test_block_count_limit() {
        let limits = ContextLimits {
            max_blocks: 1,
            max_block_bytes: 100,
        };
        let context = Context::new(limits)
            .with_block(BlockKind::FilePrompt, "a")
            .unwrap();
        let err = context.with_block(BlockKind::ArtifactDescription, "b").unwrap_err();
        assert_eq!(err, ContextError::TooManyBlocks { limit: 1 });
    }

    #[test]
    fn test_long_block_is_truncated() {
        let limits = ContextLimits {
            max_blocks: 4,
            max_block_bytes: 8,
        };
        let context = Context::new(limits)
            .with_block(BlockKind::ArtifactPreview, "x".repeat(50))
            .unwrap();
        let text = &context.blocks()[0].text;
        assert!(text.starts_with("xxxxxxxx"));
        assert!(text.ends_with("[... truncated]"));
    }

    #[test]
    fn test_render_labels_sections() {
        let context = Context::new(ContextLimits::default())
            .with_block(BlockKind::FilePrompt, "use data.csv")
            .unwrap()
            .with_block(BlockKind::ArtifactPreview, "a,b\n1,2")
            .unwrap();
        assert_eq!(
            context.render(),
            "## File\nuse data.csv\n\n## Data preview\na,b\n1,2"
        );
    }

    #[test]
    fn test_new_context_is_empty() {
        let context = Context::new(ContextLimits::default());
        assert!(context.is_empty());
        assert_eq!(context.render(), "");
    }
}
