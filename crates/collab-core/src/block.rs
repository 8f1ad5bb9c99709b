//! Block model: the typed shape of a note body.
//!
//! A note body is a tree of blocks. Each block has a kind (paragraph, heading,
//! list item, ...) and a sequence of styled text runs. `Block` is the projection
//! read out of a live body (it carries CRDT node ids); `BlockContent` is the
//! id-less form produced by markup parsing and consumed by hydration.

use loro::TreeID;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum BlockError {
    #[error("Heading level must be 1-3, got {0}")]
    InvalidHeadingLevel(i64),

    #[error("Unknown block type: {0}")]
    UnknownKind(String),
}

/// Stable identifier of a block node, shared by every replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    pub peer: u64,
    pub counter: i32,
}

impl From<TreeID> for BlockId {
    fn from(id: TreeID) -> Self {
        Self {
            peer: id.peer,
            counter: id.counter,
        }
    }
}

impl From<BlockId> for TreeID {
    fn from(id: BlockId) -> Self {
        TreeID {
            peer: id.peer,
            counter: id.counter,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:x}", self.counter, self.peer)
    }
}

/// Block type. Serialized into the node metadata as `type` (+ `level`/`checked`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BlockKind {
    Paragraph,
    Heading { level: u8 },
    BulletItem,
    NumberedItem,
    CheckItem { checked: bool },
    Quote,
    Code,
}

impl BlockKind {
    /// Name stored under the `type` metadata key.
    pub fn type_name(&self) -> &'static str {
        match self {
            BlockKind::Paragraph => "paragraph",
            BlockKind::Heading { .. } => "heading",
            BlockKind::BulletItem => "bulletListItem",
            BlockKind::NumberedItem => "numberedListItem",
            BlockKind::CheckItem { .. } => "checkListItem",
            BlockKind::Quote => "quote",
            BlockKind::Code => "codeBlock",
        }
    }

    /// Rebuild a kind from its stored metadata fields.
    pub fn from_parts(type_name: &str, level: Option<i64>, checked: Option<bool>) -> Result<Self, BlockError> {
        Ok(match type_name {
            "paragraph" => BlockKind::Paragraph,
            "heading" => {
                let level = level.unwrap_or(1);
                if !(1..=3).contains(&level) {
                    return Err(BlockError::InvalidHeadingLevel(level));
                }
                BlockKind::Heading { level: level as u8 }
            }
            "bulletListItem" => BlockKind::BulletItem,
            "numberedListItem" => BlockKind::NumberedItem,
            "checkListItem" => BlockKind::CheckItem {
                checked: checked.unwrap_or(false),
            },
            "quote" => BlockKind::Quote,
            "codeBlock" => BlockKind::Code,
            other => return Err(BlockError::UnknownKind(other.to_string())),
        })
    }

    /// Check the kind is representable (heading levels are 1-3).
    pub fn validate(&self) -> Result<(), BlockError> {
        match self {
            BlockKind::Heading { level } if !(1..=3).contains(level) => {
                Err(BlockError::InvalidHeadingLevel(*level as i64))
            }
            _ => Ok(()),
        }
    }

    pub fn is_list_item(&self) -> bool {
        matches!(
            self,
            BlockKind::BulletItem | BlockKind::NumberedItem | BlockKind::CheckItem { .. }
        )
    }
}

/// Inline text style, stored as a rich-text mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InlineStyle {
    Bold,
    Italic,
    Underline,
    Strike,
    Code,
}

impl InlineStyle {
    pub const ALL: [InlineStyle; 5] = [
        InlineStyle::Bold,
        InlineStyle::Italic,
        InlineStyle::Underline,
        InlineStyle::Strike,
        InlineStyle::Code,
    ];

    /// Mark key in the rich-text container.
    pub fn key(&self) -> &'static str {
        match self {
            InlineStyle::Bold => "bold",
            InlineStyle::Italic => "italic",
            InlineStyle::Underline => "underline",
            InlineStyle::Strike => "strike",
            InlineStyle::Code => "code",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.key() == key)
    }
}

/// A run of text sharing one set of inline styles.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub styles: BTreeSet<InlineStyle>,
}

impl TextRun {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            styles: BTreeSet::new(),
        }
    }

    pub fn styled(text: impl Into<String>, styles: impl IntoIterator<Item = InlineStyle>) -> Self {
        Self {
            text: text.into(),
            styles: styles.into_iter().collect(),
        }
    }
}

/// Append a run, merging it into the previous one when the styles match.
pub fn push_run(runs: &mut Vec<TextRun>, run: TextRun) {
    if run.text.is_empty() {
        return;
    }
    match runs.last_mut() {
        Some(last) if last.styles == run.styles => last.text.push_str(&run.text),
        _ => runs.push(run),
    }
}

/// Concatenated text of a run list.
pub fn runs_text(runs: &[TextRun]) -> String {
    runs.iter().map(|r| r.text.as_str()).collect()
}

/// A block read out of a live note body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    #[serde(flatten)]
    pub kind: BlockKind,
    pub runs: Vec<TextRun>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Block>,
}

impl Block {
    pub fn text(&self) -> String {
        runs_text(&self.runs)
    }

    /// Drop node ids, keeping kind, runs and children.
    pub fn to_content(&self) -> BlockContent {
        BlockContent {
            kind: self.kind,
            runs: self.runs.clone(),
            children: self.children.iter().map(Block::to_content).collect(),
        }
    }
}

/// Block content without identity, as parsed from markup.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockContent {
    pub kind: BlockKind,
    pub runs: Vec<TextRun>,
    pub children: Vec<BlockContent>,
}

impl BlockContent {
    pub fn new(kind: BlockKind, runs: Vec<TextRun>) -> Self {
        Self {
            kind,
            runs,
            children: Vec::new(),
        }
    }

    pub fn paragraph(text: impl Into<String>) -> Self {
        Self::new(BlockKind::Paragraph, vec![TextRun::plain(text)])
    }

    pub fn text(&self) -> String {
        runs_text(&self.runs)
    }
}
