//! NoteBody: Loro document wrapper for the rich content of a single note.
//!
//! The body is a Loro document holding one movable tree, `blocks`. Each tree
//! node is a block; its metadata map holds:
//! - `type`: block kind name (`paragraph`, `heading`, ...)
//! - `level` / `checked`: kind-specific fields
//! - `text`: LoroText with inline style marks (`bold`, `italic`, ...)
//!
//! Sibling order uses fractional indexes, so concurrent inserts at the same
//! position are ordered by Loro's deterministic peer/counter tie-break on every
//! replica regardless of arrival order.

use crate::block::{push_run, Block, BlockContent, BlockError, BlockId, BlockKind, InlineStyle, TextRun};
use crate::markup::{self, MarkupError};
use crate::replica_id::ReplicaId;
use loro::{
    Container, ExpandType, ExportMode, LoroDoc, LoroMap, LoroText, LoroTree, LoroValue,
    StyleConfig, StyleConfigMap, TreeID, TreeParentId, ValueOrContainer, VersionVector,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

const BLOCKS: &str = "blocks";
const KEY_TYPE: &str = "type";
const KEY_LEVEL: &str = "level";
const KEY_CHECKED: &str = "checked";
const KEY_TEXT: &str = "text";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("Range {start}..{end} out of bounds for text of length {len}")]
    OutOfRange { start: usize, end: usize, len: usize },

    #[error("Invalid block: {0}")]
    InvalidBlock(#[from] BlockError),

    #[error("Malformed markup: {0}")]
    Markup(#[from] MarkupError),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

fn loro_err(e: impl std::fmt::Display) -> DocumentError {
    DocumentError::Loro(e.to_string())
}

/// A local mutation of the block tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum LocalEdit {
    /// Insert a new block as the `index`-th child of `parent` (None = top level).
    InsertBlock {
        parent: Option<BlockId>,
        index: usize,
        kind: BlockKind,
        text: String,
    },
    DeleteBlock {
        block: BlockId,
    },
    MoveBlock {
        block: BlockId,
        parent: Option<BlockId>,
        index: usize,
    },
    SetBlockKind {
        block: BlockId,
        kind: BlockKind,
    },
    /// Insert text at a character offset.
    InsertText {
        block: BlockId,
        pos: usize,
        text: String,
    },
    DeleteText {
        block: BlockId,
        pos: usize,
        len: usize,
    },
    /// Add (`enabled`) or remove a style over the character range `start..end`.
    FormatText {
        block: BlockId,
        start: usize,
        end: usize,
        style: InlineStyle,
        enabled: bool,
    },
}

/// Result of a local edit: the encoded operations to hand to the transport.
#[derive(Debug, Clone, Default)]
pub struct LocalChange {
    /// Loro update containing exactly the operations of this edit.
    /// Empty when the edit was a no-op.
    pub update: Vec<u8>,
    /// Id of the first block created by the edit, if any.
    pub created: Option<BlockId>,
}

impl LocalChange {
    pub fn is_empty(&self) -> bool {
        self.update.is_empty()
    }
}

/// The replicated rich content of one note.
pub struct NoteBody {
    doc: LoroDoc,
    replica: ReplicaId,
}

fn text_styles() -> StyleConfigMap {
    let mut styles = StyleConfigMap::new();
    for style in InlineStyle::ALL {
        // Typing at the end of bold text continues bold; inline code does not grow
        let expand = match style {
            InlineStyle::Code => ExpandType::None,
            _ => ExpandType::After,
        };
        styles.insert(style.key().into(), StyleConfig { expand });
    }
    styles
}

fn new_doc(peer: u64) -> Result<LoroDoc> {
    let doc = LoroDoc::new();
    doc.set_peer_id(peer).map_err(loro_err)?;
    // Style config is local, so every replica sets it before touching text
    doc.config_text_style(text_styles());
    doc.get_tree(BLOCKS).enable_fractional_index(0);
    Ok(doc)
}

fn parent_id(parent: Option<TreeID>) -> TreeParentId {
    match parent {
        Some(id) => TreeParentId::Node(id),
        None => TreeParentId::Root,
    }
}

impl NoteBody {
    /// Create an empty body owned by `replica`.
    pub fn new(replica: ReplicaId) -> Result<Self> {
        Ok(Self {
            doc: new_doc(replica.as_u64())?,
            replica,
        })
    }

    /// Build a body from flattened markup.
    ///
    /// The hydration operations are generated under a replica id derived from
    /// the note id and the markup, so two replicas hydrating the same snapshot
    /// produce identical operations and merge without duplicating content.
    /// Later edits use `replica`.
    pub fn hydrate(note_id: &str, markup_text: &str, replica: ReplicaId) -> Result<Self> {
        let content = markup::parse(markup_text)?;
        let hydration = ReplicaId::derived(&format!("{note_id}\n{markup_text}"));

        let mut body = Self {
            doc: new_doc(hydration.as_u64())?,
            replica,
        };
        body.write_content(None, 0, &content)?;
        body.doc.commit();
        body.doc.set_peer_id(replica.as_u64()).map_err(loro_err)?;

        debug!(
            "Hydrated note {} with {} top-level blocks (hydration replica {})",
            note_id,
            content.len(),
            hydration
        );
        Ok(body)
    }

    /// Rebuild a body from a Loro snapshot, keeping the full operation history.
    pub fn from_snapshot(bytes: &[u8], replica: ReplicaId) -> Result<Self> {
        let doc = new_doc(replica.as_u64())?;
        doc.import(bytes).map_err(loro_err)?;
        Ok(Self { doc, replica })
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    fn tree(&self) -> LoroTree {
        self.doc.get_tree(BLOCKS)
    }

    /// Apply a local edit immediately and return its encoded operations.
    pub fn apply_local_edit(&mut self, edit: &LocalEdit) -> Result<LocalChange> {
        let before = self.doc.oplog_vv();
        let tree = self.tree();

        let created = match edit {
            LocalEdit::InsertBlock {
                parent,
                index,
                kind,
                text,
            } => {
                let parent = parent.map(|p| self.require(p)).transpose()?;
                let content = BlockContent::new(*kind, vec![TextRun::plain(text.as_str())]);
                let ids = self.write_content(parent, *index, std::slice::from_ref(&content))?;
                ids.first().copied().map(BlockId::from)
            }
            LocalEdit::DeleteBlock { block } => {
                let id = self.require(*block)?;
                tree.delete(id).map_err(loro_err)?;
                None
            }
            LocalEdit::MoveBlock {
                block,
                parent,
                index,
            } => {
                let id = self.require(*block)?;
                let parent = parent.map(|p| self.require(p)).transpose()?;
                self.check_child_index(parent, *index)?;
                tree.mov_to(id, parent_id(parent), *index).map_err(loro_err)?;
                None
            }
            LocalEdit::SetBlockKind { block, kind } => {
                kind.validate()?;
                let id = self.require(*block)?;
                let meta = tree.get_meta(id).map_err(loro_err)?;
                write_kind(&meta, kind)?;
                None
            }
            LocalEdit::InsertText { block, pos, text } => {
                let content = self.text_of(*block)?;
                check_range(*pos, *pos, content.len_unicode())?;
                content.insert(*pos, text).map_err(loro_err)?;
                None
            }
            LocalEdit::DeleteText { block, pos, len } => {
                let content = self.text_of(*block)?;
                check_range(*pos, pos + len, content.len_unicode())?;
                content.delete(*pos, *len).map_err(loro_err)?;
                None
            }
            LocalEdit::FormatText {
                block,
                start,
                end,
                style,
                enabled,
            } => {
                let content = self.text_of(*block)?;
                check_range(*start, *end, content.len_unicode())?;
                if start < end {
                    if *enabled {
                        content.mark(*start..*end, style.key(), true).map_err(loro_err)?;
                    } else {
                        content.unmark(*start..*end, style.key()).map_err(loro_err)?;
                    }
                }
                None
            }
        };

        self.doc.commit();
        if self.doc.oplog_vv() == before {
            return Ok(LocalChange {
                update: Vec::new(),
                created,
            });
        }
        let update = self.export_updates(&before)?;
        Ok(LocalChange { update, created })
    }

    /// Insert parsed content as children of `parent` starting at `index`.
    pub fn insert_content(
        &mut self,
        parent: Option<BlockId>,
        index: usize,
        content: &[BlockContent],
    ) -> Result<LocalChange> {
        let before = self.doc.oplog_vv();
        let parent = parent.map(|p| self.require(p)).transpose()?;
        let ids = self.write_content(parent, index, content)?;
        self.doc.commit();
        Ok(LocalChange {
            update: self.export_updates(&before)?,
            created: ids.first().copied().map(BlockId::from),
        })
    }

    /// Integrate a peer's encoded operations (update or snapshot).
    ///
    /// Idempotent: importing operations that are already known changes nothing.
    /// Returns whether any new operation was integrated.
    pub fn apply_remote(&mut self, update: &[u8]) -> Result<bool> {
        let before = self.doc.oplog_vv();
        self.doc.import(update).map_err(loro_err)?;
        Ok(self.doc.oplog_vv() != before)
    }

    /// Flatten the visible content to markup.
    pub fn serialize(&self) -> String {
        markup::write(&self.contents())
    }

    /// Visible content as a block tree.
    pub fn blocks(&self) -> Vec<Block> {
        let tree = self.tree();
        tree.children(TreeParentId::Root)
            .unwrap_or_default()
            .into_iter()
            .map(|id| read_block(&tree, id))
            .collect()
    }

    /// Visible content without node ids.
    pub fn contents(&self) -> Vec<BlockContent> {
        self.blocks().iter().map(Block::to_content).collect()
    }

    /// Look up a single block (with its subtree).
    pub fn block(&self, id: BlockId) -> Option<Block> {
        let tree = self.tree();
        let tid: TreeID = id.into();
        if !self.is_live(&tree, tid) {
            return None;
        }
        Some(read_block(&tree, tid))
    }

    /// Parent and sibling index of a live block.
    pub fn position(&self, id: BlockId) -> Option<(Option<BlockId>, usize)> {
        let tree = self.tree();
        let tid: TreeID = id.into();
        if !self.is_live(&tree, tid) {
            return None;
        }
        let parent = match tree.parent(tid)? {
            TreeParentId::Node(p) => Some(p),
            TreeParentId::Root => None,
            _ => return None,
        };
        let index = tree
            .children(parent_id(parent))?
            .iter()
            .position(|c| *c == tid)?;
        Some((parent.map(BlockId::from), index))
    }

    /// Plain text, one line per block.
    pub fn plain_text(&self) -> String {
        markup::to_plain_text(&self.contents())
    }

    pub fn is_empty(&self) -> bool {
        self.tree()
            .children(TreeParentId::Root)
            .is_none_or(|c| c.is_empty())
    }

    /// Current version vector (all known operations).
    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    /// Whether this body holds operations not covered by `other`.
    pub fn is_ahead_of(&self, other: &VersionVector) -> bool {
        self.doc
            .oplog_vv()
            .iter()
            .any(|(peer, counter)| other.get(peer).copied().unwrap_or(0) < *counter)
    }

    /// Export full snapshot.
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.doc.export(ExportMode::Snapshot).map_err(loro_err)
    }

    /// Export operations since a version.
    pub fn export_updates(&self, from: &VersionVector) -> Result<Vec<u8>> {
        self.doc.export(ExportMode::updates(from)).map_err(loro_err)
    }

    fn is_live(&self, tree: &LoroTree, id: TreeID) -> bool {
        tree.contains(id) && !tree.is_node_deleted(&id).unwrap_or(true)
    }

    fn require(&self, id: BlockId) -> Result<TreeID> {
        let tid: TreeID = id.into();
        if self.is_live(&self.tree(), tid) {
            Ok(tid)
        } else {
            Err(DocumentError::BlockNotFound(id))
        }
    }

    fn check_child_index(&self, parent: Option<TreeID>, index: usize) -> Result<()> {
        let count = self
            .tree()
            .children(parent_id(parent))
            .map_or(0, |c| c.len());
        check_range(index, index, count)
    }

    fn text_of(&self, block: BlockId) -> Result<LoroText> {
        let id = self.require(block)?;
        let meta = self.tree().get_meta(id).map_err(loro_err)?;
        meta.get_or_create_container(KEY_TEXT, LoroText::new())
            .map_err(loro_err)
    }

    /// Create nodes for `content` under `parent`, depth-first. Does not commit.
    fn write_content(
        &mut self,
        parent: Option<TreeID>,
        index: usize,
        content: &[BlockContent],
    ) -> Result<Vec<TreeID>> {
        self.check_child_index(parent, index)?;
        let tree = self.tree();
        let mut created = Vec::with_capacity(content.len());

        for (offset, block) in content.iter().enumerate() {
            block.kind.validate()?;
            let node = tree
                .create_at(parent_id(parent), index + offset)
                .map_err(loro_err)?;
            let meta = tree.get_meta(node).map_err(loro_err)?;
            write_kind(&meta, &block.kind)?;
            let text = meta
                .insert_container(KEY_TEXT, LoroText::new())
                .map_err(loro_err)?;
            write_runs(&text, &block.runs)?;
            self.write_content(Some(node), 0, &block.children)?;
            created.push(node);
        }
        Ok(created)
    }
}

fn check_range(start: usize, end: usize, len: usize) -> Result<()> {
    if start > end || end > len {
        return Err(DocumentError::OutOfRange { start, end, len });
    }
    Ok(())
}

fn write_kind(meta: &LoroMap, kind: &BlockKind) -> Result<()> {
    meta.insert(KEY_TYPE, kind.type_name()).map_err(loro_err)?;

    match kind {
        BlockKind::Heading { level } => {
            meta.insert(KEY_LEVEL, *level as i64).map_err(loro_err)?;
        }
        _ if meta.get(KEY_LEVEL).is_some() => meta.delete(KEY_LEVEL).map_err(loro_err)?,
        _ => {}
    }
    match kind {
        BlockKind::CheckItem { checked } => {
            meta.insert(KEY_CHECKED, *checked).map_err(loro_err)?;
        }
        _ if meta.get(KEY_CHECKED).is_some() => meta.delete(KEY_CHECKED).map_err(loro_err)?,
        _ => {}
    }
    Ok(())
}

fn write_runs(text: &LoroText, runs: &[TextRun]) -> Result<()> {
    // Insert all text before marking so expanding marks don't swallow later runs
    let full: String = runs.iter().map(|r| r.text.as_str()).collect();
    if full.is_empty() {
        return Ok(());
    }
    text.insert(0, &full).map_err(loro_err)?;

    let mut pos = 0;
    for run in runs {
        let len = run.text.chars().count();
        for style in &run.styles {
            text.mark(pos..pos + len, style.key(), true)
                .map_err(loro_err)?;
        }
        pos += len;
    }
    Ok(())
}

fn meta_value(meta: &LoroMap, key: &str) -> Option<LoroValue> {
    match meta.get(key)? {
        ValueOrContainer::Value(v) => Some(v),
        _ => None,
    }
}

fn read_kind(meta: &LoroMap) -> BlockKind {
    let type_name = match meta_value(meta, KEY_TYPE) {
        Some(LoroValue::String(s)) => s.to_string(),
        _ => return BlockKind::Paragraph,
    };
    let level = match meta_value(meta, KEY_LEVEL) {
        Some(LoroValue::I64(n)) => Some(n),
        _ => None,
    };
    let checked = match meta_value(meta, KEY_CHECKED) {
        Some(LoroValue::Bool(b)) => Some(b),
        _ => None,
    };

    BlockKind::from_parts(&type_name, level, checked).unwrap_or_else(|e| {
        debug!("Reading block as paragraph: {}", e);
        BlockKind::Paragraph
    })
}

fn read_runs(text: &LoroText) -> Vec<TextRun> {
    let mut runs = Vec::new();
    let LoroValue::List(items) = text.get_richtext_value() else {
        return runs;
    };

    for item in items.iter() {
        let LoroValue::Map(span) = item else {
            continue;
        };
        let Some(LoroValue::String(insert)) = span.get("insert") else {
            continue;
        };
        let mut styles = BTreeSet::new();
        if let Some(LoroValue::Map(attributes)) = span.get("attributes") {
            for (key, value) in attributes.iter() {
                if matches!(value, LoroValue::Bool(true)) {
                    if let Some(style) = InlineStyle::from_key(key) {
                        styles.insert(style);
                    }
                }
            }
        }
        push_run(
            &mut runs,
            TextRun {
                text: insert.to_string(),
                styles,
            },
        );
    }
    runs
}

fn read_block(tree: &LoroTree, id: TreeID) -> Block {
    let (kind, runs) = match tree.get_meta(id) {
        Ok(meta) => {
            let runs = match meta.get(KEY_TEXT) {
                Some(ValueOrContainer::Container(Container::Text(text))) => read_runs(&text),
                _ => Vec::new(),
            };
            (read_kind(&meta), runs)
        }
        Err(_) => (BlockKind::Paragraph, Vec::new()),
    };

    let children = tree
        .children(TreeParentId::Node(id))
        .unwrap_or_default()
        .into_iter()
        .map(|child| read_block(tree, child))
        .collect();

    Block {
        id: id.into(),
        kind,
        runs,
        children,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(n: u64) -> ReplicaId {
        ReplicaId::from(n)
    }

    fn insert_paragraph(body: &mut NoteBody, index: usize, text: &str) -> BlockId {
        body.apply_local_edit(&LocalEdit::InsertBlock {
            parent: None,
            index,
            kind: BlockKind::Paragraph,
            text: text.to_string(),
        })
        .unwrap()
        .created
        .unwrap()
    }

    #[test]
    fn test_new_body_is_empty() {
        let body = NoteBody::new(replica(1)).unwrap();
        assert!(body.is_empty());
        assert_eq!(body.serialize(), "");
        assert_eq!(body.plain_text(), "");
    }

    #[test]
    fn test_insert_and_edit_text() {
        let mut body = NoteBody::new(replica(1)).unwrap();
        let id = insert_paragraph(&mut body, 0, "Hello");

        body.apply_local_edit(&LocalEdit::InsertText {
            block: id,
            pos: 5,
            text: " world".to_string(),
        })
        .unwrap();
        body.apply_local_edit(&LocalEdit::DeleteText {
            block: id,
            pos: 0,
            len: 1,
        })
        .unwrap();

        assert_eq!(body.plain_text(), "ello world");
        assert_eq!(body.serialize(), "<p>ello world</p>");
    }

    #[test]
    fn test_format_text() {
        let mut body = NoteBody::new(replica(1)).unwrap();
        let id = insert_paragraph(&mut body, 0, "Hello world");

        body.apply_local_edit(&LocalEdit::FormatText {
            block: id,
            start: 6,
            end: 11,
            style: InlineStyle::Bold,
            enabled: true,
        })
        .unwrap();

        assert_eq!(body.serialize(), "<p>Hello <strong>world</strong></p>");

        body.apply_local_edit(&LocalEdit::FormatText {
            block: id,
            start: 6,
            end: 11,
            style: InlineStyle::Bold,
            enabled: false,
        })
        .unwrap();
        assert_eq!(body.serialize(), "<p>Hello world</p>");
    }

    #[test]
    fn test_set_block_kind_replaces_fields() {
        let mut body = NoteBody::new(replica(1)).unwrap();
        let id = insert_paragraph(&mut body, 0, "task");

        body.apply_local_edit(&LocalEdit::SetBlockKind {
            block: id,
            kind: BlockKind::CheckItem { checked: true },
        })
        .unwrap();
        assert_eq!(body.blocks()[0].kind, BlockKind::CheckItem { checked: true });

        body.apply_local_edit(&LocalEdit::SetBlockKind {
            block: id,
            kind: BlockKind::Heading { level: 2 },
        })
        .unwrap();
        assert_eq!(body.serialize(), "<h2>task</h2>");

        let err = body
            .apply_local_edit(&LocalEdit::SetBlockKind {
                block: id,
                kind: BlockKind::Heading { level: 9 },
            })
            .unwrap_err();
        assert!(matches!(err, DocumentError::InvalidBlock(_)));
    }

    #[test]
    fn test_move_and_delete_blocks() {
        let mut body = NoteBody::new(replica(1)).unwrap();
        let a = insert_paragraph(&mut body, 0, "a");
        let b = insert_paragraph(&mut body, 1, "b");
        let c = insert_paragraph(&mut body, 2, "c");

        body.apply_local_edit(&LocalEdit::MoveBlock {
            block: c,
            parent: None,
            index: 0,
        })
        .unwrap();
        assert_eq!(body.plain_text(), "c\na\nb");

        body.apply_local_edit(&LocalEdit::MoveBlock {
            block: b,
            parent: Some(a),
            index: 0,
        })
        .unwrap();
        assert_eq!(body.position(b), Some((Some(a), 0)));

        body.apply_local_edit(&LocalEdit::DeleteBlock { block: a }).unwrap();
        assert_eq!(body.plain_text(), "c");
        assert!(body.block(a).is_none());
    }

    #[test]
    fn test_invalid_edits() {
        let mut body = NoteBody::new(replica(1)).unwrap();
        let id = insert_paragraph(&mut body, 0, "abc");

        let err = body
            .apply_local_edit(&LocalEdit::InsertText {
                block: id,
                pos: 4,
                text: "x".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, DocumentError::OutOfRange { len: 3, .. }));

        let missing = BlockId { peer: 99, counter: 0 };
        let err = body
            .apply_local_edit(&LocalEdit::DeleteBlock { block: missing })
            .unwrap_err();
        assert!(matches!(err, DocumentError::BlockNotFound(_)));

        let err = body
            .apply_local_edit(&LocalEdit::InsertBlock {
                parent: None,
                index: 5,
                kind: BlockKind::Paragraph,
                text: String::new(),
            })
            .unwrap_err();
        assert!(matches!(err, DocumentError::OutOfRange { .. }));
    }

    #[test]
    fn test_hydrate_and_serialize() {
        let html = "<h1>Plan</h1><ul><li>one<ul><li>nested</li></ul></li></ul><p>a <em>b</em></p>";
        let body = NoteBody::hydrate("n1", html, replica(1)).unwrap();

        assert_eq!(body.serialize(), html);
        assert_eq!(body.blocks()[1].children.len(), 1);
        assert_eq!(body.replica(), replica(1));
    }

    #[test]
    fn test_hydrate_malformed_is_error() {
        let err = NoteBody::hydrate("n1", "<p>broken", replica(1)).err();
        assert!(matches!(err, Some(DocumentError::Markup(_))));
    }

    #[test]
    fn test_independent_hydrations_merge_without_duplicates() {
        let html = "<p>shared</p><p>content</p>";
        let mut a = NoteBody::hydrate("n1", html, replica(1)).unwrap();
        let b = NoteBody::hydrate("n1", html, replica(2)).unwrap();

        a.apply_remote(&b.export_snapshot().unwrap()).unwrap();
        assert_eq!(a.plain_text(), "shared\ncontent");
    }

    #[test]
    fn test_local_change_is_transport_payload() {
        let mut a = NoteBody::new(replica(1)).unwrap();
        let mut b = NoteBody::new(replica(2)).unwrap();

        let change = a
            .apply_local_edit(&LocalEdit::InsertBlock {
                parent: None,
                index: 0,
                kind: BlockKind::Quote,
                text: "quoted".to_string(),
            })
            .unwrap();
        assert!(!change.is_empty());

        assert!(b.apply_remote(&change.update).unwrap());
        assert_eq!(b.serialize(), "<blockquote>quoted</blockquote>");
        assert_eq!(b.blocks(), a.blocks());
    }

    #[test]
    fn test_apply_remote_is_idempotent() {
        let mut a = NoteBody::new(replica(1)).unwrap();
        let mut b = NoteBody::new(replica(2)).unwrap();
        let change = a
            .apply_local_edit(&LocalEdit::InsertBlock {
                parent: None,
                index: 0,
                kind: BlockKind::Paragraph,
                text: "once".to_string(),
            })
            .unwrap();

        assert!(b.apply_remote(&change.update).unwrap());
        assert!(!b.apply_remote(&change.update).unwrap());
        assert_eq!(b.plain_text(), "once");
    }

    #[test]
    fn test_concurrent_insert_same_position_converges() {
        let mut base = NoteBody::new(replica(1)).unwrap();
        let id = insert_paragraph(&mut base, 0, "");
        let snapshot = base.export_snapshot().unwrap();

        let mut r1 = NoteBody::from_snapshot(&snapshot, replica(10)).unwrap();
        let mut r2 = NoteBody::from_snapshot(&snapshot, replica(20)).unwrap();

        let op1 = r1
            .apply_local_edit(&LocalEdit::InsertText {
                block: id,
                pos: 0,
                text: "left".to_string(),
            })
            .unwrap();
        let op2 = r2
            .apply_local_edit(&LocalEdit::InsertText {
                block: id,
                pos: 0,
                text: "right".to_string(),
            })
            .unwrap();

        r1.apply_remote(&op2.update).unwrap();
        r2.apply_remote(&op1.update).unwrap();

        assert_eq!(r1.plain_text(), r2.plain_text());
        assert_eq!(r1.plain_text().len(), "leftright".len());
    }

    #[test]
    fn test_is_ahead_of() {
        let mut a = NoteBody::new(replica(1)).unwrap();
        let b = NoteBody::new(replica(2)).unwrap();
        assert!(!a.is_ahead_of(&b.version()));

        insert_paragraph(&mut a, 0, "x");
        assert!(a.is_ahead_of(&b.version()));
        assert!(!a.is_ahead_of(&a.version()));
    }
}
