//! Text enhancement of selected blocks through an external service.
//!
//! The selection is sent as plain text (one line per block). When the reply
//! has as many lines as there were blocks, each block keeps its kind and only
//! its text is replaced. Otherwise the selected blocks are replaced by the
//! reply, parsed as markup when it is markup and as paragraphs when not.

use crate::block::{Block, BlockId};
use crate::config::CollabConfig;
use crate::document::{DocumentError, LocalChange, LocalEdit, NoteBody};
use crate::error::ActionError;
use crate::markup;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum EnhanceError {
    #[error("Enhancement request failed: {0}")]
    Request(String),

    #[error("Enhancement service returned status {0}")]
    Status(u16),

    #[error("Nothing selected to enhance")]
    EmptySelection,

    #[error("Selection changed while it was being enhanced")]
    SelectionChanged,

    #[error(transparent)]
    Document(#[from] DocumentError),
}

pub type Result<T> = std::result::Result<T, EnhanceError>;

impl From<EnhanceError> for ActionError {
    fn from(e: EnhanceError) -> Self {
        match e {
            EnhanceError::EmptySelection | EnhanceError::SelectionChanged => {
                ActionError::InvalidInput(e.to_string())
            }
            EnhanceError::Document(e) => e.into(),
            other => ActionError::TransportDisconnected(other.to_string()),
        }
    }
}

/// Rewrites plain text.
#[async_trait]
pub trait TextEnhancer: Send + Sync {
    async fn enhance(&self, text: &str) -> Result<String>;
}

#[derive(Serialize)]
struct EnhanceRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnhanceResponse {
    enhanced_text: String,
}

/// `TextEnhancer` backed by an HTTP endpoint taking `{"text"}` and
/// answering `{"enhancedText"}`.
pub struct HttpEnhancer {
    client: reqwest::Client,
    url: String,
}

impl HttpEnhancer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// None when no enhancement endpoint is configured.
    pub fn from_config(config: &CollabConfig) -> Option<Self> {
        config.enhance_url.as_deref().map(Self::new)
    }
}

#[async_trait]
impl TextEnhancer for HttpEnhancer {
    async fn enhance(&self, text: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.url)
            .json(&EnhanceRequest { text })
            .send()
            .await
            .map_err(|e| EnhanceError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EnhanceError::Status(status.as_u16()));
        }

        let body: EnhanceResponse = response
            .json()
            .await
            .map_err(|e| EnhanceError::Request(e.to_string()))?;
        Ok(body.enhanced_text.trim().to_string())
    }
}

/// The selected blocks in document order, with the text sent for enhancement.
pub fn selection_text(body: &NoteBody, ids: &[BlockId]) -> Result<(Vec<Block>, String)> {
    if ids.is_empty() {
        return Err(EnhanceError::EmptySelection);
    }
    let wanted: HashSet<BlockId> = ids.iter().copied().collect();

    let mut selected = Vec::new();
    let mut stack: Vec<Block> = body.blocks().into_iter().rev().collect();
    while let Some(block) = stack.pop() {
        stack.extend(block.children.iter().rev().cloned());
        if wanted.contains(&block.id) {
            selected.push(block);
        }
    }

    if let Some(missing) = ids.iter().find(|id| !selected.iter().any(|b| b.id == **id)) {
        return Err(DocumentError::BlockNotFound(*missing).into());
    }

    let text = selected
        .iter()
        .map(Block::text)
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        return Err(EnhanceError::EmptySelection);
    }
    Ok((selected, text))
}

/// Fail unless every selected block still holds the text that was sent.
fn check_selection(body: &NoteBody, selected: &[Block]) -> Result<()> {
    for block in selected {
        let current = body.block(block.id).ok_or(EnhanceError::SelectionChanged)?;
        if current.text() != block.text() {
            debug!("Block {} was edited during enhancement", block.id);
            return Err(EnhanceError::SelectionChanged);
        }
    }
    Ok(())
}

/// Write an enhancement result over the selected blocks.
///
/// The selection is checked against the current body first; if a peer
/// edited or removed any selected block in the meantime nothing is written.
pub fn apply_enhancement(body: &mut NoteBody, selected: &[Block], enhanced: &str) -> Result<LocalChange> {
    check_selection(body, selected)?;
    let before = body.version();
    let lines: Vec<&str> = enhanced
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    if lines.len() == selected.len() {
        for (block, line) in selected.iter().zip(&lines) {
            let len = block.text().chars().count();
            if len > 0 {
                body.apply_local_edit(&LocalEdit::DeleteText {
                    block: block.id,
                    pos: 0,
                    len,
                })?;
            }
            body.apply_local_edit(&LocalEdit::InsertText {
                block: block.id,
                pos: 0,
                text: line.to_string(),
            })?;
        }
        debug!("Enhanced {} blocks in place", selected.len());
    } else {
        let content = match markup::parse(enhanced) {
            Ok(content) if enhanced.trim_start().starts_with('<') => content,
            _ => markup::from_plain_text(enhanced),
        };
        let first = selected.first().ok_or(EnhanceError::EmptySelection)?;
        let (parent, index) = body
            .position(first.id)
            .ok_or(DocumentError::BlockNotFound(first.id))?;

        body.insert_content(parent, index, &content)?;
        for block in selected {
            // A block nested under an earlier selected block is already gone
            if body.block(block.id).is_some() {
                body.apply_local_edit(&LocalEdit::DeleteBlock { block: block.id })?;
            }
        }
        info!(
            "Replaced {} blocks with {} enhanced blocks",
            selected.len(),
            content.len()
        );
    }

    Ok(LocalChange {
        update: body.export_updates(&before)?,
        created: None,
    })
}

/// Enhance the given blocks of a body.
pub async fn enhance_blocks(
    body: &mut NoteBody,
    ids: &[BlockId],
    enhancer: &dyn TextEnhancer,
) -> Result<LocalChange> {
    let (selected, text) = selection_text(body, ids)?;
    let enhanced = enhancer.enhance(&text).await?;
    apply_enhancement(body, &selected, &enhanced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockKind;
    use crate::replica_id::ReplicaId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Upper;

    #[async_trait]
    impl TextEnhancer for Upper {
        async fn enhance(&self, text: &str) -> Result<String> {
            Ok(text.to_uppercase())
        }
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl TextEnhancer for Fixed {
        async fn enhance(&self, _text: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn body_with(markup_text: &str) -> (NoteBody, Vec<BlockId>) {
        let body = NoteBody::hydrate("n1", markup_text, ReplicaId::from(1)).unwrap();
        let ids = body.blocks().iter().map(|b| b.id).collect();
        (body, ids)
    }

    #[tokio::test]
    async fn test_line_count_match_keeps_kinds() {
        let (mut body, ids) = body_with("<h2>title</h2><ul><li>item</li></ul><p>rest</p>");
        let change = enhance_blocks(&mut body, &ids[..2], &Upper).await.unwrap();
        assert!(!change.is_empty());

        let blocks = body.blocks();
        assert_eq!(blocks[0].kind, BlockKind::Heading { level: 2 });
        assert_eq!(blocks[0].text(), "TITLE");
        assert_eq!(blocks[1].kind, BlockKind::BulletItem);
        assert_eq!(blocks[1].text(), "ITEM");
        assert_eq!(blocks[2].text(), "rest");
    }

    #[tokio::test]
    async fn test_line_count_mismatch_replaces_blocks() {
        let (mut body, ids) = body_with("<p>keep</p><p>one</p><p>two</p>");
        enhance_blocks(&mut body, &ids[1..], &Fixed("merged into one"))
            .await
            .unwrap();
        assert_eq!(body.plain_text(), "keep\nmerged into one");

        let (mut body, ids) = body_with("<p>a</p>");
        enhance_blocks(&mut body, &ids, &Fixed("<h1>Head</h1><p>para</p>"))
            .await
            .unwrap();
        let blocks = body.blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].kind, BlockKind::Heading { level: 1 });
    }

    #[tokio::test]
    async fn test_empty_and_unknown_selection() {
        let (mut body, _) = body_with("<p>a</p>");
        assert!(matches!(
            enhance_blocks(&mut body, &[], &Upper).await,
            Err(EnhanceError::EmptySelection)
        ));
        let bogus = BlockId {
            peer: 99,
            counter: 0,
        };
        assert!(matches!(
            enhance_blocks(&mut body, &[bogus], &Upper).await,
            Err(EnhanceError::Document(DocumentError::BlockNotFound(_)))
        ));
    }

    #[test]
    fn test_edited_selection_is_left_untouched() {
        let (mut body, ids) = body_with("<p>one</p><p>two</p>");
        let (selected, text) = selection_text(&body, &ids).unwrap();
        assert_eq!(text, "one\ntwo");

        // A peer trims the second block while the service is working
        body.apply_local_edit(&LocalEdit::DeleteText {
            block: ids[1],
            pos: 1,
            len: 2,
        })
        .unwrap();
        let version = body.version();

        let err = apply_enhancement(&mut body, &selected, "ONE\nTWO").unwrap_err();
        assert!(matches!(err, EnhanceError::SelectionChanged));
        assert_eq!(body.plain_text(), "one\nt");
        assert_eq!(body.version(), version);

        body.apply_local_edit(&LocalEdit::DeleteBlock { block: ids[0] })
            .unwrap();
        assert!(matches!(
            apply_enhancement(&mut body, &selected, "x"),
            Err(EnhanceError::SelectionChanged)
        ));
    }

    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/api/enhance-text")
    }

    #[tokio::test]
    async fn test_http_enhancer() {
        let url = serve_once("200 OK", r#"{"enhancedText":" Better text. "}"#).await;
        let enhancer = HttpEnhancer::new(url);
        assert_eq!(enhancer.enhance("better txt").await.unwrap(), "Better text.");

        let url = serve_once("500 Internal Server Error", "{}").await;
        let enhancer = HttpEnhancer::new(url);
        assert!(matches!(
            enhancer.enhance("x").await,
            Err(EnhanceError::Status(500))
        ));
    }
}
