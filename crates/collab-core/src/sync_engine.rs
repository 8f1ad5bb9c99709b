//! Sync engine: the request/response/update protocol over a `NoteBody`.
//!
//! The same engine runs on both ends of a relay connection:
//!
//! 1. On (re)join, the replica sends `SyncRequest` with its version vector
//! 2. The room answers `SyncResponse`: the updates the replica is missing,
//!    plus the room's own version vector
//! 3. The replica imports those updates, then pushes an `Update` with
//!    whatever the room lacks (edits made while disconnected)
//! 4. Every later local edit travels as an `Update`, which the room imports
//!    and fans out to the other members
//!
//! Because the body is a CRDT, steps 3 and 4 may interleave in any order.

use crate::document::NoteBody;
use crate::sync::{Result, SyncError, SyncMessage};
use loro::VersionVector;
use tracing::debug;

fn decode_version(bytes: &[u8]) -> Result<VersionVector> {
    VersionVector::decode(bytes).map_err(|e| SyncError::InvalidVersion(e.to_string()))
}

impl NoteBody {
    /// Build the message that opens a sync exchange.
    pub fn prepare_sync_request(&self) -> SyncMessage {
        SyncMessage::SyncRequest {
            version: self.version().encode(),
        }
    }

    /// Process an incoming sync message.
    ///
    /// Returns the reply to send back to the sender (if any) and whether the
    /// body's content changed.
    pub fn process_sync_message(&mut self, msg: SyncMessage) -> Result<(Option<SyncMessage>, bool)> {
        match msg {
            SyncMessage::SyncRequest { version } => {
                let theirs = decode_version(&version)?;
                let updates = self.export_updates(&theirs)?;
                debug!("SyncRequest: answering with {} bytes of updates", updates.len());
                Ok((
                    Some(SyncMessage::SyncResponse {
                        updates,
                        version: self.version().encode(),
                    }),
                    false,
                ))
            }

            SyncMessage::SyncResponse { updates, version } => {
                let changed = if updates.is_empty() {
                    false
                } else {
                    self.apply_remote(&updates)?
                };

                let theirs = decode_version(&version)?;
                let reply = if self.is_ahead_of(&theirs) {
                    let data = self.export_updates(&theirs)?;
                    debug!("SyncResponse: pushing back {} bytes the peer lacks", data.len());
                    Some(SyncMessage::Update { data })
                } else {
                    None
                };
                Ok((reply, changed))
            }

            SyncMessage::Update { data } => {
                let changed = self.apply_remote(&data)?;
                Ok((None, changed))
            }
        }
    }
}
