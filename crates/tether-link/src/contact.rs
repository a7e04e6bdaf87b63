//! Contact card exchanged after the Noise handshake.
//!
//! The card is JSON sealed with the peer's [`NoiseSession`], so it only
//! travels once both sides hold authenticated transport keys.

use serde::{Deserialize, Serialize};

use tether_core::TETHER_VERSION;
use tether_crypto::NoiseSession;

use crate::error::CoordinatorError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCard {
    pub peer_id: String,
    pub display_name: String,
    pub version: u16,
}

impl ContactCard {
    pub fn new(peer_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
            version: TETHER_VERSION,
        }
    }

    pub fn seal(&self, session: &NoiseSession) -> Result<Vec<u8>, CoordinatorError> {
        let json =
            serde_json::to_vec(self).map_err(|e| CoordinatorError::Malformed(e.to_string()))?;
        Ok(session.encrypt(&json)?)
    }

    pub fn open(session: &NoiseSession, sealed: &[u8]) -> Result<Self, CoordinatorError> {
        let json = session.decrypt(sealed)?;
        let card: ContactCard = serde_json::from_slice(&json)
            .map_err(|e| CoordinatorError::Malformed(format!("contact card: {}", e)))?;

        if card.peer_id.is_empty() {
            return Err(CoordinatorError::Malformed("contact card without peer id".into()));
        }
        if card.version != TETHER_VERSION {
            return Err(CoordinatorError::Malformed(format!(
                "unsupported contact card version {}",
                card.version
            )));
        }
        Ok(card)
    }
}
