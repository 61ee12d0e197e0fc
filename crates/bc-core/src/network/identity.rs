//! Peer Identity Management
//!
//! Handles generation, storage, and parsing of the opaque identity token
//! exchanged in every connection handshake.

use bytes::Bytes;
use rand::RngCore;
use std::path::Path;
use std::str::FromStr;

use crate::error::{BeaconError, Result};

/// Length of a randomly generated identity
pub const ID_LEN: usize = 32;

/// Opaque identity token of a peer
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerId(Bytes);

impl PeerId {
    /// Generate a new random identity
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(Bytes::copy_from_slice(&bytes))
    }

    /// Wrap caller-supplied identity bytes
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for PeerId {
    type Err = BeaconError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;
        if bytes.is_empty() {
            return Err(BeaconError::InvalidPeerId("empty identity".to_string()));
        }
        Ok(Self(Bytes::from(bytes)))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0))
    }
}

/// Manages the local peer identity and its on-disk form
#[derive(Clone)]
pub struct PeerIdentity {
    peer_id: PeerId,
}

impl PeerIdentity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self {
            peer_id: PeerId::random(),
        }
    }

    /// Load identity from a file or generate a new one
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            Self::load(path)
        } else {
            let identity = Self::generate();
            identity.save(path)?;
            Ok(identity)
        }
    }

    /// Load identity from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        if bytes.is_empty() {
            return Err(BeaconError::ConfigError(format!(
                "Identity file {} is empty",
                path.as_ref().display()
            )));
        }

        Ok(Self {
            peer_id: PeerId::from_bytes(bytes),
        })
    }

    /// Save identity to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, self.peer_id.as_bytes())?;

        // Set restrictive permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Get the peer ID
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }
}

impl From<PeerId> for PeerIdentity {
    fn from(peer_id: PeerId) -> Self {
        Self { peer_id }
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("peer_id", &self.peer_id.to_string())
            .finish()
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.peer_id)
    }
}
