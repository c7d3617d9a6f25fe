// Conduit - Channel Signing
//
// ECDSA signing over canonical update digests. Signature slots are
// order-sensitive: a signature is only valid for the participant slot it
// occupies, never silently accepted for the other slot.

use crate::encoding::{update_digest, EncodingError};
use crate::types::{Address, ChannelUpdate, Hash32, PublicIdentifier};
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Missing signature in slot {0}")]
    MissingSignature(usize),

    #[error("Signature in slot {slot} does not verify for {identifier}")]
    WrongSigner { slot: usize, identifier: String },

    #[error("Malformed key material: {0}")]
    BadKey(String),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

/// A node's channel signing identity.
pub struct ChannelSigner {
    secp: Secp256k1<All>,
    secret: SecretKey,
    public: PublicKey,
    address: Address,
    identifier: PublicIdentifier,
}

impl ChannelSigner {
    pub fn new(secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public = PublicKey::from_secret_key(&secp, &secret);
        let address = Address::from_public_key(&public);
        let identifier = PublicIdentifier::from_public_key(&public);
        Self {
            secp,
            secret,
            public,
            address,
            identifier,
        }
    }

    /// Fresh random identity.
    pub fn random() -> Self {
        let secp = Secp256k1::new();
        let (secret, _) = secp.generate_keypair(&mut rand::thread_rng());
        Self::new(secret)
    }

    /// Parse a 32-byte hex secret key.
    pub fn from_hex(hex_key: &str) -> Result<Self, SignatureError> {
        let raw = hex_key.strip_prefix("0x").unwrap_or(hex_key);
        let bytes = hex::decode(raw).map_err(|e| SignatureError::BadKey(e.to_string()))?;
        let secret =
            SecretKey::from_slice(&bytes).map_err(|e| SignatureError::BadKey(e.to_string()))?;
        Ok(Self::new(secret))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_identifier(&self) -> &PublicIdentifier {
        &self.identifier
    }

    /// Sign a 32-byte digest.
    pub fn sign_digest(&self, digest: &Hash32) -> Signature {
        let message = Message::from_slice(digest).expect("digest is exactly 32 bytes");
        self.secp.sign_ecdsa(&message, &self.secret)
    }

    /// Sign a channel update's canonical digest.
    pub fn sign_update(&self, update: &ChannelUpdate) -> Result<Signature, SignatureError> {
        let digest = update_digest(update)?;
        Ok(self.sign_digest(&digest))
    }
}

impl std::fmt::Debug for ChannelSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSigner")
            .field("address", &self.address)
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

/// Verify a detached signature over a digest against an identifier's
/// embedded public key.
pub fn verify_digest(
    identifier: &PublicIdentifier,
    digest: &Hash32,
    signature: &Signature,
) -> Result<(), SignatureError> {
    let key = identifier
        .public_key()
        .map_err(|e| SignatureError::BadKey(e.to_string()))?;
    let message = Message::from_slice(digest).expect("digest is exactly 32 bytes");
    Secp256k1::verification_only()
        .verify_ecdsa(&message, signature, &key)
        .map_err(|_| SignatureError::WrongSigner {
            slot: usize::MAX,
            identifier: identifier.to_string(),
        })
}

/// Verify that the signature in `slot` of an update recovers to the
/// participant occupying that slot. A signature valid for the *other*
/// participant is rejected, not reassigned.
pub fn verify_update_signature(
    update: &ChannelUpdate,
    participants: &[PublicIdentifier; 2],
    slot: usize,
) -> Result<(), SignatureError> {
    let signature = update.signatures[slot].ok_or(SignatureError::MissingSignature(slot))?;
    let digest = update_digest(update)?;
    verify_digest(&participants[slot], &digest, &signature).map_err(|_| {
        SignatureError::WrongSigner {
            slot,
            identifier: participants[slot].to_string(),
        }
    })
}

/// Verify both slots of a fully signed update.
pub fn verify_update_signatures(
    update: &ChannelUpdate,
    participants: &[PublicIdentifier; 2],
) -> Result<(), SignatureError> {
    verify_update_signature(update, participants, 0)?;
    verify_update_signature(update, participants, 1)
}
