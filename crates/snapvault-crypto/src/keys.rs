use std::fmt;
use std::sync::Arc;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use snapvault_types::{Result, SnapvaultError};

/// Public half of an encryption identity.
#[derive(Clone)]
pub struct RecipientKey {
    pub id: String,
    pub public: PublicKey,
}

/// Private half of an encryption identity. Zeroized on drop by x25519-dalek.
#[derive(Clone)]
pub struct DecryptionKey {
    pub id: String,
    pub secret: StaticSecret,
}

/// Private Ed25519 signing key. Zeroized on drop by ed25519-dalek.
#[derive(Clone)]
pub struct SignerKey {
    pub id: String,
    pub key: SigningKey,
}

/// Public Ed25519 key used to verify envelopes.
#[derive(Clone)]
pub struct VerifierKey {
    pub id: String,
    pub key: VerifyingKey,
}

impl fmt::Debug for RecipientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecipientKey({}, {})", self.id, hex::encode(self.public.as_bytes()))
    }
}

impl fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DecryptionKey({}, <redacted>)", self.id)
    }
}

impl fmt::Debug for SignerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerKey({}, <redacted>)", self.id)
    }
}

impl fmt::Debug for VerifierKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerifierKey({}, {})", self.id, hex::encode(self.key.as_bytes()))
    }
}

/// A complete identity: encryption keypair plus signing keypair.
#[derive(Clone)]
pub struct Identity {
    pub id: String,
    pub encryption_secret: StaticSecret,
    pub signing_key: SigningKey,
}

impl Identity {
    /// Generate fresh keys using OS entropy.
    pub fn generate(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            encryption_secret: StaticSecret::random_from_rng(OsRng),
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn recipient(&self) -> RecipientKey {
        RecipientKey {
            id: self.id.clone(),
            public: PublicKey::from(&self.encryption_secret),
        }
    }

    pub fn decryption_key(&self) -> DecryptionKey {
        DecryptionKey {
            id: self.id.clone(),
            secret: self.encryption_secret.clone(),
        }
    }

    pub fn signer(&self) -> SignerKey {
        SignerKey {
            id: self.id.clone(),
            key: self.signing_key.clone(),
        }
    }

    pub fn verifier(&self) -> VerifierKey {
        VerifierKey {
            id: self.id.clone(),
            key: self.signing_key.verifying_key(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}, <redacted>)", self.id)
    }
}

/// Resolved key handles for one job. Built once before the job starts and
/// shared read-only across workers through an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct KeyMaterial {
    /// Encrypt new envelopes to these recipients. Empty means no encryption.
    pub recipients: Vec<RecipientKey>,
    /// Private keys available for opening encrypted envelopes.
    pub decryption_keys: Vec<DecryptionKey>,
    /// Sign new envelopes with this key.
    pub signer: Option<SignerKey>,
    /// Trusted signers. When non-empty, every opened envelope must carry a
    /// valid signature from one of them.
    pub verifiers: Vec<VerifierKey>,
}

impl KeyMaterial {
    /// No encryption, no signing.
    pub fn none() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn encrypts(&self) -> bool {
        !self.recipients.is_empty()
    }

    pub fn signs(&self) -> bool {
        self.signer.is_some()
    }

    pub fn requires_signature(&self) -> bool {
        !self.verifiers.is_empty()
    }

    pub fn recipient_ids(&self) -> Vec<String> {
        self.recipients.iter().map(|r| r.id.clone()).collect()
    }

    pub fn signer_id(&self) -> Option<String> {
        self.signer.as_ref().map(|s| s.id.clone())
    }

    pub fn decryption_key(&self, id: &str) -> Option<&DecryptionKey> {
        self.decryption_keys.iter().find(|k| k.id == id)
    }

    pub fn verifier(&self, id: &str) -> Option<&VerifierKey> {
        self.verifiers.iter().find(|k| k.id == id)
    }

    /// Key material able to both produce and consume envelopes for `identity`.
    pub fn for_identity(identity: &Identity, encrypt: bool, sign: bool) -> Self {
        Self {
            recipients: if encrypt {
                vec![identity.recipient()]
            } else {
                Vec::new()
            },
            decryption_keys: vec![identity.decryption_key()],
            signer: sign.then(|| identity.signer()),
            verifiers: if sign {
                vec![identity.verifier()]
            } else {
                Vec::new()
            },
        }
    }
}

pub(crate) fn parse_public_x25519(id: &str, hex_str: &str) -> Result<PublicKey> {
    let bytes = decode_32(id, "encryption public key", hex_str)?;
    Ok(PublicKey::from(bytes))
}

pub(crate) fn parse_public_ed25519(id: &str, hex_str: &str) -> Result<VerifyingKey> {
    let bytes = decode_32(id, "signing public key", hex_str)?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| {
        SnapvaultError::InvalidInput(format!("invalid signing public key for '{id}': {e}"))
    })
}

fn decode_32(id: &str, what: &str, hex_str: &str) -> Result<[u8; 32]> {
    let raw = hex::decode(hex_str)
        .map_err(|e| SnapvaultError::InvalidInput(format!("invalid {what} for '{id}': {e}")))?;
    raw.try_into().map_err(|_| {
        SnapvaultError::InvalidInput(format!("invalid {what} for '{id}': expected 32 bytes"))
    })
}
