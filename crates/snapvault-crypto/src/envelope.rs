//! Volume and manifest envelope.
//!
//! Layout:
//!
//! ```text
//! "SVE1" | flags (u8) | header_len (u32 LE) | header (msgpack) | body | [signature (64)]
//! ```
//!
//! When the encrypted flag is set the body is AES-256-GCM ciphertext under a
//! fresh per-envelope data key, with everything before the body as AAD. The
//! data key is wrapped once per recipient using an ephemeral X25519 agreement.
//! When the signed flag is set an Ed25519 signature over all preceding bytes
//! is appended.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ed25519_dalek::{Signature, Signer, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use snapvault_types::{Result, SnapvaultError};

use crate::keys::{DecryptionKey, KeyMaterial, RecipientKey};

pub const MAGIC: &[u8; 4] = b"SVE1";
pub const FLAG_ENCRYPTED: u8 = 0b01;
pub const FLAG_SIGNED: u8 = 0b10;

const PREAMBLE_LEN: usize = 4 + 1 + 4;
const SIGNATURE_LEN: usize = 64;
const NONCE_LEN: usize = 12;
const WRAP_CONTEXT: &[u8] = b"snapvault-envelope-wrap-v1";

/// Data key sealed for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    pub recipient: String,
    pub ephemeral_public: Vec<u8>,
    pub nonce: Vec<u8>,
    pub wrapped_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    /// Label of the codec applied to the body before encryption.
    pub compression: String,
    #[serde(default)]
    pub recipients: Vec<WrappedKey>,
    #[serde(default)]
    pub nonce: Vec<u8>,
    #[serde(default)]
    pub signer: Option<String>,
}

/// Result of [`open`].
#[derive(Debug)]
pub struct OpenedEnvelope {
    pub header: EnvelopeHeader,
    pub encrypted: bool,
    pub signed: bool,
    /// Decrypted (still compressed) body.
    pub body: Vec<u8>,
}

/// Wrap `body` according to `keys`: encrypt when recipients are configured,
/// sign when a signer is configured.
pub fn seal(body: &[u8], compression: &str, keys: &KeyMaterial) -> Result<Vec<u8>> {
    let mut flags = 0u8;
    let mut header = EnvelopeHeader {
        compression: compression.to_string(),
        recipients: Vec::new(),
        nonce: Vec::new(),
        signer: keys.signer_id(),
    };

    let data_key = Zeroizing::new(random_key());
    if keys.encrypts() {
        flags |= FLAG_ENCRYPTED;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        header.nonce = nonce.to_vec();
        header.recipients = keys
            .recipients
            .iter()
            .map(|r| wrap_data_key(&data_key, r))
            .collect::<Result<_>>()?;
    }
    if keys.signs() {
        flags |= FLAG_SIGNED;
    }

    let header_bytes = rmp_serde::to_vec(&header)?;
    let header_len = u32::try_from(header_bytes.len())
        .map_err(|_| SnapvaultError::Other("envelope header too large".into()))?;

    let mut out = Vec::with_capacity(PREAMBLE_LEN + header_bytes.len() + body.len() + 16 + 64);
    out.extend_from_slice(MAGIC);
    out.push(flags);
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header_bytes);

    if flags & FLAG_ENCRYPTED != 0 {
        let cipher = Aes256Gcm::new_from_slice(data_key.as_ref())
            .map_err(|e| SnapvaultError::Other(format!("cipher init: {e}")))?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&header.nonce),
                Payload {
                    msg: body,
                    aad: &out,
                },
            )
            .map_err(|e| SnapvaultError::Other(format!("AES-GCM encrypt: {e}")))?;
        out.extend_from_slice(&ciphertext);
    } else {
        out.extend_from_slice(body);
    }

    if let Some(signer) = &keys.signer {
        let signature = signer.key.sign(&out);
        out.extend_from_slice(&signature.to_bytes());
    }
    Ok(out)
}

/// Parse an envelope without verifying or decrypting it.
pub fn read_header(data: &[u8]) -> Result<(u8, EnvelopeHeader)> {
    let (flags, header, _) = split_preamble(data)?;
    Ok((flags, header))
}

/// Verify (when trusted signers are configured) and decrypt an envelope.
///
/// Signature checks run before any decryption. A missing signature when
/// signers are configured, an unknown signer, or a bad signature all fail
/// with `Integrity`.
pub fn open(data: &[u8], keys: &KeyMaterial) -> Result<OpenedEnvelope> {
    let (flags, header, body_start) = split_preamble(data)?;
    let encrypted = flags & FLAG_ENCRYPTED != 0;
    let signed = flags & FLAG_SIGNED != 0;

    let body_end = if signed {
        data.len()
            .checked_sub(SIGNATURE_LEN)
            .filter(|end| *end >= body_start)
            .ok_or_else(|| SnapvaultError::Integrity("envelope truncated before signature".into()))?
    } else {
        data.len()
    };

    if keys.requires_signature() {
        if !signed {
            return Err(SnapvaultError::Integrity(
                "envelope is not signed but a signature is required".into(),
            ));
        }
        let signer_id = header
            .signer
            .as_deref()
            .ok_or_else(|| SnapvaultError::Integrity("signed envelope names no signer".into()))?;
        let verifier = keys.verifier(signer_id).ok_or_else(|| {
            SnapvaultError::Integrity(format!("envelope signed by untrusted key '{signer_id}'"))
        })?;
        let sig_bytes: [u8; SIGNATURE_LEN] = data[body_end..]
            .try_into()
            .map_err(|_| SnapvaultError::Integrity("malformed signature".into()))?;
        let signature = Signature::from_bytes(&sig_bytes);
        verifier
            .key
            .verify(&data[..body_end], &signature)
            .map_err(|_| {
                SnapvaultError::Integrity(format!("signature verification failed for '{signer_id}'"))
            })?;
    } else if signed {
        tracing::debug!("no trusted signers configured, skipping signature check");
    }

    let body = &data[body_start..body_end];
    let plain = if encrypted {
        let data_key = unwrap_data_key(&header, keys)?;
        let cipher = Aes256Gcm::new_from_slice(data_key.as_ref())
            .map_err(|e| SnapvaultError::Other(format!("cipher init: {e}")))?;
        if header.nonce.len() != NONCE_LEN {
            return Err(SnapvaultError::Integrity("malformed envelope nonce".into()));
        }
        cipher
            .decrypt(
                Nonce::from_slice(&header.nonce),
                Payload {
                    msg: body,
                    aad: &data[..body_start],
                },
            )
            .map_err(|_| SnapvaultError::Integrity("envelope decryption failed".into()))?
    } else {
        body.to_vec()
    };

    Ok(OpenedEnvelope {
        header,
        encrypted,
        signed,
        body: plain,
    })
}

fn split_preamble(data: &[u8]) -> Result<(u8, EnvelopeHeader, usize)> {
    if data.len() < PREAMBLE_LEN || &data[..4] != MAGIC {
        return Err(SnapvaultError::Integrity("not a snapvault envelope".into()));
    }
    let flags = data[4];
    if flags & !(FLAG_ENCRYPTED | FLAG_SIGNED) != 0 {
        return Err(SnapvaultError::Integrity(format!(
            "unknown envelope flags {flags:#04x}"
        )));
    }
    let header_len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;
    let body_start = PREAMBLE_LEN
        .checked_add(header_len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| SnapvaultError::Integrity("envelope header truncated".into()))?;
    let header: EnvelopeHeader = rmp_serde::from_slice(&data[PREAMBLE_LEN..body_start])
        .map_err(|e| SnapvaultError::Integrity(format!("malformed envelope header: {e}")))?;
    Ok((flags, header, body_start))
}

fn random_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Derive the key that seals the data key for one recipient.
fn wrap_key(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> Zeroizing<[u8; 32]> {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(WRAP_CONTEXT);
    hasher.update(shared);
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&hasher.finalize());
    out
}

fn wrap_data_key(data_key: &[u8; 32], recipient: &RecipientKey) -> Result<WrappedKey> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient.public);
    if !shared.was_contributory() {
        return Err(SnapvaultError::InvalidInput(format!(
            "recipient key for '{}' is a low-order point",
            recipient.id
        )));
    }
    let kek = wrap_key(shared.as_bytes(), &ephemeral_public, &recipient.public);

    let cipher = Aes256Gcm::new_from_slice(kek.as_ref())
        .map_err(|e| SnapvaultError::Other(format!("cipher init: {e}")))?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let wrapped = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: data_key,
                aad: recipient.id.as_bytes(),
            },
        )
        .map_err(|e| SnapvaultError::Other(format!("wrap data key: {e}")))?;

    Ok(WrappedKey {
        recipient: recipient.id.clone(),
        ephemeral_public: ephemeral_public.as_bytes().to_vec(),
        nonce: nonce.to_vec(),
        wrapped_key: wrapped,
    })
}

fn try_unwrap(wrapped: &WrappedKey, key: &DecryptionKey) -> Option<Zeroizing<[u8; 32]>> {
    let ephemeral: [u8; 32] = wrapped.ephemeral_public.as_slice().try_into().ok()?;
    if wrapped.nonce.len() != NONCE_LEN {
        return None;
    }
    let ephemeral = PublicKey::from(ephemeral);
    let own_public = PublicKey::from(&key.secret);
    let shared = key.secret.diffie_hellman(&ephemeral);
    let kek = wrap_key(shared.as_bytes(), &ephemeral, &own_public);
    let cipher = Aes256Gcm::new_from_slice(kek.as_ref()).ok()?;
    let plain = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(&wrapped.nonce),
                Payload {
                    msg: &wrapped.wrapped_key,
                    aad: wrapped.recipient.as_bytes(),
                },
            )
            .ok()?,
    );
    let mut out = Zeroizing::new([0u8; 32]);
    if plain.len() != out.len() {
        return None;
    }
    out.copy_from_slice(&plain);
    Some(out)
}

fn unwrap_data_key(header: &EnvelopeHeader, keys: &KeyMaterial) -> Result<Zeroizing<[u8; 32]>> {
    if keys.decryption_keys.is_empty() {
        return Err(SnapvaultError::InvalidInput(
            "envelope is encrypted but no private key was provided".into(),
        ));
    }
    for wrapped in &header.recipients {
        if let Some(key) = keys.decryption_key(&wrapped.recipient) {
            if let Some(data_key) = try_unwrap(wrapped, key) {
                return Ok(data_key);
            }
        }
    }
    let recipients: Vec<&str> = header.recipients.iter().map(|w| w.recipient.as_str()).collect();
    Err(SnapvaultError::InvalidInput(format!(
        "none of the available private keys can open an envelope encrypted to [{}]",
        recipients.join(", ")
    )))
}
