use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use ed25519_dalek::SigningKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use snapvault_types::{Result, SnapvaultError};

use crate::keys::{parse_public_ed25519, parse_public_x25519, Identity, RecipientKey, VerifierKey};
use crate::passphrase::PassphraseProvider;

const KEYRING_VERSION: u32 = 1;

/// KDF parameters stored alongside each sealed secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            algorithm: "argon2id".to_string(),
            time_cost: 3,
            memory_cost: 65536, // 64 MiB
            parallelism: 4,
            salt: Vec::new(),
        }
    }
}

/// Private keys of one identity, encrypted with a passphrase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedSecret {
    pub kdf: KdfParams,
    pub nonce: Vec<u8>,
    pub encrypted_payload: Vec<u8>,
}

/// Plaintext inside a [`SealedSecret`]. Zeroized on drop.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SecretPayload {
    encryption_secret: Vec<u8>,
    signing_secret: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    /// Hex-encoded X25519 public key.
    pub encryption_public: String,
    /// Hex-encoded Ed25519 public key.
    pub signing_public: String,
    /// Absent for identities imported as public-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_secret: Option<SealedSecret>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyringFile {
    version: u32,
    #[serde(default)]
    identities: Vec<IdentityRecord>,
}

/// JSON keyring holding public keys and passphrase-sealed private keys.
#[derive(Debug, Clone)]
pub struct Keyring {
    path: Option<PathBuf>,
    identities: Vec<IdentityRecord>,
    kdf: KdfParams,
}

impl Default for Keyring {
    fn default() -> Self {
        Self {
            path: None,
            identities: Vec::new(),
            kdf: KdfParams::default(),
        }
    }
}

impl Keyring {
    /// Load a keyring; a missing file yields an empty keyring bound to `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let identities = match fs::read(path) {
            Ok(raw) => {
                let file: KeyringFile = serde_json::from_slice(&raw).map_err(|e| {
                    SnapvaultError::Config(format!("invalid keyring {}: {e}", path.display()))
                })?;
                if file.version != KEYRING_VERSION {
                    return Err(SnapvaultError::Config(format!(
                        "unsupported keyring version {} in {}",
                        file.version,
                        path.display()
                    )));
                }
                file.identities
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            identities,
            kdf: KdfParams::default(),
        })
    }

    /// Override the Argon2 cost used when sealing new identities.
    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the keyring back to the path it was loaded from.
    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| SnapvaultError::Config("keyring has no backing file".into()))?;
        self.save_to(path)
    }

    /// Atomically write the keyring to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let file = KeyringFile {
            version: KEYRING_VERSION,
            identities: self.identities.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.identities.iter().map(|r| r.id.as_str())
    }

    pub fn records(&self) -> &[IdentityRecord] {
        &self.identities
    }

    fn record(&self, id: &str) -> Result<&IdentityRecord> {
        self.identities
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| SnapvaultError::InvalidInput(format!("no key '{id}' in keyring")))
    }

    fn ensure_absent(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(SnapvaultError::InvalidInput("key id must not be empty".into()));
        }
        if self.identities.iter().any(|r| r.id == id) {
            return Err(SnapvaultError::InvalidInput(format!(
                "key '{id}' already exists in keyring"
            )));
        }
        Ok(())
    }

    /// Add a full identity with its private keys sealed under `passphrase`.
    pub fn add_identity(&mut self, identity: &Identity, passphrase: &str) -> Result<()> {
        self.ensure_absent(&identity.id)?;
        let sealed = seal_secret(identity, passphrase, &self.kdf)?;
        let recipient = identity.recipient();
        let verifier = identity.verifier();
        self.identities.push(IdentityRecord {
            id: identity.id.clone(),
            encryption_public: hex::encode(recipient.public.as_bytes()),
            signing_public: hex::encode(verifier.key.as_bytes()),
            sealed_secret: Some(sealed),
        });
        Ok(())
    }

    /// Add a public-only identity (someone else's keys).
    pub fn add_public(
        &mut self,
        id: &str,
        encryption_public_hex: &str,
        signing_public_hex: &str,
    ) -> Result<()> {
        self.ensure_absent(id)?;
        parse_public_x25519(id, encryption_public_hex)?;
        parse_public_ed25519(id, signing_public_hex)?;
        self.identities.push(IdentityRecord {
            id: id.to_string(),
            encryption_public: encryption_public_hex.to_ascii_lowercase(),
            signing_public: signing_public_hex.to_ascii_lowercase(),
            sealed_secret: None,
        });
        Ok(())
    }

    pub fn recipient(&self, id: &str) -> Result<RecipientKey> {
        let record = self.record(id)?;
        Ok(RecipientKey {
            id: record.id.clone(),
            public: parse_public_x25519(id, &record.encryption_public)?,
        })
    }

    pub fn verifier(&self, id: &str) -> Result<VerifierKey> {
        let record = self.record(id)?;
        Ok(VerifierKey {
            id: record.id.clone(),
            key: parse_public_ed25519(id, &record.signing_public)?,
        })
    }

    /// Decrypt the private keys of `id`, asking `provider` for the passphrase.
    pub fn unlock(&self, id: &str, provider: &dyn PassphraseProvider) -> Result<Identity> {
        let record = self.record(id)?;
        let sealed = record.sealed_secret.as_ref().ok_or_else(|| {
            SnapvaultError::InvalidInput(format!("keyring holds only the public key for '{id}'"))
        })?;
        let passphrase = provider.passphrase(id)?;
        let identity = open_secret(id, sealed, &passphrase)?;

        // Guard against a record whose public keys do not match its secret.
        let expected = parse_public_x25519(id, &record.encryption_public)?;
        if identity.recipient().public.as_bytes() != expected.as_bytes() {
            return Err(SnapvaultError::Integrity(format!(
                "keyring entry '{id}' has mismatched key halves"
            )));
        }
        Ok(identity)
    }
}

/// Compute deterministic AAD bytes from KDF parameters so the sealed blob is
/// bound to the parameters stored next to it.
fn kdf_params_aad(kdf: &KdfParams) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(kdf)?)
}

/// Derive a 32-byte key from a passphrase using Argon2id.
fn derive_key_from_passphrase(passphrase: &str, kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let params = argon2::Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(32))
        .map_err(|e| SnapvaultError::Config(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &kdf.salt, output.as_mut())
        .map_err(|e| SnapvaultError::Config(format!("argon2 hash: {e}")))?;
    Ok(output)
}

fn seal_secret(identity: &Identity, passphrase: &str, base: &KdfParams) -> Result<SealedSecret> {
    let mut salt = vec![0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let kdf = KdfParams {
        salt,
        ..base.clone()
    };
    let wrapping_key = derive_key_from_passphrase(passphrase, &kdf)?;

    let payload = SecretPayload {
        encryption_secret: identity.encryption_secret.to_bytes().to_vec(),
        signing_secret: identity.signing_key.to_bytes().to_vec(),
    };
    let plaintext = Zeroizing::new(rmp_serde::to_vec(&payload)?);

    let kdf_aad = kdf_params_aad(&kdf)?;
    let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
        .map_err(|e| SnapvaultError::Other(format!("cipher init: {e}")))?;
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext.as_ref(),
                aad: &kdf_aad,
            },
        )
        .map_err(|e| SnapvaultError::Other(format!("seal secret: {e}")))?;

    Ok(SealedSecret {
        kdf,
        nonce: nonce_bytes.to_vec(),
        encrypted_payload: ciphertext,
    })
}

fn open_secret(id: &str, sealed: &SealedSecret, passphrase: &str) -> Result<Identity> {
    let wrong = || {
        SnapvaultError::InvalidInput(format!(
            "cannot unlock key '{id}': wrong passphrase or damaged keyring"
        ))
    };
    if sealed.nonce.len() != 12 {
        return Err(wrong());
    }
    let wrapping_key = derive_key_from_passphrase(passphrase, &sealed.kdf)?;
    let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref()).map_err(|_| wrong())?;
    let kdf_aad = kdf_params_aad(&sealed.kdf)?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(&sealed.nonce),
                Payload {
                    msg: sealed.encrypted_payload.as_ref(),
                    aad: &kdf_aad,
                },
            )
            .map_err(|_| wrong())?,
    );
    let payload: SecretPayload = rmp_serde::from_slice(&plaintext).map_err(|_| wrong())?;

    let encryption_secret: [u8; 32] = payload
        .encryption_secret
        .as_slice()
        .try_into()
        .map_err(|_| wrong())?;
    let signing_secret: [u8; 32] = payload
        .signing_secret
        .as_slice()
        .try_into()
        .map_err(|_| wrong())?;
    let encryption_secret = Zeroizing::new(encryption_secret);
    let signing_secret = Zeroizing::new(signing_secret);

    Ok(Identity {
        id: id.to_string(),
        encryption_secret: StaticSecret::from(*encryption_secret),
        signing_key: SigningKey::from_bytes(&signing_secret),
    })
}

/// Hex-encoded public halves of `identity`, as stored in a keyring record.
pub fn public_hex(identity: &Identity) -> (String, String) {
    (
        hex::encode(PublicKey::from(&identity.encryption_secret).as_bytes()),
        hex::encode(identity.signing_key.verifying_key().as_bytes()),
    )
}
