pub mod envelope;
pub mod keyring;
pub mod keys;
pub mod passphrase;

pub use envelope::{open, seal, OpenedEnvelope};
pub use keyring::{KdfParams, Keyring};
pub use keys::{DecryptionKey, Identity, KeyMaterial, RecipientKey, SignerKey, VerifierKey};
pub use passphrase::{EnvOrPrompt, FixedPassphrase, PassphraseProvider};

use snapvault_types::{Result, SnapvaultError};

/// Resolve the key handles for a backup: recipients for `encrypt_to`, and the
/// unlocked private key of `sign_from`.
pub fn keys_for_send(
    keyring: &Keyring,
    encrypt_to: &[String],
    sign_from: Option<&str>,
    provider: &dyn PassphraseProvider,
) -> Result<KeyMaterial> {
    let recipients = encrypt_to
        .iter()
        .map(|id| keyring.recipient(id))
        .collect::<Result<Vec<_>>>()?;
    let signer = match sign_from {
        Some(id) => Some(keyring.unlock(id, provider)?.signer()),
        None => None,
    };
    Ok(KeyMaterial {
        recipients,
        decryption_keys: Vec::new(),
        signer,
        verifiers: Vec::new(),
    })
}

/// Resolve the key handles for a restore: unlocked private keys for
/// `decrypt_with`, and the trusted public key of `verify_from`.
pub fn keys_for_receive(
    keyring: &Keyring,
    decrypt_with: &[String],
    verify_from: Option<&str>,
    provider: &dyn PassphraseProvider,
) -> Result<KeyMaterial> {
    let decryption_keys = decrypt_with
        .iter()
        .map(|id| keyring.unlock(id, provider).map(|i| i.decryption_key()))
        .collect::<Result<Vec<_>>>()?;
    let verifiers = match verify_from {
        Some(id) => vec![keyring.verifier(id)?],
        None => Vec::new(),
    };
    Ok(KeyMaterial {
        recipients: Vec::new(),
        decryption_keys,
        signer: None,
        verifiers,
    })
}

/// Reject option combinations that cannot produce a usable job.
pub fn validate_key_options(encrypt_to: &[String], sign_from: Option<&str>) -> Result<()> {
    if encrypt_to.iter().any(|id| id.trim().is_empty()) {
        return Err(SnapvaultError::InvalidInput(
            "encryption recipient ids must not be empty".into(),
        ));
    }
    if sign_from.is_some_and(|id| id.trim().is_empty()) {
        return Err(SnapvaultError::InvalidInput(
            "signing key id must not be empty".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_ring(ids: &[&str]) -> Keyring {
        let mut ring = Keyring::default().with_kdf(KdfParams {
            time_cost: 1,
            memory_cost: 1024,
            parallelism: 1,
            ..KdfParams::default()
        });
        for id in ids {
            ring.add_identity(&Identity::generate(*id), "pw").unwrap();
        }
        ring
    }

    #[test]
    fn send_and_receive_keys_interoperate() {
        let ring = cheap_ring(&["backup@host", "signer@host"]);
        let pw = FixedPassphrase::new("pw");
        let send = keys_for_send(&ring, &["backup@host".into()], Some("signer@host"), &pw).unwrap();
        assert!(send.encrypts() && send.signs());

        let sealed = seal(b"stream", "none", &send).unwrap();
        let recv =
            keys_for_receive(&ring, &["backup@host".into()], Some("signer@host"), &pw).unwrap();
        assert_eq!(open(&sealed, &recv).unwrap().body, b"stream");
    }

    #[test]
    fn unknown_ids_fail() {
        let ring = cheap_ring(&[]);
        let pw = FixedPassphrase::new("pw");
        assert!(keys_for_send(&ring, &["nobody".into()], None, &pw).is_err());
        assert!(validate_key_options(&[" ".into()], None).is_err());
        assert!(validate_key_options(&["a".into()], Some("")).is_err());
    }
}
