use zeroize::Zeroizing;

use snapvault_crypto::passphrase::configured_passphrase;
use snapvault_crypto::{EnvOrPrompt, PassphraseProvider};
use snapvault_types::{Result, SnapvaultError};

use crate::prompt::{can_prompt, read_passphrase};

/// `SNAPVAULT_PASSPHRASE`, else an interactive prompt per key.
pub(crate) fn unlock_provider() -> impl PassphraseProvider {
    EnvOrPrompt::new(|key_id: &str| -> Result<Option<Zeroizing<String>>> {
        if !can_prompt() {
            return Ok(None);
        }
        read_passphrase(&format!("Enter passphrase for '{key_id}': ")).map(Some)
    })
}

/// Passphrase protecting a newly generated identity, asked twice.
pub(crate) fn new_key_passphrase(key_id: &str) -> Result<Zeroizing<String>> {
    if let Some(pass) = configured_passphrase() {
        return Ok(pass);
    }
    if !can_prompt() {
        return Err(SnapvaultError::InvalidInput(
            "no passphrase available (set SNAPVAULT_PASSPHRASE or run interactively)".into(),
        ));
    }
    let p1 = read_passphrase(&format!("Enter new passphrase for '{key_id}': "))?;
    let p2 = read_passphrase(&format!("Confirm passphrase for '{key_id}': "))?;
    if *p1 != *p2 {
        return Err(SnapvaultError::InvalidInput("passphrases do not match".into()));
    }
    if p1.is_empty() {
        return Err(SnapvaultError::InvalidInput("passphrase must not be empty".into()));
    }
    Ok(p1)
}
