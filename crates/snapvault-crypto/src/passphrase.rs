use zeroize::Zeroizing;

use snapvault_types::{Result, SnapvaultError};

/// Environment variable consulted before prompting.
pub const PASSPHRASE_ENV: &str = "SNAPVAULT_PASSPHRASE";

/// Supplies the passphrase protecting one keyring identity.
///
/// Interactive prompting lives in the CLI; the engine and tests use the
/// non-interactive providers below.
pub trait PassphraseProvider {
    fn passphrase(&self, key_id: &str) -> Result<Zeroizing<String>>;
}

/// Same passphrase for every identity.
pub struct FixedPassphrase(Zeroizing<String>);

impl FixedPassphrase {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self(Zeroizing::new(passphrase.into()))
    }
}

impl PassphraseProvider for FixedPassphrase {
    fn passphrase(&self, _key_id: &str) -> Result<Zeroizing<String>> {
        Ok(self.0.clone())
    }
}

/// Passphrase from the environment, if set and non-empty.
pub fn configured_passphrase() -> Option<Zeroizing<String>> {
    match std::env::var(PASSPHRASE_ENV) {
        Ok(pass) if !pass.is_empty() => Some(Zeroizing::new(pass)),
        _ => None,
    }
}

/// Environment first, then the interactive `prompt` callback.
pub struct EnvOrPrompt<F> {
    prompt: F,
}

impl<F> EnvOrPrompt<F>
where
    F: Fn(&str) -> Result<Option<Zeroizing<String>>>,
{
    pub fn new(prompt: F) -> Self {
        Self { prompt }
    }
}

impl<F> PassphraseProvider for EnvOrPrompt<F>
where
    F: Fn(&str) -> Result<Option<Zeroizing<String>>>,
{
    fn passphrase(&self, key_id: &str) -> Result<Zeroizing<String>> {
        if let Some(pass) = configured_passphrase() {
            return Ok(pass);
        }
        match (self.prompt)(key_id)? {
            Some(pass) if !pass.is_empty() => Ok(pass),
            _ => Err(SnapvaultError::InvalidInput(format!(
                "no passphrase available for key '{key_id}' (set {PASSPHRASE_ENV} or run interactively)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_provider_returns_same_passphrase() {
        let p = FixedPassphrase::new("hunter2");
        assert_eq!(p.passphrase("a").unwrap().as_str(), "hunter2");
        assert_eq!(p.passphrase("b").unwrap().as_str(), "hunter2");
    }

    #[test]
    fn prompt_result_is_used_when_env_is_unset() {
        if configured_passphrase().is_some() {
            return;
        }
        let p = EnvOrPrompt::new(|id: &str| Ok(Some(Zeroizing::new(format!("pw-{id}")))));
        assert_eq!(p.passphrase("x").unwrap().as_str(), "pw-x");

        let empty = EnvOrPrompt::new(|_: &str| Ok(None));
        assert!(matches!(
            empty.passphrase("x"),
            Err(SnapvaultError::InvalidInput(_))
        ));
    }
}
