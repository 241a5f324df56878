use snapvault_core::config::SnapvaultConfig;
use snapvault_crypto::keyring::public_hex;
use snapvault_crypto::Identity;

use crate::cli::{Cli, KeygenArgs};
use crate::dispatch::{open_keyring, CliResult};
use crate::passphrase::new_key_passphrase;

pub(crate) fn run_keygen(cli: &Cli, args: &KeygenArgs, config: &SnapvaultConfig) -> CliResult {
    let mut keyring = open_keyring(config)?;

    let (encryption_public, signing_public, imported) =
        match (&args.import_encryption, &args.import_signing) {
            (Some(enc), Some(sig)) => {
                keyring.add_public(&args.id, enc, sig)?;
                (enc.to_ascii_lowercase(), sig.to_ascii_lowercase(), true)
            }
            _ => {
                let identity = Identity::generate(args.id.as_str());
                let passphrase = new_key_passphrase(&args.id)?;
                keyring.add_identity(&identity, &passphrase)?;
                let (enc, sig) = public_hex(&identity);
                (enc, sig, false)
            }
        };
    keyring.save()?;
    let path = config.keyring_path();

    if cli.json_output {
        let out = serde_json::json!({
            "id": args.id,
            "encryption_public": encryption_public,
            "signing_public": signing_public,
            "imported": imported,
            "keyring": path.display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        let verb = if imported { "Imported" } else { "Generated" };
        println!("{verb} key '{}' in {}", args.id, path.display());
        println!("  Encryption public key: {encryption_public}");
        println!("  Signing public key:    {signing_public}");
    }
    Ok(())
}
