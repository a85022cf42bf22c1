use age::{secrecy::ExposeSecret as _, x25519::Identity};
use color_eyre::eyre::Result;

/// Print a fresh age identity for encrypting stored Bluesky credentials
fn main() -> Result<()> {
    color_eyre::install()?;

    let identity = Identity::generate();
    let key_string = identity.to_string();
    let key_string = key_string.expose_secret();

    println!("# public key: {}", identity.to_public());
    println!("ENCRYPTION_KEY=\"{}\"", key_string);
    eprintln!();
    eprintln!("Set ENCRYPTION_KEY before starting skypost. Tokens and DPoP keys");
    eprintln!("stored with one key cannot be read with another.");

    Ok(())
}
