use std::io::{Cursor, Read, Write};
use std::iter;
use std::sync::Arc;

use age::{x25519::Identity, Decryptor, Encryptor};

use crate::errors::StorageError;

/// The encryption boundary for credentials at rest
///
/// Only the credential store holds one of these. Ciphertext is an age
/// X25519 message, base64 encoded for storage in a text column.
#[derive(Clone)]
pub struct TokenCipher {
    identity: Arc<Identity>,
}

impl TokenCipher {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self { identity }
    }

    /// Encrypts a secret for storage
    pub async fn seal(&self, plaintext: &str) -> Result<String, StorageError> {
        encrypt(plaintext, &self.identity).await
    }

    /// Decrypts a value produced by [`TokenCipher::seal`]
    pub async fn open(&self, ciphertext: &str) -> Result<String, StorageError> {
        decrypt(ciphertext, &self.identity).await
    }

    pub async fn seal_opt(&self, plaintext: Option<&str>) -> Result<Option<String>, StorageError> {
        match plaintext {
            Some(value) => Ok(Some(self.seal(value).await?)),
            None => Ok(None),
        }
    }

    pub async fn open_opt(&self, ciphertext: Option<&str>) -> Result<Option<String>, StorageError> {
        match ciphertext {
            Some(value) => Ok(Some(self.open(value).await?)),
            None => Ok(None),
        }
    }
}

fn encryption_error(context: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Encryption(format!("{context}: {err}"))
}

/// Encrypts a string using age encryption
pub async fn encrypt(data: &str, key: &Arc<Identity>) -> Result<String, StorageError> {
    let data_vec = data.as_bytes().to_vec();
    let key_clone = key.clone();

    // Perform encryption in a blocking task since it's CPU intensive
    let encrypted = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, StorageError> {
        let recipient = key_clone.to_public();
        let recipients = iter::once(&recipient as &dyn age::Recipient);
        let encryptor = Encryptor::with_recipients(recipients)
            .map_err(|e| encryption_error("Failed to create encryptor", e))?;

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| encryption_error("Failed to create encrypted writer", e))?;

        writer
            .write_all(&data_vec)
            .map_err(|e| encryption_error("Failed to write data for encryption", e))?;

        // Close the writer to finish encryption
        writer
            .finish()
            .map_err(|e| encryption_error("Failed to finish encryption", e))?;

        Ok(encrypted)
    })
    .await
    .map_err(|e| encryption_error("Encryption task failed", e))??;

    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        &encrypted,
    ))
}

/// Decrypts a string that was encrypted with the encrypt function
pub async fn decrypt(encrypted_base64: &str, key: &Arc<Identity>) -> Result<String, StorageError> {
    let encrypted_data =
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encrypted_base64)
            .map_err(|e| encryption_error("Failed to decode base64 data", e))?;

    let key_clone = key.clone();

    let decrypted = tokio::task::spawn_blocking(move || -> Result<String, StorageError> {
        let decryptor = Decryptor::new(Cursor::new(encrypted_data))
            .map_err(|e| encryption_error("Failed to create decryptor", e))?;

        let identities = iter::once(key_clone.as_ref() as &dyn age::Identity);
        let mut reader = decryptor
            .decrypt(identities)
            .map_err(|e| encryption_error("Failed to decrypt data", e))?;

        let mut decrypted = String::new();
        reader
            .read_to_string(&mut decrypted)
            .map_err(|e| encryption_error("Failed to read decrypted data", e))?;

        Ok(decrypted)
    })
    .await
    .map_err(|e| encryption_error("Decryption task failed", e))??;

    Ok(decrypted)
}
