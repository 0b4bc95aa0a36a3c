use crate::storage::{Store, CF_WALLET};
use crate::derivation::KeySource;
use anyhow::{Result, Context, anyhow, bail};
use argon2::{Argon2, Params};
use chacha20poly1305::{aead::{Aead, NewAead}, XChaCha20Poly1305, Key, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use once_cell::sync::OnceCell;
use zeroize::Zeroizing;
use std::sync::Arc;

const SEED_KEY: &[u8] = b"root_seed";
const SEED_LEN: usize = 32;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const SEED_VERSION_ENCRYPTED: u8 = 1;
// Tunable KDF parameters for seed encryption
const SEED_KDF_MEM_KIB: u32 = 64 * 1024; // 64 MiB
const SEED_KDF_TIME_COST: u32 = 3; // iterations

static PASSPHRASE: OnceCell<Zeroizing<String>> = OnceCell::new();

/// Obtain the pass-phrase protecting the seed at rest.
/// Source order:
///   1) PAYLINK_PASSPHRASE env var
///   2) Interactive prompt (only once per process)
/// Non-interactive without env returns an error.
fn obtain_passphrase(prompt: &str) -> Result<Zeroizing<String>> {
    if let Some(existing) = PASSPHRASE.get() {
        return Ok(existing.clone());
    }
    if let Ok(val) = std::env::var("PAYLINK_PASSPHRASE") {
        let z = Zeroizing::new(val);
        let _ = PASSPHRASE.set(z.clone());
        return Ok(z);
    }
    if atty::is(atty::Stream::Stdin) {
        let pw = rpassword::prompt_password(prompt).context("Failed to read pass-phrase")?;
        let z = Zeroizing::new(pw);
        let _ = PASSPHRASE.set(z.clone());
        return Ok(z);
    }
    bail!("PAYLINK_PASSPHRASE is required in non-interactive mode")
}

fn derive_cipher_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    let params = Params::new(SEED_KDF_MEM_KIB, SEED_KDF_TIME_COST, 1, None)
        .map_err(|e| anyhow!("Invalid Argon2id params: {}", e))?;
    Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params)
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| anyhow!("Argon2id key derivation failed: {}", e))?;
    Ok(key)
}

/// The wallet root: a 32-byte seed held in memory, encrypted at rest.
/// All address derivation flows through the [`KeySource`] it hands out.
pub struct RootWallet {
    seed: Zeroizing<[u8; 32]>,
}

impl RootWallet {
    /// Loads the root seed from the store, or creates a new one if none exists.
    /// The stored record is `version || salt || nonce || ciphertext(seed)`.
    pub fn load_or_create(db: Arc<Store>) -> Result<Self> {
        if let Some(encoded) = db.get::<Vec<u8>>(CF_WALLET, SEED_KEY)? {
            if encoded.len() < 1 + SALT_LEN + NONCE_LEN {
                bail!("Stored seed record is truncated");
            }
            let version = encoded[0];
            if version != SEED_VERSION_ENCRYPTED {
                bail!("Unsupported seed record version: {}", version);
            }
            let salt_start = 1;
            let nonce_start = salt_start + SALT_LEN;
            let ct_start = nonce_start + NONCE_LEN;
            let salt = &encoded[salt_start..nonce_start];
            let nonce = &encoded[nonce_start..ct_start];
            let ciphertext = &encoded[ct_start..];

            let passphrase = obtain_passphrase("Enter wallet pass-phrase: ")?;
            let mut key = derive_cipher_key(&passphrase, salt)?;
            let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
            let seed_bytes = cipher
                .decrypt(XNonce::from_slice(nonce), ciphertext)
                .map_err(|_| anyhow!("Invalid pass-phrase"))?;
            key.iter_mut().for_each(|b| *b = 0);

            if seed_bytes.len() != SEED_LEN {
                bail!("Decrypted seed has unexpected length {}", seed_bytes.len());
            }
            let mut seed = Zeroizing::new([0u8; 32]);
            seed.copy_from_slice(&seed_bytes);
            return Ok(RootWallet { seed });
        }

        // --- Brand new wallet ---
        println!("✨ No wallet seed found, creating a new one...");
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(seed.as_mut());

        let passphrase = obtain_passphrase("Set a pass-phrase for your new wallet: ")?;
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut key = derive_cipher_key(&passphrase, &salt)?;

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), AsRef::<[u8]>::as_ref(&*seed))
            .map_err(|e| anyhow!("Failed to encrypt seed: {}", e))?;
        // best-effort zeroize
        key.iter_mut().for_each(|b| *b = 0);

        let mut encoded = Vec::with_capacity(1 + SALT_LEN + NONCE_LEN + ciphertext.len());
        encoded.push(SEED_VERSION_ENCRYPTED);
        encoded.extend_from_slice(&salt);
        encoded.extend_from_slice(&nonce);
        encoded.extend_from_slice(&ciphertext);

        db.put(CF_WALLET, SEED_KEY, &encoded)?;
        println!("✅ New wallet seed created and saved");
        Ok(RootWallet { seed })
    }

    /// Construct from a known seed. Intended for tests and recovery tooling.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        RootWallet { seed: Zeroizing::new(seed) }
    }

    /// The derivation source for this wallet. Cheap to construct; holds a
    /// copy of the read-only seed so it can be moved across threads freely.
    pub fn key_source(&self) -> KeySource {
        KeySource::new(*self.seed)
    }
}
