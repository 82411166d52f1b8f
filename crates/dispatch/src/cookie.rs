//! Session cookie naming and sealing
//!
//! Cookie names are either a sanitized operator-supplied name or a short
//! deterministic digest of the pool identifier, so cookie continuity
//! survives process restarts without any persisted state. Cookie values
//! optionally travel sealed: AES-256-CFB under a SHA-256-derived key, a
//! random 16-byte IV prefixed to the ciphertext, the whole thing encoded
//! as unpadded url-safe base64.

use aes::Aes256;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::{Decryptor, Encryptor};
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use tiller_common::errors::{TillerError, TillerResult};

type Aes256CfbEnc = Encryptor<Aes256>;
type Aes256CfbDec = Decryptor<Aes256>;

const NAME_DIGEST_SALT: &str = "_TRAEFIK_BACKEND_";
const SEAL_IV_LEN: usize = 16;

/// Resolve the session cookie name for a pool: a sanitized explicit name
/// when one is configured, otherwise a generated one.
pub fn sticky_cookie_name(explicit: &str, pool_id: &str) -> String {
    if explicit.is_empty() {
        generate_cookie_name(pool_id)
    } else {
        sanitize_cookie_name(explicit)
    }
}

/// Derive a deterministic, header-safe cookie name from a pool identifier.
/// Same pool, same name, across restarts.
pub fn generate_cookie_name(pool_id: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(NAME_DIGEST_SALT.as_bytes());
    hasher.update(pool_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("_{}", &digest[..6])
}

/// Map every character outside the RFC 2616 token set to `_`
pub fn sanitize_cookie_name(name: &str) -> String {
    name.chars()
        .map(|c| if is_token_char(c) { c } else { '_' })
        .collect()
}

fn is_token_char(c: char) -> bool {
    matches!(c,
        'a'..='z' | 'A'..='Z' | '0'..='9'
        | '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '.'
        | '^' | '_' | '`' | '|' | '~')
}

/// Seals and opens session cookie values
///
/// The client is the sole holder of the cookie; there is no server-side
/// state and no versioning byte. A value sealed under a different key
/// simply fails to open.
#[derive(Clone)]
pub struct CookieSealer {
    key: [u8; 32],
}

impl CookieSealer {
    pub fn new(secret: &str) -> TillerResult<Self> {
        if secret.is_empty() {
            return Err(TillerError::config(
                "sticky cookie encryption key must not be empty",
            ));
        }
        let key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        Ok(Self { key })
    }

    /// Encrypt a cookie value for the wire
    pub fn seal(&self, plaintext: &str) -> String {
        let mut iv = [0u8; SEAL_IV_LEN];
        rand::rng().fill_bytes(&mut iv);

        let mut buf = plaintext.as_bytes().to_vec();
        Aes256CfbEnc::new(&self.key.into(), &iv.into()).encrypt(&mut buf);

        let mut sealed = Vec::with_capacity(SEAL_IV_LEN + buf.len());
        sealed.extend_from_slice(&iv);
        sealed.extend_from_slice(&buf);
        URL_SAFE_NO_PAD.encode(sealed)
    }

    /// Decrypt a client-supplied cookie value. `None` for anything that is
    /// not a well-formed sealed value under this key.
    pub fn open(&self, sealed: &str) -> Option<String> {
        let raw = URL_SAFE_NO_PAD.decode(sealed.as_bytes()).ok()?;
        if raw.len() <= SEAL_IV_LEN {
            return None;
        }
        let (iv, ciphertext) = raw.split_at(SEAL_IV_LEN);
        let iv: [u8; SEAL_IV_LEN] = iv.try_into().ok()?;

        let mut buf = ciphertext.to_vec();
        Aes256CfbDec::new(&self.key.into(), &iv.into()).decrypt(&mut buf);
        String::from_utf8(buf).ok()
    }
}
