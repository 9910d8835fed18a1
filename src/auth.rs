// Operator authentication for the AEGIS gate and role edits.
//
// PIN: argon2id salted hash, numeric PINs of 6+ digits (or 12+ character
// passphrases). 3 consecutive failures lock verification for 15 minutes.
// TOTP: RFC 6238, 30-second step, ±1 step tolerance, HMAC-SHA1. 5 consecutive
// failures lock for 30 minutes. Single-use backup codes are accepted in lieu
// of a TOTP code. Switching methods requires verification under the current
// method first; the old secret is deleted once the new one is in place.

use crate::credentials::{
    random_bytes, CredentialStore, KEY_PIN_HASH, KEY_TOTP_BACKUP_CODES, KEY_TOTP_SEED,
};
use crate::errors::{CoreError, CoreResult};
use anyhow::{anyhow, bail, Result};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

const PIN_MAX_FAILURES: u32 = 3;
const PIN_LOCKOUT: Duration = Duration::from_secs(15 * 60);
const TOTP_MAX_FAILURES: u32 = 5;
const TOTP_LOCKOUT: Duration = Duration::from_secs(30 * 60);
const TOTP_STEP_SECS: u64 = 30;
const TOTP_DIGITS: u32 = 6;
const BACKUP_CODE_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Pin,
    Totp,
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Pin => f.write_str("pin"),
            AuthMethod::Totp => f.write_str("totp"),
        }
    }
}

/// Result of enrolling TOTP: the seed the operator loads into an
/// authenticator app, plus one-time backup codes. Shown once, never stored
/// in plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotpSetup {
    pub seed_base32: String,
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Default)]
struct LockoutState {
    failures: u32,
    locked_until: Option<Instant>,
}

impl LockoutState {
    fn check(&self) -> CoreResult<()> {
        if let Some(until) = self.locked_until {
            let now = Instant::now();
            if now < until {
                return Err(CoreError::AuthLockout {
                    remaining_secs: (until - now).as_secs().max(1),
                });
            }
        }
        Ok(())
    }

    fn record_failure(&mut self, max: u32, lockout: Duration) {
        self.failures += 1;
        if self.failures >= max {
            self.locked_until = Some(Instant::now() + lockout);
            self.failures = 0;
        }
    }

    fn record_success(&mut self) {
        self.failures = 0;
        self.locked_until = None;
    }
}

pub struct Authenticator {
    store: std::sync::Arc<CredentialStore>,
    pin_lockout: Mutex<LockoutState>,
    totp_lockout: Mutex<LockoutState>,
}

impl Authenticator {
    pub fn new(store: std::sync::Arc<CredentialStore>) -> Self {
        Self {
            store,
            pin_lockout: Mutex::new(LockoutState::default()),
            totp_lockout: Mutex::new(LockoutState::default()),
        }
    }

    // ── PIN ────────────────────────────────────────────────────────────

    /// Enroll a PIN. Numeric PINs need 6+ digits; anything else must be a
    /// 12+ character passphrase.
    pub fn configure_pin(&self, pin: &str) -> Result<()> {
        validate_pin(pin)?;
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(pin.as_bytes(), &salt)
            .map_err(|e| anyhow!("pin hashing failed: {}", e))?
            .to_string();
        self.store.store(KEY_PIN_HASH, &hash)?;
        Ok(())
    }

    pub fn verify_pin(&self, pin: &str) -> CoreResult<bool> {
        let mut lockout = self.pin_lockout.lock().expect("pin lockout lock");
        lockout.check()?;

        let Some(stored) = self
            .store
            .retrieve(KEY_PIN_HASH)
            .map_err(|e| CoreError::InvalidState(format!("credential store: {}", e)))?
        else {
            return Err(CoreError::InvalidState("no PIN enrolled".to_string()));
        };

        let parsed = PasswordHash::new(&stored)
            .map_err(|_| CoreError::InvalidState("corrupt PIN hash".to_string()))?;
        let ok = Argon2::default()
            .verify_password(pin.as_bytes(), &parsed)
            .is_ok();
        if ok {
            lockout.record_success();
        } else {
            lockout.record_failure(PIN_MAX_FAILURES, PIN_LOCKOUT);
        }
        Ok(ok)
    }

    // ── TOTP ───────────────────────────────────────────────────────────

    /// Enroll TOTP: generates a fresh 20-byte seed and backup codes. Backup
    /// codes are stored as SHA-256 hashes; the plaintext is returned once.
    pub fn configure_totp(&self) -> Result<TotpSetup> {
        let seed = random_bytes(20);
        self.store.store(KEY_TOTP_SEED, &BASE64.encode(&seed))?;

        let mut codes = Vec::with_capacity(BACKUP_CODE_COUNT);
        let mut hashes = Vec::with_capacity(BACKUP_CODE_COUNT);
        for _ in 0..BACKUP_CODE_COUNT {
            let code = hex::encode(random_bytes(4));
            hashes.push(hex::encode(Sha256::digest(code.as_bytes())));
            codes.push(code);
        }
        self.store
            .store(KEY_TOTP_BACKUP_CODES, &serde_json::to_string(&hashes)?)?;

        Ok(TotpSetup {
            seed_base32: base32_encode(&seed),
            backup_codes: codes,
        })
    }

    /// Verify a TOTP code (or a backup code) at the current time.
    pub fn verify_totp(&self, code: &str) -> CoreResult<bool> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.verify_totp_at(code, now)
    }

    /// Verification against an explicit unix time (tests and clock skew
    /// diagnostics).
    pub fn verify_totp_at(&self, code: &str, unix_time: u64) -> CoreResult<bool> {
        let mut lockout = self.totp_lockout.lock().expect("totp lockout lock");
        lockout.check()?;

        let Some(encoded) = self
            .store
            .retrieve(KEY_TOTP_SEED)
            .map_err(|e| CoreError::InvalidState(format!("credential store: {}", e)))?
        else {
            return Err(CoreError::InvalidState("no TOTP seed enrolled".to_string()));
        };
        let seed = BASE64
            .decode(&encoded)
            .map_err(|_| CoreError::InvalidState("corrupt TOTP seed".to_string()))?;

        let step = unix_time / TOTP_STEP_SECS;
        let mut ok = false;
        for candidate_step in [step.wrapping_sub(1), step, step + 1] {
            let expected = hotp(&seed, candidate_step, TOTP_DIGITS);
            if expected.as_bytes().ct_eq(code.as_bytes()).into() {
                ok = true;
            }
        }

        // Backup codes count as TOTP verification and are burned on use.
        if !ok {
            ok = self.consume_backup_code(code).unwrap_or(false);
        }

        if ok {
            lockout.record_success();
        } else {
            lockout.record_failure(TOTP_MAX_FAILURES, TOTP_LOCKOUT);
        }
        Ok(ok)
    }

    fn consume_backup_code(&self, code: &str) -> Result<bool> {
        let Some(json) = self.store.retrieve(KEY_TOTP_BACKUP_CODES)? else {
            return Ok(false);
        };
        let mut hashes: Vec<String> = serde_json::from_str(&json).unwrap_or_default();
        let digest = hex::encode(Sha256::digest(code.as_bytes()));
        let before = hashes.len();
        hashes.retain(|h| !bool::from(h.as_bytes().ct_eq(digest.as_bytes())));
        if hashes.len() == before {
            return Ok(false);
        }
        self.store
            .store(KEY_TOTP_BACKUP_CODES, &serde_json::to_string(&hashes)?)?;
        Ok(true)
    }

    // ── Facade ─────────────────────────────────────────────────────────

    /// Verify a supplied credential under the given method.
    pub fn verify(&self, method: AuthMethod, credential: &str) -> CoreResult<bool> {
        match method {
            AuthMethod::Pin => self.verify_pin(credential),
            AuthMethod::Totp => self.verify_totp(credential),
        }
    }

    /// Is a secret enrolled for the method?
    pub fn is_configured(&self, method: AuthMethod) -> bool {
        let key = match method {
            AuthMethod::Pin => KEY_PIN_HASH,
            AuthMethod::Totp => KEY_TOTP_SEED,
        };
        matches!(self.store.retrieve(key), Ok(Some(_)))
    }

    /// Switch methods: verify under the current method, set up the new one,
    /// then delete the old secret. Returns the TOTP setup when switching to
    /// TOTP.
    pub fn switch(
        &self,
        current: AuthMethod,
        current_credential: &str,
        new_pin: Option<&str>,
    ) -> CoreResult<Option<TotpSetup>> {
        if !self.verify(current, current_credential)? {
            return Err(CoreError::InvalidState(
                "current credential did not verify".to_string(),
            ));
        }
        let map_err = |e: anyhow::Error| CoreError::InvalidState(e.to_string());
        let setup = match current {
            AuthMethod::Pin => {
                let setup = self.configure_totp().map_err(map_err)?;
                self.store.delete(KEY_PIN_HASH).map_err(map_err)?;
                Some(setup)
            }
            AuthMethod::Totp => {
                let pin = new_pin.ok_or_else(|| {
                    CoreError::InvalidState("switching to pin requires a new pin".to_string())
                })?;
                self.configure_pin(pin).map_err(map_err)?;
                self.store.delete(KEY_TOTP_SEED).map_err(map_err)?;
                self.store.delete(KEY_TOTP_BACKUP_CODES).map_err(map_err)?;
                None
            }
        };
        Ok(setup)
    }
}

fn validate_pin(pin: &str) -> Result<()> {
    if pin.chars().all(|c| c.is_ascii_digit()) {
        if pin.len() < 6 {
            bail!("numeric PIN must be at least 6 digits");
        }
    } else if pin.len() < 12 {
        bail!("non-numeric passphrase must be at least 12 characters");
    }
    Ok(())
}

/// RFC 4226 HOTP truncation over HMAC-SHA1, zero-padded to `digits`.
fn hotp(seed: &[u8], counter: u64, digits: u32) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(seed).expect("hmac accepts any key length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[19] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);
    let code = binary % 10u32.pow(digits);
    format!("{:0width$}", code, width = digits as usize)
}

/// RFC 4648 base32 (no padding), the encoding authenticator apps expect for
/// seeds.
fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = String::new();
    let mut buffer = 0u64;
    let mut bits = 0u32;
    for &byte in data {
        buffer = (buffer << 8) | byte as u64;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}
