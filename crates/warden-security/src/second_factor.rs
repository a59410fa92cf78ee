use std::sync::atomic::{AtomicU64, Ordering};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use tracing::warn;

use warden_types::{Result, WardenError};

type HmacSha256 = Hmac<Sha256>;

/// Proof that a second factor was checked for one operation.
///
/// Only [`SecondFactor::authorize`] can mint one, so a token is consumed once
/// and the proof is handed on instead of the token.
#[derive(Debug)]
pub struct Authorization {
    operation: String,
}

impl Authorization {
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Fail unless this proof was issued for `operation`.
    pub fn require(&self, operation: &str) -> Result<()> {
        if self.operation == operation {
            Ok(())
        } else {
            Err(WardenError::SecondFactorInvalid(format!(
                "{operation} (authorization was issued for {})",
                self.operation
            )))
        }
    }
}

/// Out-of-band confirmation required for destructive or trust-lowering commands.
pub trait SecondFactor: Send + Sync {
    fn verify(&self, token: &str) -> bool;

    /// Check a possibly missing token for `operation`.
    fn authorize(&self, operation: &str, token: Option<&str>) -> Result<Authorization> {
        match token {
            None => Err(WardenError::SecondFactorRequired(operation.to_string())),
            Some(t) if self.verify(t) => Ok(Authorization {
                operation: operation.to_string(),
            }),
            Some(_) => Err(WardenError::SecondFactorInvalid(operation.to_string())),
        }
    }
}

/// Time-based one-time codes: HMAC-SHA256 over the step counter, six digits.
///
/// Each step is accepted at most once: a code at or before the last accepted
/// step is rejected even inside the skew window.
pub struct TotpVerifier {
    secret: Vec<u8>,
    step_secs: u64,
    skew: u64,
    /// Last accepted step plus one; zero means none yet.
    used: AtomicU64,
}

impl TotpVerifier {
    pub const DIGITS: u32 = 6;

    pub fn new(secret: impl Into<Vec<u8>>, step_secs: u64, skew: u64) -> Self {
        Self {
            secret: secret.into(),
            step_secs: step_secs.max(1),
            skew,
            used: AtomicU64::new(0),
        }
    }

    /// Build from an environment variable holding the shared secret.
    pub fn from_env(var: &str, step_secs: u64, skew: u64) -> Result<Self> {
        let secret = std::env::var(var)
            .map_err(|_| WardenError::KeyUnavailable(format!("second factor secret ${var} not set")))?;
        if secret.is_empty() {
            return Err(WardenError::KeyUnavailable(format!(
                "second factor secret ${var} is empty"
            )));
        }
        Ok(Self::new(secret.into_bytes(), step_secs, skew))
    }

    fn code_for_counter(&self, counter: u64) -> String {
        // HMAC accepts keys of any length.
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);
        format!(
            "{:0width$}",
            binary % 10u32.pow(Self::DIGITS),
            width = Self::DIGITS as usize
        )
    }

    /// The code valid at unix time `unix_secs`.
    pub fn code_at(&self, unix_secs: u64) -> String {
        self.code_for_counter(unix_secs / self.step_secs)
    }

    pub fn current_code(&self) -> String {
        self.code_at(now_unix())
    }

    pub fn verify_at(&self, token: &str, unix_secs: u64) -> bool {
        let token = token.trim();
        if token.len() != Self::DIGITS as usize {
            return false;
        }
        let counter = unix_secs / self.step_secs;
        let lo = counter.saturating_sub(self.skew);
        let hi = counter.saturating_add(self.skew);
        let mut matched = None;
        for c in lo..=hi {
            let expected = self.code_for_counter(c);
            if bool::from(expected.as_bytes().ct_eq(token.as_bytes())) {
                matched = Some(c);
            }
        }
        let Some(step) = matched else {
            return false;
        };
        let accepted = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (step + 1 > used).then_some(step + 1)
            })
            .is_ok();
        if !accepted {
            warn!(step, "Rejected replayed second factor code");
        }
        accepted
    }
}

impl SecondFactor for TotpVerifier {
    fn verify(&self, token: &str) -> bool {
        self.verify_at(token, now_unix())
    }
}

/// Refuses every token. Used when no second factor secret is configured.
pub struct DenyAll;

impl SecondFactor for DenyAll {
    fn verify(&self, _token: &str) -> bool {
        false
    }
}

fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
