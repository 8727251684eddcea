//! Admission receipts.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

/// Opaque receipt handed out on admission.
///
/// A token correlates an admitted request across logs and clients; it is
/// not a credential and carries no secret.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token([u8; 32]);

impl Token {
    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering (64 characters).
    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    /// First eight hex digits, for log lines.
    ///
    /// Nothing is rendered until the result is formatted.
    pub fn short(&self) -> ShortToken<'_> {
        ShortToken(self)
    }
}

/// Abbreviated [`Token`] rendering returned by [`Token::short`].
#[derive(Debug, Clone, Copy)]
pub struct ShortToken<'a>(&'a Token);

impl fmt::Display for ShortToken<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 .0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}…)", self.short())
    }
}

/// Build the receipt for `key` admitted at `nanos` since the Unix epoch.
pub fn issue(key: &str, nanos: u128) -> Token {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", key, nanos).as_bytes());
    Token(hasher.finalize().into())
}

/// Build the receipt for `key` admitted now.
pub fn issue_now(key: &str) -> Token {
    // Clocks set before the epoch hash as instant 0.
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    issue(key, nanos)
}
