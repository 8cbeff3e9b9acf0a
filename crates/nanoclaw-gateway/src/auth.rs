//! Token check for WebSocket clients

use nanoclaw_core::{Error, Result};

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Gateway auth. With no token configured every client is accepted.
#[derive(Clone, Debug, Default)]
pub struct ResolvedAuth {
    token: Option<String>,
}

impl ResolvedAuth {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub fn required(&self) -> bool {
        self.token.is_some()
    }

    pub fn verify_token(&self, provided: Option<&str>) -> Result<()> {
        let Some(expected) = self.token.as_deref() else {
            return Ok(());
        };
        let provided = provided.ok_or_else(|| Error::auth_failed("token required"))?;
        if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            return Err(Error::auth_failed("invalid token"));
        }
        Ok(())
    }
}
