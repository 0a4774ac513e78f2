use teamserver_core::crypto::{generate_token, hash_token, verify_token_hash, ADMIN_TOKEN_PREFIX};

/// The single bootstrap credential for `/api/admin/*`.
///
/// Only the SHA-256 hash is held; a lost token means re-initializing.
#[derive(Clone)]
pub struct AdminAuth {
    token_hash: String,
}

impl std::fmt::Debug for AdminAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AdminAuth(<redacted>)")
    }
}

impl AdminAuth {
    pub fn new(token_hash: impl Into<String>) -> Self {
        Self {
            token_hash: token_hash.into(),
        }
    }

    /// Generates a fresh admin token. Returns the plaintext for the operator
    /// along with the verifier to persist.
    pub fn generate() -> (String, Self) {
        let token = generate_token(ADMIN_TOKEN_PREFIX);
        let auth = Self::new(hash_token(&token));
        (token, auth)
    }

    pub fn token_hash(&self) -> &str {
        &self.token_hash
    }

    pub fn verify(&self, token: &str) -> bool {
        verify_token_hash(token, &self.token_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_token_verifies() {
        let (token, auth) = AdminAuth::generate();
        assert!(token.starts_with(ADMIN_TOKEN_PREFIX));
        assert!(auth.verify(&token));
        assert!(!auth.verify("tsa_wrong"));
        assert!(!auth.verify(auth.token_hash()));
    }

    #[test]
    fn test_debug_redacts() {
        let (_, auth) = AdminAuth::generate();
        assert_eq!(format!("{:?}", auth), "AdminAuth(<redacted>)");
    }
}
