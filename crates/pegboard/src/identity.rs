//! Owner-token production.

use rand::Rng;

/// Produces the owner token that identifies this process in the backend.
///
/// The token is stored as the claim value and compared on renewal, so it
/// must be stable for the process lifetime and unique across processes.
/// Tests typically substitute a fixed-token implementation.
pub trait IdentityProvider {
    /// A new owner token. Called once per slot acquisition.
    fn owner_token(&self) -> String;
}

/// Default identity: `"{hostname}:{pid}:{entropy}"`.
///
/// The hostname comes from the `HOSTNAME` environment variable, falling
/// back to `"localhost"`; the entropy suffix keeps tokens unique even when
/// pids are recycled inside a container.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessIdentity;

impl IdentityProvider for ProcessIdentity {
    fn owner_token(&self) -> String {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let pid = std::process::id();
        let entropy: u64 = rand::rng().random();
        format!("{host}:{pid}:{:012x}", entropy & 0xffff_ffff_ffff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_embeds_pid() {
        let token = ProcessIdentity.owner_token();
        assert!(token.contains(&std::process::id().to_string()));
    }

    #[test]
    fn tokens_are_unique_per_call() {
        let a = ProcessIdentity.owner_token();
        let b = ProcessIdentity.owner_token();
        assert_ne!(a, b);
    }
}
