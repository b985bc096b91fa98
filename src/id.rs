use rand::RngCore as _;

/// Length, in bytes, of the random token in a [`ConsumerId`].
const TOKEN_BYTES: usize = 10;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum IdentityError {
    #[error("could not determine the host name")]
    Hostname,
    #[error("could not gather random bytes for the consumer token: {source}")]
    Random {
        #[source]
        source: rand::Error,
    },
}

/// Identifies a single queue handle among every process sharing the
/// queue.
///
/// Rendered as `host/queue/token/pid`, where the token is 10 random
/// bytes from the operating system, hex-encoded.  This is the member
/// name used in the presence set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub(crate) String);

impl ConsumerId {
    /// Generates a fresh identity for a handle on `queue`.
    ///
    /// Fails, rather than falling back to a weaker identity, if the
    /// host name or the random token cannot be obtained.
    pub fn generate(queue: &str) -> Result<Self, IdentityError> {
        let host = sysinfo::System::host_name().ok_or(IdentityError::Hostname)?;

        let mut token = [0u8; TOKEN_BYTES];
        rand::rngs::OsRng
            .try_fill_bytes(&mut token)
            .map_err(|source| IdentityError::Random { source })?;

        Ok(Self(format!(
            "{host}/{queue}/{}/{}",
            hex::encode(token),
            std::process::id()
        )))
    }

    /// Wraps a member name read back from the presence set.
    pub(crate) fn new(id: impl Into<String>) -> Self { Self(id.into()) }
}

impl AsRef<str> for ConsumerId {
    fn as_ref(&self) -> &str { &self.0 }
}

impl std::ops::Deref for ConsumerId {
    type Target = str;

    fn deref(&self) -> &Self::Target { &self.0 }
}

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { self.0.fmt(f) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_four_parts() {
        let id = ConsumerId::generate("mailer").expect("generate");
        let parts = id.split('/').collect::<Vec<_>>();

        assert_eq!(parts.len(), 4, "unexpected id {id}");
        assert!(!parts[0].is_empty());
        assert_eq!(parts[1], "mailer");
        assert_eq!(parts[2].len(), TOKEN_BYTES * 2);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(parts[3], std::process::id().to_string());
    }

    #[test]
    fn never_repeats() {
        let a = ConsumerId::generate("mailer").expect("generate");
        let b = ConsumerId::generate("mailer").expect("generate");

        assert_ne!(a, b);
    }
}
