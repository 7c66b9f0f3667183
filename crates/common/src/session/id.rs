//! Session identifier generation

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Produces fixed-length, URL-safe random tokens.
///
/// 62 symbols per character; at the default length of 20 the space is
/// ~7e35, and the matcher still checks the store before using a token.
#[derive(Debug, Clone)]
pub struct SessionIdGenerator {
    length: usize,
}

impl SessionIdGenerator {
    pub const DEFAULT_LENGTH: usize = 20;
    pub const MIN_LENGTH: usize = 8;
    /// Longest id the realtime protocol accepts in a frame.
    pub const MAX_LENGTH: usize = 64;

    pub fn new(length: usize) -> Self {
        Self {
            length: length.clamp(Self::MIN_LENGTH, Self::MAX_LENGTH),
        }
    }

    pub fn generate(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(self.length)
            .map(char::from)
            .collect()
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LENGTH)
    }
}
