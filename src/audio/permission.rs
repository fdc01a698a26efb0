//! Microphone permission oracle

use futures_util::future::{self, BoxFuture, FutureExt};

/// Answers whether the process may open the microphone.
///
/// The request may suspend until the user responds to a system prompt.
pub trait PermissionOracle: Send + Sync {
    fn request_microphone_permission(&self) -> BoxFuture<'_, bool>;
}

/// Oracle with a fixed answer.
///
/// Desktop hosts without a permission API use `StaticPermission::granted()`
/// and let the OS prompt when the stream opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticPermission(pub bool);

impl StaticPermission {
    pub fn granted() -> Self {
        Self(true)
    }

    pub fn denied() -> Self {
        Self(false)
    }
}

impl PermissionOracle for StaticPermission {
    fn request_microphone_permission(&self) -> BoxFuture<'_, bool> {
        future::ready(self.0).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_permission_answers_immediately() {
        assert!(StaticPermission::granted().request_microphone_permission().await);
        assert!(!StaticPermission::denied().request_microphone_permission().await);
    }
}
