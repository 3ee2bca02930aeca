use std::time::Instant;

use tokio_util::sync::CancellationToken;

/// Carries the deadline and cancellation signal for one outward call,
/// the way every upstream exchange and every resolver step is
/// expected to respect.
///
/// Cloning a `Context` shares the same cancellation token: cancelling
/// any clone cancels every other clone derived from it, which is how
/// a parallel upstream race cancels the siblings of the winning task.
#[derive(Debug, Clone)]
pub struct Context {
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl Context {
    /// A context with no deadline and no parent cancellation.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// A child of this context, scoped to its own cancellation token,
    /// but cancelled automatically when the parent is.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancellation: self.cancellation.child_token(),
        }
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancellation: self.cancellation.clone(),
        }
    }

    /// Ensure a deadline is set, attaching `fallback` if one is not
    /// already present.
    pub fn or_deadline(&self, fallback: Instant) -> Self {
        if self.deadline.is_some() {
            self.clone()
        } else {
            self.with_deadline(fallback)
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Resolves once this context is cancelled; never resolves
    /// otherwise.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn child_is_cancelled_with_parent() {
        let parent = Context::background();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn or_deadline_does_not_override() {
        let now = Instant::now();
        let ctx = Context::background().with_deadline(now);
        let still = ctx.or_deadline(now + Duration::from_secs(60));
        assert_eq!(still.deadline(), Some(now));
    }

    #[test]
    fn or_deadline_attaches_when_absent() {
        let now = Instant::now();
        let ctx = Context::background().or_deadline(now);
        assert_eq!(ctx.deadline(), Some(now));
    }
}
