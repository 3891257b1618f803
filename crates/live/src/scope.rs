use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifetime of a mounted view. Requests take a ticket when they are issued; once the
/// view is torn down every outstanding ticket reads as dead and its result is dropped.
#[derive(Debug, Clone)]
pub struct ViewScope {
    live: Arc<AtomicBool>,
}

impl ViewScope {
    pub fn new() -> Self {
        Self {
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn ticket(&self) -> ScopeTicket {
        ScopeTicket {
            live: self.live.clone(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            tracing::debug!("view scope closed");
        }
    }
}

impl Default for ViewScope {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ScopeTicket {
    live: Arc<AtomicBool>,
}

impl ScopeTicket {
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tickets_die_with_the_scope() {
        let scope = ViewScope::new();
        let early = scope.ticket();
        assert!(early.is_live());

        let clone = scope.clone();
        clone.close();
        assert!(!scope.is_live());
        assert!(!early.is_live());
        assert!(!scope.ticket().is_live());
    }
}
