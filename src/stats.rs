//! Best-effort request statistics.
//!
//! Transport failures are interesting for connectivity diagnostics but must
//! never slow down or fail the request path, so recording is synchronous,
//! cheap, and infallible.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeStats {
    pub successes: u64,
    pub failures: u64,
}

/// Per-scope success/failure counters with the last observed error.
#[derive(Default)]
pub struct UsageStats {
    scopes: Mutex<HashMap<String, ScopeStats>>,
    last_error: Mutex<Option<String>>,
}

impl UsageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, scope: &str) {
        let mut scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
        scopes.entry(scope.to_string()).or_default().successes += 1;
    }

    pub fn record_failure(&self, scope: &str, url: &str, error: &str) {
        tracing::debug!(scope, url, error, "request failed");
        let mut scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
        scopes.entry(scope.to_string()).or_default().failures += 1;
        drop(scopes);
        let mut last = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(format!("{}: {}", url, error));
    }

    pub fn scope(&self, scope: &str) -> ScopeStats {
        let scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
        scopes.get(scope).copied().unwrap_or_default()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
