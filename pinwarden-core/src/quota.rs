//! Per-principal storage accounting.
//!
//! Every principal shares the same process-wide byte limit but is charged
//! independently. The check and the charge happen under one lock so two
//! concurrent reservations can never both squeeze under the limit.

use crate::snapshot::PrincipalReport;
use crate::types::normalize_address;
use crate::{Result, WardenError};
use num_bigint::BigUint;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default)]
struct PrincipalUsage {
    used: BigUint,
    used_percent: u64,
}

#[derive(Debug)]
struct LedgerState {
    limit: BigUint,
    principals: HashMap<String, PrincipalUsage>,
}

impl LedgerState {
    fn entry(&mut self, principal: &str) -> &mut PrincipalUsage {
        self.principals.entry(principal.to_string()).or_default()
    }

    fn fits(&self, principal: &str, amount: &BigUint) -> bool {
        let used = self
            .principals
            .get(principal)
            .map(|usage| usage.used.clone())
            .unwrap_or_default();
        used + amount < self.limit
    }

    fn refresh_percent(&mut self, principal: &str) {
        let limit = self.limit.clone();
        if let Some(usage) = self.principals.get_mut(principal) {
            usage.used_percent = percent_of(&usage.used, &limit);
        }
    }
}

pub struct QuotaLedger {
    state: Mutex<LedgerState>,
}

impl QuotaLedger {
    pub fn new(limit: BigUint) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                limit,
                principals: HashMap::new(),
            }),
        }
    }

    /// Create a zero-usage record if the principal is unknown.
    pub async fn ensure(&self, principal: &str) {
        let principal = normalize_address(principal);
        let mut state = self.state.lock().await;
        if !state.principals.contains_key(&principal) {
            tracing::info!("registered principal {}", principal);
            state.entry(&principal);
        }
    }

    pub async fn contains(&self, principal: &str) -> bool {
        let principal = normalize_address(principal);
        self.state.lock().await.principals.contains_key(&principal)
    }

    /// `used + amount < limit`; exact equality is denied.
    pub async fn can_reserve(&self, principal: &str, amount: &BigUint) -> bool {
        let principal = normalize_address(principal);
        self.state.lock().await.fits(&principal, amount)
    }

    /// Unconditional charge. Callers that need admission control use
    /// [`QuotaLedger::try_reserve`].
    pub async fn reserve(&self, principal: &str, amount: &BigUint) {
        let principal = normalize_address(principal);
        let mut state = self.state.lock().await;
        let usage = state.entry(&principal);
        usage.used += amount;
        state.refresh_percent(&principal);
    }

    /// Check and charge as one step.
    pub async fn try_reserve(&self, principal: &str, amount: &BigUint) -> Result<()> {
        let principal = normalize_address(principal);
        let mut state = self.state.lock().await;

        if !state.fits(&principal, amount) {
            let used = state
                .principals
                .get(&principal)
                .map(|usage| usage.used.clone())
                .unwrap_or_default();
            return Err(WardenError::QuotaExceeded {
                principal,
                requested: amount.to_string(),
                used: used.to_string(),
                limit: state.limit.to_string(),
            });
        }

        let usage = state.entry(&principal);
        usage.used += amount;
        state.refresh_percent(&principal);
        Ok(())
    }

    pub async fn release(&self, principal: &str, amount: &BigUint) {
        let principal = normalize_address(principal);
        let mut state = self.state.lock().await;
        let usage = state.entry(&principal);

        if usage.used < *amount {
            tracing::warn!(
                "release of {} bytes exceeds usage {} for {}; clamping to zero",
                amount,
                usage.used,
                principal
            );
            usage.used = BigUint::default();
        } else {
            usage.used -= amount;
        }
        state.refresh_percent(&principal);
    }

    pub async fn usage(&self, principal: &str) -> BigUint {
        let principal = normalize_address(principal);
        self.state
            .lock()
            .await
            .principals
            .get(&principal)
            .map(|usage| usage.used.clone())
            .unwrap_or_default()
    }

    pub async fn limit(&self) -> BigUint {
        self.state.lock().await.limit.clone()
    }

    pub async fn set_limit(&self, limit: BigUint) {
        let mut state = self.state.lock().await;
        tracing::info!("setting per-principal limit to {} bytes", limit);
        state.limit = limit;

        let principals: Vec<String> = state.principals.keys().cloned().collect();
        for principal in principals {
            state.refresh_percent(&principal);
        }
    }

    pub async fn report(&self) -> Vec<PrincipalReport> {
        let state = self.state.lock().await;
        let mut reports: Vec<PrincipalReport> = state
            .principals
            .iter()
            .map(|(principal, usage)| PrincipalReport {
                principal: principal.clone(),
                used: usage.used.to_string(),
                limit: state.limit.to_string(),
                used_percent: usage.used_percent,
            })
            .collect();
        reports.sort_by(|a, b| a.principal.cmp(&b.principal));
        reports
    }
}

fn percent_of(used: &BigUint, limit: &BigUint) -> u64 {
    if *limit == BigUint::default() {
        return 0;
    }

    let percent = used * BigUint::from(100u32) / limit;
    u64::try_from(&percent).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bytes(n: u64) -> BigUint {
        BigUint::from(n)
    }

    #[tokio::test]
    async fn test_strict_limit_boundary() {
        let ledger = QuotaLedger::new(bytes(1000));
        ledger.ensure("0xAAA").await;
        ledger.reserve("0xaaa", &bytes(850)).await;

        assert!(ledger.can_reserve("0xaaa", &bytes(149)).await);
        assert!(!ledger.can_reserve("0xaaa", &bytes(150)).await);

        ledger.reserve("0xaaa", &bytes(50)).await;
        assert!(!ledger.can_reserve("0xaaa", &bytes(150)).await);

        let error = ledger.try_reserve("0xaaa", &bytes(150)).await.unwrap_err();
        assert!(matches!(error, WardenError::QuotaExceeded { .. }));
        assert_eq!(ledger.usage("0xaaa").await, bytes(900));
    }

    #[tokio::test]
    async fn test_release_and_percent() {
        let ledger = QuotaLedger::new(bytes(200));
        tokio_test::assert_ok!(ledger.try_reserve("0xBBB", &bytes(100)).await);

        let report = ledger.report().await;
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].principal, "0xbbb");
        assert_eq!(report[0].used_percent, 50);

        ledger.release("0xbbb", &bytes(60)).await;
        assert_eq!(ledger.usage("0xbbb").await, bytes(40));

        ledger.release("0xbbb", &bytes(500)).await;
        assert_eq!(ledger.usage("0xbbb").await, bytes(0));
    }

    #[tokio::test]
    async fn test_limit_change_recomputes_percent() {
        let ledger = QuotaLedger::new(bytes(1000));
        ledger.reserve("0xccc", &bytes(250)).await;
        ledger.set_limit(bytes(500)).await;

        let report = ledger.report().await;
        assert_eq!(report[0].used_percent, 50);
        assert_eq!(report[0].limit, "500");
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_overrun() {
        let ledger = Arc::new(QuotaLedger::new(bytes(1000)));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.try_reserve("0xddd", &bytes(100)).await.is_ok()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 9);
        assert_eq!(ledger.usage("0xddd").await, bytes(900));
    }
}
