//! Payment Intent Creator
//!
//! Validates a new payment locally, then submits it. Static bounds are
//! checked before anything touches the network; the remaining-balance bound
//! needs one (cached) balance fetch.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::Instant;

use tuition_core::{
    CreatePaymentRequest, PaymentGateway, PaymentIntent, PaymentMethod, RemainingBalance, Result,
};

use crate::config::MethodRules;

/// Remaining balance trusted for a short staleness window
#[derive(Debug)]
pub struct BalanceCache {
    ttl: Duration,
    cached: Mutex<Option<(RemainingBalance, Instant)>>,
}

impl BalanceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cached: Mutex::new(None),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Option<(RemainingBalance, Instant)>> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached balance, if still fresh
    pub fn get(&self) -> Option<RemainingBalance> {
        let cached = *self.guard();
        cached
            .filter(|(_, fetched_at)| fetched_at.elapsed() < self.ttl)
            .map(|(balance, _)| balance)
    }

    pub fn put(&self, balance: RemainingBalance) {
        *self.guard() = Some((balance, Instant::now()));
    }

    pub fn invalidate(&self) {
        if self.guard().take().is_some() {
            tracing::debug!("Remaining balance cache invalidated");
        }
    }
}

/// Creates payment intents
pub struct PaymentCreator {
    gateway: Arc<dyn PaymentGateway>,
    rules: MethodRules,
    balance: Arc<BalanceCache>,
}

impl PaymentCreator {
    pub fn new(gateway: Arc<dyn PaymentGateway>, rules: MethodRules, balance: Arc<BalanceCache>) -> Self {
        Self {
            gateway,
            rules,
            balance,
        }
    }

    pub fn rules(&self) -> &MethodRules {
        &self.rules
    }

    /// Remaining payable tuition, from cache when fresh
    pub async fn remaining_balance(&self) -> Result<RemainingBalance> {
        if let Some(balance) = self.balance.get() {
            return Ok(balance);
        }

        let balance = self.gateway.get_remaining_balance().await?;
        tracing::debug!(remaining = %balance.remaining, "Fetched remaining balance");
        self.balance.put(balance);
        Ok(balance)
    }

    /// Validate and submit a payment.
    ///
    /// A validation error means nothing was sent; a gateway error means
    /// nothing was created.
    pub async fn create(&self, nominal: Decimal, method: PaymentMethod) -> Result<PaymentIntent> {
        self.rules.check(nominal, &method)?;

        let remaining = self.remaining_balance().await?.remaining;
        self.rules.check_remaining(nominal, remaining)?;

        let request = CreatePaymentRequest::new(nominal, method);
        let intent = self.gateway.create_payment(&request).await.map_err(|e| {
            tracing::warn!(
                nominal = %request.nominal,
                method = %request.method,
                error = %e,
                "Payment creation rejected"
            );
            e
        })?;

        tracing::info!(
            uuid = %intent.uuid,
            nominal = %intent.nominal,
            total = %intent.total_amount,
            method = %intent.method,
            "Payment intent created"
        );
        Ok(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tuition_core::{MockGateway, PaymentError, PaymentStatus, ValidationError};

    fn creator(gateway: &Arc<MockGateway>) -> PaymentCreator {
        PaymentCreator::new(
            gateway.clone(),
            MethodRules::default(),
            Arc::new(BalanceCache::new(Duration::from_secs(5))),
        )
    }

    #[tokio::test]
    async fn test_static_violation_makes_no_call() {
        let gateway = Arc::new(MockGateway::default());
        let creator = creator(&gateway);

        let err = creator.create(dec!(300_000), PaymentMethod::Qris).await.unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Validation(ValidationError::AboveMethodMaximum { .. })
        ));
        assert_eq!(gateway.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_exceeding_remaining_balance() {
        let gateway = Arc::new(MockGateway::new(dec!(80_000)));
        let creator = creator(&gateway);

        let err = creator
            .create(dec!(100_000), PaymentMethod::virtual_account("bri"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Validation(ValidationError::ExceedsRemaining { .. })
        ));
        assert_eq!(gateway.calls().balance, 1);
        assert_eq!(gateway.calls().create, 0);
    }

    #[tokio::test]
    async fn test_creates_pending_intent() {
        let gateway = Arc::new(MockGateway::default());
        let creator = creator(&gateway);

        let intent = creator
            .create(dec!(100_000), PaymentMethod::virtual_account("bank"))
            .await
            .unwrap();

        assert_eq!(intent.status, PaymentStatus::Pending);
        assert_eq!(intent.total_amount, dec!(104_000));
        assert!(intent.payment_reference.is_some());
        assert!(gateway.payment(&intent.uuid).is_some());
    }

    #[tokio::test]
    async fn test_gateway_rejection_propagates() {
        let gateway = Arc::new(MockGateway::default());
        gateway.reject_create(Some("Gagal membuat pembayaran"));
        let creator = creator(&gateway);

        let err = creator.create(dec!(100_000), PaymentMethod::Qris).await.unwrap_err();
        assert!(err.is_gateway_error());
        assert_eq!(err.user_message(), "Gagal membuat pembayaran");
    }

    #[tokio::test(start_paused = true)]
    async fn test_balance_cache_ttl() {
        let gateway = Arc::new(MockGateway::default());
        let cache = Arc::new(BalanceCache::new(Duration::from_secs(5)));
        let creator = PaymentCreator::new(gateway.clone(), MethodRules::default(), cache.clone());

        creator.remaining_balance().await.unwrap();
        creator.remaining_balance().await.unwrap();
        assert_eq!(gateway.calls().balance, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        creator.remaining_balance().await.unwrap();
        assert_eq!(gateway.calls().balance, 2);

        cache.invalidate();
        creator.remaining_balance().await.unwrap();
        assert_eq!(gateway.calls().balance, 3);
    }
}
