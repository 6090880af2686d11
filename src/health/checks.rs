//! Standard checks built from a queue client's shared status.

use std::sync::Arc;

use crate::messaging::ClientStatus;
use crate::resilience::CircuitState;

/// Passes while the client holds a live broker connection
pub fn queue_connectivity_check(
    status: Arc<ClientStatus>,
) -> impl Fn() -> anyhow::Result<bool> + Send + Sync + 'static {
    move || Ok(status.is_connected() && !status.is_degraded())
}

/// Passes while the client's circuit breaker is closed; an open breaker
/// reports its failure count as the error
pub fn circuit_breaker_check(
    status: Arc<ClientStatus>,
) -> impl Fn() -> anyhow::Result<bool> + Send + Sync + 'static {
    move || {
        let breaker = status.breaker();
        match breaker.state() {
            CircuitState::Closed => Ok(true),
            CircuitState::HalfOpen => Ok(false),
            CircuitState::Open => anyhow::bail!(
                "circuit breaker '{}' open after {} consecutive failures",
                breaker.name(),
                breaker.failure_count()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MessagingError;
    use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};
    use std::time::Duration;

    fn status(threshold: u32) -> Arc<ClientStatus> {
        Arc::new(ClientStatus::new(Arc::new(CircuitBreaker::new(
            "broker",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(60),
            },
        ))))
    }

    #[test]
    fn test_connectivity_check_follows_status() {
        let status = status(5);
        let check = queue_connectivity_check(Arc::clone(&status));
        assert!(!check().unwrap());

        status.mark_connected();
        assert!(check().unwrap());

        status.mark_disconnected();
        assert!(!check().unwrap());
    }

    #[tokio::test]
    async fn test_circuit_breaker_check_reports_open_breaker() {
        let status = status(1);
        let check = circuit_breaker_check(Arc::clone(&status));
        assert!(check().unwrap());

        let _ = status
            .breaker()
            .call(|| async { Err::<(), _>(MessagingError::connection("refused")) })
            .await;

        let err = check().unwrap_err();
        assert!(err.to_string().contains("open after 1 consecutive failures"));
    }
}
