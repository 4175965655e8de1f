//! Live observation feed port trait.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::aggregator::Observation;
use crate::domain::error::BarsimError;

/// Upstream market data connection.
///
/// `subscribe` hands back the receiving end of the observation channel. The
/// feed closing its sender is treated as an upstream disconnect.
#[async_trait]
pub trait LiveFeed: Send {
    async fn subscribe(
        &mut self,
        symbols: &[String],
    ) -> Result<mpsc::Receiver<Observation>, BarsimError>;

    async fn unsubscribe(&mut self, symbols: &[String]) -> Result<(), BarsimError>;

    async fn disconnect(&mut self) -> Result<(), BarsimError>;
}
