//! Byte metering of retrieval bodies and the settlement that follows.
//!
//! [`MeteredBody`] wraps the upstream byte stream. A chunk counts as
//! delivered once the server polls for the next one, i.e. after the previous
//! chunk has been written out. When the stream ends, fails or is dropped the
//! delivered total is sent to [`Settlement`], which turns it into a cost and
//! redeems the authorization.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use num_bigint::BigUint;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::fil::Fil;
use crate::models::RedeemOutcome;

use super::client::EscrowBank;

/// `floor(bytes * cost / sector_size)`, in attoFIL.
pub fn retrieval_cost(bytes: u64, cost: &Fil, sector_size: u64) -> Fil {
    if sector_size == 0 {
        return Fil::zero();
    }
    Fil::from_atto(BigUint::from(bytes) * cost.atto() / BigUint::from(sector_size))
}

pub struct MeteredBody<S> {
    inner: S,
    /// Size of the chunk handed out last, not yet known to be written.
    pending: u64,
    delivered: u64,
    report: Option<oneshot::Sender<u64>>,
}

impl<S> MeteredBody<S> {
    /// Wrap `inner`; the receiver yields the delivered byte count exactly once.
    pub fn new(inner: S) -> (Self, oneshot::Receiver<u64>) {
        let (tx, rx) = oneshot::channel();
        let body = Self {
            inner,
            pending: 0,
            delivered: 0,
            report: Some(tx),
        };
        (body, rx)
    }

    fn finish(&mut self) {
        if let Some(report) = self.report.take() {
            let _ = report.send(self.delivered);
        }
    }
}

impl<S, E> Stream for MeteredBody<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        this.delivered += std::mem::take(&mut this.pending);

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.pending = chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for MeteredBody<S> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Billing for one verified retrieval.
pub struct Settlement {
    pub bank: Arc<dyn EscrowBank>,
    pub bank_name: String,
    pub authorization: Uuid,
    /// Amount the authorization was verified for; the charge never exceeds it.
    pub verified: Fil,
    pub provider_cost: Fil,
    pub sector_size: u64,
    pub timeout: Duration,
}

impl Settlement {
    /// Redeem for `bytes` delivered. Returns `None` when nothing was billed.
    pub async fn settle(self, bytes: u64) -> Option<RedeemOutcome> {
        let id = self.authorization;
        if bytes == 0 {
            info!("Authorization {id}: no bytes delivered, not billing");
            return None;
        }

        let cost = retrieval_cost(bytes, &self.provider_cost, self.sector_size).min(self.verified);
        match tokio::time::timeout(self.timeout, self.bank.redeem(id, &cost)).await {
            Ok(Ok(outcome)) => {
                info!(
                    "Redeemed {cost} for {bytes} bytes on authorization {id} at {} (excess {})",
                    self.bank_name, outcome.excess
                );
                Some(outcome)
            }
            Ok(Err(e)) => {
                error!("Redeem of {cost} on authorization {id} at {} failed: {e}", self.bank_name);
                None
            }
            Err(_) => {
                error!("Redeem on authorization {id} at {} timed out", self.bank_name);
                None
            }
        }
    }

    /// Hand the authorization back at zero cost when nothing could be served.
    pub async fn release(self) -> Option<RedeemOutcome> {
        let id = self.authorization;
        match tokio::time::timeout(self.timeout, self.bank.redeem(id, &Fil::zero())).await {
            Ok(Ok(outcome)) => {
                info!(
                    "Released authorization {id} at {} ({} back to the client)",
                    self.bank_name, outcome.excess
                );
                Some(outcome)
            }
            Ok(Err(e)) => {
                error!("Release of authorization {id} at {} failed: {e}", self.bank_name);
                None
            }
            Err(_) => {
                error!("Release of authorization {id} at {} timed out", self.bank_name);
                None
            }
        }
    }
}

/// Settle in the background once the body reports its delivered size.
pub fn spawn_settlement(settlement: Settlement, delivered: oneshot::Receiver<u64>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bytes = delivered.await.unwrap_or_else(|_| {
            warn!(
                "Authorization {}: body vanished without reporting",
                settlement.authorization
            );
            0
        });
        settlement.settle(bytes).await;
    })
}
