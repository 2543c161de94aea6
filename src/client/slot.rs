use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::protocol::RpcResponse;
use crate::{CorrelationId, Result, RpcError};

/// Single-resolution handle for one remote call.
///
/// Returned immediately by [`RpcClient::call`](crate::RpcClient::call);
/// awaiting it yields the decoded response envelope or the error that ended
/// the call (timeout, publish failure, broker unavailable, client closed).
/// Dropping the slot does not cancel the call; its table entry is still
/// cleaned up by the response or the deadline.
#[derive(Debug)]
pub struct ResultSlot {
    // ---
    id: CorrelationId,
    rx: oneshot::Receiver<Result<RpcResponse>>,
}

impl ResultSlot {
    pub(crate) fn new(id: CorrelationId, rx: oneshot::Receiver<Result<RpcResponse>>) -> Self {
        Self { id, rx }
    }

    /// Correlation id attached to the published request.
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.id
    }

    /// Non-blocking check; `None` while the call is still pending.
    pub fn try_result(&mut self) -> Option<Result<RpcResponse>> {
        // ---
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(RpcError::Closed)),
        }
    }
}

impl Future for ResultSlot {
    type Output = Result<RpcResponse>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // ---
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // resolver dropped without sending: the driver is gone
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
