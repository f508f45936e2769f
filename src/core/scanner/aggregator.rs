// src/core/scanner/aggregator.rs

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

use crate::core::models::ProbeResult;

/// Results of one run, in the order they complete.
///
/// Consumed either incrementally (`next`, or as a `futures::Stream`) or all
/// at once with `collect`. Dropping the stream cancels the run.
pub struct ResultStream {
    receiver: mpsc::Receiver<ProbeResult>,
    _cancel_on_drop: Option<DropGuard>,
}

impl ResultStream {
    pub fn new(receiver: mpsc::Receiver<ProbeResult>, cancel_on_drop: Option<DropGuard>) -> Self {
        Self {
            receiver,
            _cancel_on_drop: cancel_on_drop,
        }
    }

    /// The next result, or `None` once every unit has reported.
    pub async fn next(&mut self) -> Option<ProbeResult> {
        self.receiver.recv().await
    }

    pub async fn collect(mut self) -> Vec<ProbeResult> {
        let mut results = Vec::new();
        while let Some(result) = self.next().await {
            results.push(result);
        }
        results
    }
}

impl Stream for ResultStream {
    type Item = ProbeResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ProbeError;
    use crate::core::models::ProbeUnit;
    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    fn result(port: u16) -> ProbeResult {
        ProbeResult::failed(&ProbeUnit::new("a.test", "a.test", port), None, "GET", ProbeError::Cancelled)
    }

    #[tokio::test]
    async fn test_arrival_order_is_kept() {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for port in [443, 80, 8080] {
                tx.send(result(port)).await.unwrap();
            }
        });
        let ports: Vec<u16> = ResultStream::new(rx, None).collect().await.iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![443, 80, 8080]);
    }

    #[tokio::test]
    async fn test_stream_interface() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(result(1)).await.unwrap();
        tx.send(result(2)).await.unwrap();
        drop(tx);
        let stream = ResultStream::new(rx, None);
        assert_eq!(stream.count().await, 2);
    }

    #[tokio::test]
    async fn test_drop_cancels_run() {
        let token = CancellationToken::new();
        let (_tx, rx) = mpsc::channel(1);
        let stream = ResultStream::new(rx, Some(token.clone().drop_guard()));
        assert!(!token.is_cancelled());
        drop(stream);
        assert!(token.is_cancelled());
    }
}
