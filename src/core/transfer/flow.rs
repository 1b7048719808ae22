//! Channel selection and backpressure.
//!
//! A channel is available when it is open and its buffered amount is at or
//! below its low-water threshold. Nothing is ever written to a channel above
//! that threshold: callers obtain a channel through [`acquire_channel`] right
//! before each send.

use super::TransferError;
use crate::core::connection::Channel;
use crate::utils::sos::SignalOfStop;
use futures::future::select_all;
use std::pin::Pin;
use std::time::Duration;
use tracing::trace;

/// Least-buffered available channel, waiting for a low-buffer signal when
/// none is available. `poll` bounds each wait in case a signal is missed.
pub async fn acquire_channel(
    channels: &[Channel],
    poll: Duration,
    sos: &SignalOfStop,
) -> Result<Channel, TransferError> {
    loop {
        if sos.cancelled() {
            return Err(TransferError::Cancelled);
        }
        let open: Vec<&Channel> = channels.iter().filter(|c| c.is_open()).collect();
        if open.is_empty() {
            return Err(TransferError::NoChannels);
        }

        // Register before measuring so a signal in between is not lost.
        let mut signals: Vec<Pin<Box<_>>> = open.iter().map(|c| Box::pin(c.low_notified())).collect();
        for signal in signals.iter_mut() {
            signal.as_mut().enable();
        }

        let mut best: Option<(usize, &Channel)> = None;
        for channel in &open {
            let buffered = channel.buffered_amount().await;
            if buffered <= channel.low_threshold() && best.is_none_or(|(b, _)| buffered < b) {
                best = Some((buffered, *channel));
            }
        }
        if let Some((_, channel)) = best {
            return Ok(channel.clone());
        }

        trace!(event = "backpressure_wait", channels = open.len());
        tokio::select! {
            _ = select_all(signals) => {}
            _ = tokio::time::sleep(poll) => {}
            _ = sos.wait() => return Err(TransferError::Cancelled),
        }
    }
}

/// Wait until every open channel has flushed its send buffer.
pub async fn wait_drained(
    channels: &[Channel],
    poll: Duration,
    sos: &SignalOfStop,
) -> Result<(), TransferError> {
    loop {
        let mut pending = 0usize;
        for channel in channels.iter().filter(|c| c.is_open()) {
            pending += channel.buffered_amount().await;
        }
        if pending == 0 {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = sos.wait() => return Err(TransferError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::memory::memory_pair;
    use bytes::Bytes;

    const POLL: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn suspends_until_buffer_drains() {
        let (a, _b, link, _) = memory_pair("t-0", "transfer", 100);
        let sos = SignalOfStop::new();
        link.pause();
        a.send_binary(Bytes::from(vec![0u8; 150])).await.unwrap();
        assert_eq!(a.buffered_amount().await, 150);

        let channels = vec![a.clone()];
        let waiter = {
            let sos = sos.clone();
            tokio::spawn(async move { acquire_channel(&channels, POLL, &sos).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        link.resume();
        let got = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(got.same(&a));
        assert!(a.buffered_amount().await <= a.low_threshold());
    }

    #[tokio::test]
    async fn prefers_least_buffered_channel() {
        let (a, _, link_a, _) = memory_pair("t-0", "transfer", 100);
        let (c, _, link_c, _) = memory_pair("t-1", "transfer", 100);
        link_a.pause();
        link_c.pause();
        a.send_binary(Bytes::from(vec![0u8; 60])).await.unwrap();
        c.send_binary(Bytes::from(vec![0u8; 20])).await.unwrap();

        let sos = SignalOfStop::new();
        let got = acquire_channel(&[a, c.clone()], POLL, &sos).await.unwrap();
        assert!(got.same(&c));
    }

    #[tokio::test]
    async fn fails_without_open_channels_or_after_cancel() {
        let (a, _, link, _) = memory_pair("t-0", "transfer", 10);
        let sos = SignalOfStop::new();
        link.pause();
        a.send_binary(Bytes::from(vec![0u8; 50])).await.unwrap();

        let channels = vec![a.clone()];
        let waiter = {
            let sos = sos.clone();
            tokio::spawn(async move { acquire_channel(&channels, POLL, &sos).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        sos.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(TransferError::Cancelled)));

        a.close().await.unwrap();
        let sos = SignalOfStop::new();
        assert!(matches!(
            acquire_channel(&[a], POLL, &sos).await,
            Err(TransferError::NoChannels)
        ));
    }
}
