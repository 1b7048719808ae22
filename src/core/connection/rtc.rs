//! webrtc-rs backend: API construction and the data channel adapter.

use super::channel::{Channel, ChannelError, ChannelFrame, ChannelTransport};
use crate::core::config::{SCTP_MAX_MESSAGE_SIZE, SessionConfig};
use crate::utils::sos::SignalOfStop;
use futures::future::BoxFuture;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::{SctpMaxMessageSize, SettingEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;

pub(crate) fn create_api(config: &SessionConfig) -> Result<API, webrtc::Error> {
    let mut me = MediaEngine::default();
    let registry = register_default_interceptors(Registry::new(), &mut me)?;

    let mut se = SettingEngine::default();
    se.set_sctp_max_message_size_can_send(SctpMaxMessageSize::Bounded(SCTP_MAX_MESSAGE_SIZE));
    se.set_include_loopback_candidate(config.include_loopback);

    Ok(APIBuilder::new()
        .with_setting_engine(se)
        .with_media_engine(me)
        .with_interceptor_registry(registry)
        .build())
}

pub(crate) fn rtc_configuration(config: &SessionConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                username: String::new(),
                credential: String::new(),
            })
            .collect(),
        ..Default::default()
    }
}

struct RtcTransport {
    dc: Arc<RTCDataChannel>,
}

impl ChannelTransport for RtcTransport {
    fn send(&self, frame: ChannelFrame) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            let sent = match frame {
                ChannelFrame::Text(text) => self.dc.send_text(text).await,
                ChannelFrame::Binary(data) => self.dc.send(&data).await,
            };
            sent.map(|_| ())
                .map_err(|e| ChannelError::Transport(e.to_string()))
        })
    }

    fn buffered_amount(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move { self.dc.buffered_amount().await })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            self.dc
                .close()
                .await
                .map_err(|e| ChannelError::Transport(e.to_string()))
        })
    }
}

/// Wrap a webrtc data channel. Callbacks hold only weak references and
/// go quiet once `sos` is cancelled.
pub(crate) async fn wrap_data_channel(
    dc: Arc<RTCDataChannel>,
    low_threshold: usize,
    sos: &SignalOfStop,
) -> Channel {
    let channel = Channel::new(
        dc.label(),
        dc.protocol(),
        low_threshold,
        RtcTransport { dc: dc.clone() },
    );

    let (weak, stop) = (channel.downgrade(), sos.clone());
    dc.on_open(Box::new(move || {
        let (weak, stop) = (weak.clone(), stop.clone());
        Box::pin(async move {
            if let (false, Some(ch)) = (stop.cancelled(), weak.upgrade()) {
                ch.mark_open();
            }
        })
    }));

    let (weak, stop) = (channel.downgrade(), sos.clone());
    dc.on_close(Box::new(move || {
        let (weak, stop) = (weak.clone(), stop.clone());
        Box::pin(async move {
            if let (false, Some(ch)) = (stop.cancelled(), weak.upgrade()) {
                ch.mark_closed();
            }
        })
    }));

    let (weak, stop) = (channel.downgrade(), sos.clone());
    dc.on_error(Box::new(move |err| {
        let (weak, stop) = (weak.clone(), stop.clone());
        Box::pin(async move {
            if let (false, Some(ch)) = (stop.cancelled(), weak.upgrade()) {
                ch.report_error(err.to_string());
            }
        })
    }));

    let (weak, stop) = (channel.downgrade(), sos.clone());
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let (weak, stop) = (weak.clone(), stop.clone());
        Box::pin(async move {
            if stop.cancelled() {
                return;
            }
            let Some(ch) = weak.upgrade() else { return };
            let frame = if msg.is_string {
                ChannelFrame::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelFrame::Binary(msg.data)
            };
            ch.deliver(frame);
        })
    }));

    dc.set_buffered_amount_low_threshold(low_threshold).await;
    let weak = channel.downgrade();
    dc.on_buffered_amount_low(Box::new(move || {
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(ch) = weak.upgrade() {
                ch.signal_low();
            }
        })
    }))
    .await;

    match dc.ready_state() {
        RTCDataChannelState::Open => channel.mark_open(),
        RTCDataChannelState::Closed => channel.mark_closed(),
        _ => {}
    }
    channel
}
