//! Asynchronous SDP rewriting hooks
//!
//! A user agent hands every SDP body it receives from the network to
//! [`SdpChangeHook::on_remote_sdp_change`] before reporting it to its
//! controller, and every body the controller wants sent to
//! [`SdpChangeHook::on_local_sdp_change`] before putting it on the wire. Both
//! run as tokio tasks; the UA counts them as pending SDP answers and picks the
//! call flow back up when they complete.

use async_trait::async_trait;
use b2bua_sip_core::MsgBody;

use crate::errors::DialogResult;

#[async_trait]
pub trait SdpChangeHook: Send + Sync {
    /// Body received from the peer, on its way to the controller
    async fn on_remote_sdp_change(&self, body: MsgBody) -> DialogResult<MsgBody> {
        Ok(body)
    }

    /// Body from the controller, on its way to the peer
    async fn on_local_sdp_change(&self, body: MsgBody) -> DialogResult<MsgBody> {
        Ok(body)
    }
}

/// Which way a body is travelling through a UA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpDirection {
    Local,
    Remote,
}

/// Run the hook for `direction`
pub async fn apply_hook(
    hook: &dyn SdpChangeHook,
    direction: SdpDirection,
    body: MsgBody,
) -> DialogResult<MsgBody> {
    let mut body = match direction {
        SdpDirection::Local => hook.on_local_sdp_change(body).await?,
        SdpDirection::Remote => hook.on_remote_sdp_change(body).await?,
    };
    body.set_needs_update(false);
    Ok(body)
}
