use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::{
    error::Result,
    peer::Peer,
    schema::{JSONRPCRequest, NOTIFY_PROGRESS, ProgressParams, ProgressToken, RequestId},
};

/// Per-request state handed to handlers.
///
/// The context is valid for the duration of a single request. Its
/// cancellation token fires when the caller sends `notifications/cancelled`
/// or the connection closes.
#[derive(Clone)]
pub struct RequestContext {
    request_id: RequestId,
    cancel: CancellationToken,
    progress_token: Option<ProgressToken>,
    auth_token: Option<String>,
    peer: Peer,
}

impl RequestContext {
    pub(crate) fn new(request: &JSONRPCRequest, cancel: CancellationToken, peer: Peer) -> Self {
        Self {
            request_id: request.id.clone(),
            cancel,
            progress_token: request.meta().and_then(|m| m.progress_token),
            auth_token: None,
            peer,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The `_meta.progressToken` supplied by the caller, if any.
    pub fn progress_token(&self) -> Option<&ProgressToken> {
        self.progress_token.as_ref()
    }

    /// The bearer token the authorizer accepted for this call.
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub(crate) fn set_auth_token(&mut self, token: Option<String>) {
        self.auth_token = token;
    }

    /// The connection the request arrived on.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Report progress. A no-op unless the caller asked for progress.
    pub async fn progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<()> {
        let Some(token) = self.progress_token.clone() else {
            return Ok(());
        };
        let params = ProgressParams {
            progress_token: token,
            progress,
            total,
            message,
        };
        self.peer
            .notify(NOTIFY_PROGRESS, Some(serde_json::to_value(params)?))
            .await
    }
}
