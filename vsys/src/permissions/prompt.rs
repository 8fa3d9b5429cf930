//! Host-side answers to interactive permission requests.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::capability::CapabilityRequest;

/// How the host answered a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAnswer {
    /// Allow this exact resource from now on
    Grant,
    /// Allow every resource of this capability kind from now on
    GrantAll,
    /// Deny this exact resource from now on
    Deny,
}

/// Pluggable decision maker for `PromptRequired` requests.
///
/// The future may stay pending for as long as the host needs (a human
/// answering a terminal prompt, a policy service). Dropping it cancels the
/// question.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    async fn prompt(&self, request: &CapabilityRequest) -> PromptAnswer;
}

/// A question waiting for the host
#[derive(Debug)]
pub struct PendingPrompt {
    pub request: CapabilityRequest,
    responder: oneshot::Sender<PromptAnswer>,
}

impl PendingPrompt {
    pub fn answer(self, answer: PromptAnswer) {
        // The asking context may have been torn down already
        let _ = self.responder.send(answer);
    }
}

/// Forwards every prompt to the host through a channel.
///
/// A prompt whose [`PendingPrompt`] is dropped unanswered counts as
/// [`PromptAnswer::Deny`].
pub struct ChannelPrompt {
    sender: mpsc::UnboundedSender<PendingPrompt>,
}

impl ChannelPrompt {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PendingPrompt>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl PromptHandler for ChannelPrompt {
    async fn prompt(&self, request: &CapabilityRequest) -> PromptAnswer {
        let (responder, answer) = oneshot::channel();
        let pending = PendingPrompt {
            request: request.clone(),
            responder,
        };
        if self.sender.send(pending).is_err() {
            tracing::warn!(%request, "prompt receiver closed, denying");
            return PromptAnswer::Deny;
        }
        answer.await.unwrap_or(PromptAnswer::Deny)
    }
}

/// Answers prompts with a synchronous closure
pub struct FnPrompt<F>(pub F);

#[async_trait]
impl<F> PromptHandler for FnPrompt<F>
where
    F: Fn(&CapabilityRequest) -> PromptAnswer + Send + Sync,
{
    async fn prompt(&self, request: &CapabilityRequest) -> PromptAnswer {
        (self.0)(request)
    }
}
