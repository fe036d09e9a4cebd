use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use haulage_events::{ChangeEvent, FeedFilter, OperationKind};
use haulage_fleet::message::fields;
use haulage_fleet::{Message, MessageChannel, MessageState};

use crate::collaborators::MessageSender;
use crate::queue::TaskHandler;
use crate::store::{Filter, Patch, SharedStore};

use super::HandlerError;

/// Delivers `Ready` messages of one channel.
///
/// State flow: `Ready -> Processing -> Sent | Error`. The `Ready -> Processing`
/// transition is the claim; a message stuck in `Processing` is put back to
/// `Ready` by the orphan sweeper, which is why a message can be sent twice.
pub struct MessageDispatchHandler {
    messages: SharedStore<Message>,
    channel: MessageChannel,
    sender: Arc<dyn MessageSender>,
}

impl MessageDispatchHandler {
    pub fn new(
        messages: SharedStore<Message>,
        channel: MessageChannel,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            messages,
            channel,
            sender,
        }
    }

    pub fn channel(&self) -> MessageChannel {
        self.channel
    }

    /// Inserts and updates leaving a message of `channel` in `Ready`: state
    /// changes, plus the sweeper's re-emission of stale `Ready` messages.
    pub fn feed_filter(channel: MessageChannel) -> FeedFilter<Message> {
        FeedFilter::all()
            .operations([OperationKind::Insert, OperationKind::Update])
            .fields([fields::STATE, fields::STATE_CHANGED_AT])
            .with_predicate(move |event: &ChangeEvent<Message>| {
                event
                    .after()
                    .is_some_and(|m| m.state == MessageState::Ready && m.channel() == channel)
            })
    }

    /// Returns the message's final state, or `None` when there was nothing to do.
    pub async fn dispatch(&self, event: &ChangeEvent<Message>) -> Result<Option<MessageState>, HandlerError> {
        let id = event.document_id();
        let Some(current) = self.messages.get(id).await? else {
            return Ok(None);
        };
        if current.state != MessageState::Ready {
            debug!(message_id = %id, state = ?current.state, "message no longer ready");
            return Ok(None);
        }
        if current.channel() != self.channel {
            return Err(HandlerError::Logic(format!(
                "message {id} belongs to channel {}, not {}",
                current.channel().as_str(),
                self.channel.as_str()
            )));
        }

        let claimed = self
            .messages
            .update_where(
                id,
                &[
                    Filter::eq(fields::STATE, MessageState::Ready),
                    Filter::eq(fields::ATTEMPTS, current.attempts),
                ],
                Patch::new()
                    .set(fields::STATE, MessageState::Processing)
                    .set(fields::STATE_CHANGED_AT, Utc::now())
                    .set(fields::ATTEMPTS, current.attempts + 1),
            )
            .await?;
        let Some(message) = claimed else {
            debug!(message_id = %id, "message claimed by another worker");
            return Ok(None);
        };

        if message.attempts > 1 {
            warn!(
                message_id = %id,
                channel = self.channel.as_str(),
                attempts = message.attempts,
                "re-sending message after an earlier attempt"
            );
        }

        match self.sender.send(&message).await {
            Ok(()) => {
                self.finish(&message, MessageState::Sent, None).await?;
                info!(message_id = %id, channel = self.channel.as_str(), "message sent");
                Ok(Some(MessageState::Sent))
            }
            Err(e) => {
                self.finish(&message, MessageState::Error, Some(e.to_string())).await?;
                Err(e.into())
            }
        }
    }

    /// Record the outcome, only if this attempt still owns the claim.
    async fn finish(
        &self,
        message: &Message,
        state: MessageState,
        last_error: Option<String>,
    ) -> Result<(), HandlerError> {
        let done = self
            .messages
            .update_where(
                message.id,
                &[
                    Filter::eq(fields::STATE, MessageState::Processing),
                    Filter::eq(fields::ATTEMPTS, message.attempts),
                ],
                Patch::new()
                    .set(fields::STATE, state)
                    .set(fields::STATE_CHANGED_AT, Utc::now())
                    .set(fields::LAST_ERROR, last_error),
            )
            .await?;
        if done.is_none() {
            // Swept while the send was in flight; a later attempt owns the outcome.
            warn!(
                message_id = %message.id,
                attempt = message.attempts,
                state = ?state,
                "attempt superseded before completion"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler<ChangeEvent<Message>> for MessageDispatchHandler {
    async fn handle(&self, event: ChangeEvent<Message>) -> Result<(), HandlerError> {
        self.dispatch(&event).await.map(|_| ())
    }

    fn describe(&self, event: &ChangeEvent<Message>) -> String {
        event.describe()
    }
}
