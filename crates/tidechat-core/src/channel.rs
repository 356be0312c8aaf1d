//! Engine → observer event vocabulary
//!
//! All state changes the UI (and the notification dispatcher) need to know
//! about flow through one broadcast channel of `AppEvent`s. Observers key
//! message rows on `correlation_id`: an upsert for a known id is an in-place
//! update, so a confirmed message never visibly jumps.

use serde::{Deserialize, Serialize};

use crate::config::ChannelConfig;
use crate::message::{Conversation, Message, MessageStatus};
use crate::types::{ConversationId, CorrelationId, UserId};

// ----------------------------------------------------------------------------
// App Events
// ----------------------------------------------------------------------------

/// State-change events published to UI observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppEvent {
    /// A message was written or updated in place (same correlation id)
    MessageUpserted { message: Message },
    /// A message's sender-visible status advanced
    MessageStatusChanged {
        conversation_id: ConversationId,
        correlation_id: CorrelationId,
        status: MessageStatus,
    },
    /// A conversation record (participants or snapshot) changed
    ConversationUpdated { conversation: Conversation },
    /// A remote message landed in a conversation; `focused` tells the
    /// notification dispatcher whether to present it
    IncomingMessage {
        conversation_id: ConversationId,
        correlation_id: CorrelationId,
        sender_id: UserId,
        focused: bool,
    },
    /// The set of users typing in a conversation changed
    TypingChanged {
        conversation_id: ConversationId,
        typists: Vec<UserId>,
    },
    /// A send failed; `terminal` distinguishes "will not retry automatically"
    /// (manual retry affordance) from a transient failure awaiting redrive
    SendFailed {
        conversation_id: ConversationId,
        correlation_id: CorrelationId,
        terminal: bool,
        reason: String,
    },
}

// ----------------------------------------------------------------------------
// Channel Aliases
// ----------------------------------------------------------------------------

pub type AppEventSender = tokio::sync::broadcast::Sender<AppEvent>;
pub type AppEventReceiver = tokio::sync::broadcast::Receiver<AppEvent>;

/// Create the app-event broadcast channel (engine → observers)
pub fn create_app_event_channel(config: &ChannelConfig) -> (AppEventSender, AppEventReceiver) {
    tokio::sync::broadcast::channel(config.app_event_buffer_size)
}

/// Publish an event, ignoring the no-observers case
///
/// A broadcast send only errors when every receiver is gone, which is
/// normal while the engine runs headless (e.g. background sync).
pub fn publish(sender: &AppEventSender, event: AppEvent) {
    let _ = sender.send(event);
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_all_observers() {
        let (sender, mut first) = create_app_event_channel(&ChannelConfig::default());
        let mut second = sender.subscribe();

        let event = AppEvent::TypingChanged {
            conversation_id: ConversationId::new("conv-1"),
            typists: vec![UserId::new("bob")],
        };
        publish(&sender, event.clone());

        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_observers_is_harmless() {
        let (sender, receiver) = create_app_event_channel(&ChannelConfig::default());
        drop(receiver);
        publish(
            &sender,
            AppEvent::TypingChanged {
                conversation_id: ConversationId::new("conv-1"),
                typists: Vec::new(),
            },
        );
    }
}
