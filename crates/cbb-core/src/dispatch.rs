//! Dispatch supervisor: routes each event to one handler and keeps handler
//! failures away from the ingestion loop.

use std::{future::Future, sync::Arc};

use crate::{
    domain::ChatId,
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{CallbackAction, Event, Reply, TextMessage},
    },
    ports::{CallbackHandler, MessageHandler},
    Result,
};

/// Generic text shown to the user when handling fails. Never carries error detail.
pub const APOLOGY_TEXT: &str = "Sorry, something went wrong while handling that. Please try again.";

pub struct Dispatcher {
    messenger: Arc<dyn MessagingPort>,
    messages: Arc<dyn MessageHandler>,
    callbacks: Arc<dyn CallbackHandler>,
}

impl Dispatcher {
    pub fn new(
        messenger: Arc<dyn MessagingPort>,
        messages: Arc<dyn MessageHandler>,
        callbacks: Arc<dyn CallbackHandler>,
    ) -> Self {
        Self {
            messenger,
            messages,
            callbacks,
        }
    }

    /// Handle one event to completion. Never fails and never panics on behalf of
    /// a handler.
    pub async fn dispatch(&self, event: Event) {
        match event {
            Event::Text(msg) => self.dispatch_text(msg).await,
            Event::Callback(action) => self.dispatch_callback(action).await,
        }
    }

    async fn dispatch_text(&self, msg: TextMessage) {
        let chat_id = msg.chat_id;
        tracing::debug!(chat_id = chat_id.0, "dispatching text message");

        let handler = Arc::clone(&self.messages);
        let res = run_isolated(async move { handler.on_message(&msg).await }).await;

        let delivered = match res {
            Ok(outcome) => self.deliver(outcome.replies).await,
            Err(e) => Err(e),
        };
        if let Err(e) = delivered {
            tracing::error!(chat_id = chat_id.0, "message handler failed: {e}");
            self.apologize(chat_id).await;
        }
    }

    async fn dispatch_callback(&self, action: CallbackAction) {
        let ack = AckGuard::acquire(Arc::clone(&self.messenger), action.callback_id.clone());
        let chat_id = action.chat_id();
        tracing::debug!(callback_id = %action.callback_id, "dispatching callback");

        let handler = Arc::clone(&self.callbacks);
        let res = run_isolated(async move { handler.on_callback(&action).await }).await;

        let delivered = match res {
            Ok(outcome) => {
                ack.release(outcome.toast.as_deref()).await;
                self.deliver(outcome.replies).await
            }
            Err(e) => {
                ack.release(None).await;
                Err(e)
            }
        };

        if let Err(e) = delivered {
            tracing::error!("callback handler failed: {e}");
            if let Some(chat_id) = chat_id {
                self.apologize(chat_id).await;
            }
        }
    }

    async fn deliver(&self, replies: Vec<Reply>) -> Result<()> {
        for reply in replies {
            match reply {
                Reply::Send {
                    chat_id,
                    text,
                    keyboard,
                } => {
                    self.messenger
                        .send_text(chat_id, &text, keyboard.as_ref())
                        .await?;
                }
                Reply::Edit {
                    message,
                    text,
                    keyboard,
                } => {
                    self.messenger
                        .edit_text(message, &text, keyboard.as_ref())
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Best-effort: a broken outbound channel must not turn into an ingestion failure.
    async fn apologize(&self, chat_id: ChatId) {
        if let Err(e) = self.messenger.send_text(chat_id, APOLOGY_TEXT, None).await {
            tracing::warn!(chat_id = chat_id.0, "could not send apology: {e}");
        }
    }
}

/// Run a handler on its own task so a panic is reported as an error instead of
/// unwinding through the loop.
async fn run_isolated<T, F>(fut: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(res) => res,
        Err(e) if e.is_panic() => Err(Error::Handler("handler panicked".to_string())),
        Err(e) => Err(Error::Handler(format!("handler task failed: {e}"))),
    }
}

/// Obligation to acknowledge one callback query.
///
/// Release it with [`AckGuard::release`]. If the guard is dropped unreleased
/// (the dispatch future was cancelled or unwound), the acknowledgment is sent
/// from a detached task instead, so it still happens exactly once.
pub struct AckGuard {
    messenger: Option<Arc<dyn MessagingPort>>,
    callback_id: String,
}

impl AckGuard {
    pub fn acquire(messenger: Arc<dyn MessagingPort>, callback_id: String) -> Self {
        Self {
            messenger: Some(messenger),
            callback_id,
        }
    }

    pub async fn release(mut self, text: Option<&str>) {
        let Some(messenger) = self.messenger.take() else {
            return;
        };
        if let Err(e) = messenger.answer_callback(&self.callback_id, text).await {
            tracing::warn!(callback_id = %self.callback_id, "callback acknowledgment failed: {e}");
        }
    }
}

impl Drop for AckGuard {
    fn drop(&mut self) {
        let Some(messenger) = self.messenger.take() else {
            return;
        };
        let callback_id = std::mem::take(&mut self.callback_id);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = messenger.answer_callback(&callback_id, None).await {
                        tracing::warn!(%callback_id, "late callback acknowledgment failed: {e}");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(%callback_id, "callback dropped outside a runtime; not acknowledged");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        callback_event, text_event, Behaviour, FakeMessenger, RecordingHandler, Sent,
    };

    fn dispatcher(
        messenger: Arc<FakeMessenger>,
        handler: Arc<RecordingHandler>,
    ) -> Dispatcher {
        Dispatcher::new(messenger, handler.clone(), handler)
    }

    #[tokio::test]
    async fn text_replies_are_delivered() {
        let messenger = Arc::new(FakeMessenger::default());
        let handler = Arc::new(RecordingHandler::new(Behaviour::Echo));
        let d = dispatcher(messenger.clone(), handler.clone());

        d.dispatch(text_event(555, "hello")).await;

        assert_eq!(handler.seen(), vec!["hello"]);
        assert_eq!(
            messenger.sent_texts(),
            vec![(ChatId(555), "echo: hello".to_string())]
        );
    }

    #[tokio::test]
    async fn failing_text_handler_gets_generic_apology() {
        let messenger = Arc::new(FakeMessenger::default());
        let handler = Arc::new(RecordingHandler::new(Behaviour::Fail));
        let d = dispatcher(messenger.clone(), handler);

        d.dispatch(text_event(1, "hi")).await;

        let sent = messenger.sent_texts();
        assert_eq!(sent, vec![(ChatId(1), APOLOGY_TEXT.to_string())]);
        assert!(!sent[0].1.contains("boom"));
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let messenger = Arc::new(FakeMessenger::default());
        let handler = Arc::new(RecordingHandler::new(Behaviour::Panic));
        let d = dispatcher(messenger.clone(), handler);

        d.dispatch(text_event(3, "x")).await;
        d.dispatch(callback_event(3, "cb-1", "page:main")).await;

        assert_eq!(messenger.answers().len(), 1);
        assert_eq!(
            messenger.sent_texts(),
            vec![
                (ChatId(3), APOLOGY_TEXT.to_string()),
                (ChatId(3), APOLOGY_TEXT.to_string())
            ]
        );
    }

    #[tokio::test]
    async fn throwing_callback_handler_is_acknowledged_exactly_once() {
        let messenger = Arc::new(FakeMessenger::default());
        let handler = Arc::new(RecordingHandler::new(Behaviour::Fail));
        let d = dispatcher(messenger.clone(), handler);

        for i in 0..3 {
            d.dispatch(callback_event(8, &format!("cb-{i}"), "toggle:hints"))
                .await;
        }

        let answers = messenger.answers();
        assert_eq!(
            answers.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["cb-0", "cb-1", "cb-2"]
        );
    }

    #[tokio::test]
    async fn successful_callback_uses_toast() {
        let messenger = Arc::new(FakeMessenger::default());
        let handler = Arc::new(RecordingHandler::new(Behaviour::Echo));
        let d = dispatcher(messenger.clone(), handler.clone());

        d.dispatch(callback_event(8, "cb-9", "page:settings")).await;

        assert_eq!(handler.seen(), vec!["page:settings"]);
        assert_eq!(
            messenger.calls(),
            vec![Sent::Answer {
                callback_id: "cb-9".to_string(),
                text: Some("ok".to_string())
            }]
        );
    }

    #[tokio::test]
    async fn broken_outbound_channel_is_swallowed() {
        let messenger = Arc::new(FakeMessenger::failing());
        let handler = Arc::new(RecordingHandler::new(Behaviour::Fail));
        let d = dispatcher(messenger.clone(), handler);

        d.dispatch(text_event(5, "a")).await;
        d.dispatch(callback_event(5, "cb-x", "reset")).await;

        // Only the (failed) acknowledgment attempt is recorded, exactly once.
        assert_eq!(messenger.answers().len(), 1);
    }

    #[tokio::test]
    async fn dropped_guard_still_acknowledges_once() {
        let messenger = Arc::new(FakeMessenger::default());
        {
            let _guard = AckGuard::acquire(messenger.clone(), "cb-drop".to_string());
        }
        for _ in 0..10 {
            if !messenger.answers().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            messenger.answers(),
            vec![("cb-drop".to_string(), None)]
        );

        let guard = AckGuard::acquire(messenger.clone(), "cb-rel".to_string());
        guard.release(Some("done")).await;
        tokio::task::yield_now().await;
        assert_eq!(messenger.answers().len(), 2);
    }
}
