//! Event distribution: one dispatch primitive, two delivery modes
//!
//! Listeners are either async callbacks or bounded channels backing an
//! [`EventStream`]. Both are awaited during dispatch, so a slow listener
//! suspends the feed task rather than dropping or reordering events; the
//! channel capacity is the listener's whole allowance for lag.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    channel::mpsc,
    future::BoxFuture,
    SinkExt, Stream,
};
use pin_project::pin_project;

use crate::{
    client::BoxError,
    event::{Event, EventKind},
};

/// Per-listener queue depth before dispatch blocks on the consumer.
const EVENT_BUFFER: usize = 16;

/// Boxed async callback listener.
pub(crate) type Handler = Box<dyn FnMut(Event) -> BoxFuture<'static, Result<(), BoxError>> + Send>;

enum Sink {
    Handler(Handler),
    Channel(mpsc::Sender<Event>),
}

/// One listener registration.
pub(crate) struct Registration {
    kind: EventKind,
    once: bool,
    live: bool,
    sink: Sink,
}

/// Create a channel-backed registration and the stream it feeds.
pub(crate) fn channel(kind: EventKind, once: bool) -> (Registration, EventStream) {
    let (sender, receiver) = mpsc::channel(EVENT_BUFFER);
    let registration = Registration {
        kind,
        once,
        live: true,
        sink: Sink::Channel(sender),
    };
    (registration, EventStream { receiver })
}

/// Create a callback registration.
pub(crate) fn callback(kind: EventKind, once: bool, handler: Handler) -> Registration {
    Registration {
        kind,
        once,
        live: true,
        sink: Sink::Handler(handler),
    }
}

/// Owns the listener registrations of one watch.
#[derive(Default)]
pub(crate) struct Dispatcher {
    registrations: Vec<Registration>,
}

impl Dispatcher {
    /// Take over registrations created while the feed task was busy.
    pub(crate) fn adopt(&mut self, registrations: impl IntoIterator<Item = Registration>) {
        self.registrations.extend(registrations);
    }

    /// Deliver `event` to every live listener registered for `kind`.
    ///
    /// Callbacks and channel sends are awaited in registration order.
    /// Callback errors are collected and returned so every listener still
    /// sees the event; disconnected channels and spent `once` registrations
    /// are pruned.
    pub(crate) async fn dispatch(&mut self, kind: EventKind, event: &Event) -> Vec<BoxError> {
        let mut errors = Vec::new();
        for registration in &mut self.registrations {
            if registration.kind != kind || !registration.live {
                continue;
            }
            match &mut registration.sink {
                Sink::Handler(handler) => {
                    if let Err(error) = handler(event.clone()).await {
                        errors.push(error);
                    }
                    if registration.once {
                        registration.live = false;
                    }
                }
                Sink::Channel(sender) => {
                    if sender.send(event.clone()).await.is_err() {
                        // receiver was dropped
                        registration.live = false;
                    } else if registration.once {
                        registration.live = false;
                    }
                }
            }
        }
        self.registrations.retain(|registration| registration.live);
        errors
    }
}

/// Async sequence of [`Event`]s for one registration.
///
/// Ends when the watch stops; dropping it cancels the registration without
/// affecting the watch.
#[pin_project]
#[must_use = "streams do nothing unless polled"]
pub struct EventStream {
    #[pin]
    receiver: mpsc::Receiver<Event>,
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().receiver.poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use futures::{pin_mut, poll, FutureExt, StreamExt};
    use jsonptr::PointerBuf;

    use super::*;
    use crate::event::ItemRemoved;

    fn removed(pointer: &str, list_rev: u64) -> Event {
        Event::Removed(ItemRemoved {
            list_rev,
            pointer: PointerBuf::parse(pointer).expect("valid pointer"),
        })
    }

    #[tokio::test]
    async fn dispatches_only_matching_kind() {
        let mut dispatcher = Dispatcher::default();
        let (registration, stream) = channel(EventKind::Removed, false);
        dispatcher.adopt([registration]);
        let (other, other_stream) = channel(EventKind::Added, false);
        dispatcher.adopt([other]);

        assert!(dispatcher
            .dispatch(EventKind::Removed, &removed("/K", 4))
            .await
            .is_empty());

        pin_mut!(stream, other_stream);
        let event = stream.next().await.expect("delivered");
        assert_eq!(event.pointer().map(ToString::to_string).as_deref(), Some("/K"));
        assert!(poll!(other_stream.next()).is_pending());
    }

    #[tokio::test]
    async fn callback_errors_do_not_stop_later_listeners() {
        let mut dispatcher = Dispatcher::default();
        let seen = Arc::new(AtomicUsize::new(0));

        dispatcher.adopt([callback(
            EventKind::Removed,
            false,
            Box::new(|_event| async { Err::<(), BoxError>("listener broke".into()) }.boxed()),
        )]);
        let seen2 = seen.clone();
        dispatcher.adopt([callback(
            EventKind::Removed,
            false,
            Box::new(move |_event| {
                let seen = seen2.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
        )]);

        let errors = dispatcher
            .dispatch(EventKind::Removed, &removed("/K", 4))
            .await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "listener broke");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn once_registrations_deliver_exactly_one_event() {
        let mut dispatcher = Dispatcher::default();
        let (registration, stream) = channel(EventKind::Removed, true);
        dispatcher.adopt([registration]);

        dispatcher.dispatch(EventKind::Removed, &removed("/a", 1)).await;
        dispatcher.dispatch(EventKind::Removed, &removed("/b", 2)).await;

        let delivered: Vec<_> = stream.collect().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            delivered[0].pointer().map(ToString::to_string).as_deref(),
            Some("/a")
        );
    }

    #[tokio::test]
    async fn dropped_streams_are_pruned() {
        let mut dispatcher = Dispatcher::default();
        let (registration, stream) = channel(EventKind::Removed, false);
        dispatcher.adopt([registration]);
        drop(stream);

        dispatcher.dispatch(EventKind::Removed, &removed("/K", 4)).await;
        assert!(dispatcher.registrations.is_empty());
    }
}
