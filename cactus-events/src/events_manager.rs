use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::Stream;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T> {
    pub name: String,
    pub data: T,
    pub timestamp: DateTime<Utc>,
}

/// Fans every published event out to one unbounded queue per listener.
///
/// A slow listener only grows its own queue, so it never loses events and
/// never holds back the publisher or other listeners.
struct EventManager {
    listeners: Mutex<Vec<mpsc::UnboundedSender<Event<Value>>>>,
}

impl EventManager {
    fn subscribe(&self) -> UnboundedReceiverStream<Event<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        UnboundedReceiverStream::new(rx)
    }

    /// Returns how many listeners received the event.
    fn publish(&self, event: Event<Value>) -> usize {
        let mut listeners = self.listeners.lock();
        // a failed send means the subscription was dropped
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
        listeners.len()
    }
}

static EVENT_MANAGER: Lazy<EventManager> = Lazy::new(|| EventManager {
    listeners: Mutex::new(Vec::new()),
});

/// Publish `data` under `name` to every current listener.
///
/// Publishing with nobody listening is not an error; the event is dropped.
pub fn send_event<T: Serialize>(name: &str, data: T) -> Result<()> {
    let data = serde_json::to_value(data)?;
    let event = Event {
        name: name.to_string(),
        data,
        timestamp: Utc::now(),
    };

    if EVENT_MANAGER.publish(event) == 0 {
        debug!(event = name, "no listeners, event dropped");
    }
    Ok(())
}

/// Subscribe to events published under `name`, decoded as `T`.
///
/// Events whose payload does not decode as `T` are skipped.
pub fn subscribe_to_event<T: DeserializeOwned>(name: &str) -> EventSubscription<T> {
    EventSubscription {
        name: Some(name.to_string()),
        inner: EVENT_MANAGER.subscribe(),
        _marker: PhantomData,
    }
}

pub fn subscribe_to_all_events() -> EventSubscription<Value> {
    EventSubscription {
        name: None,
        inner: EVENT_MANAGER.subscribe(),
        _marker: PhantomData,
    }
}

pub fn listener_count() -> usize {
    EVENT_MANAGER
        .listeners
        .lock()
        .iter()
        .filter(|tx| !tx.is_closed())
        .count()
}

pub struct EventSubscription<T> {
    name: Option<String>,
    inner: UnboundedReceiverStream<Event<Value>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Stream for EventSubscription<T> {
    type Item = Event<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(event)) => {
                    if let Some(name) = &this.name {
                        if &event.name != name {
                            continue;
                        }
                    }

                    match serde_json::from_value::<T>(event.data) {
                        Ok(data) => {
                            return Poll::Ready(Some(Event {
                                name: event.name,
                                data,
                                timestamp: event.timestamp,
                            }))
                        }
                        Err(err) => {
                            warn!(event = %event.name, error = %err, "dropping undecodable event");
                            continue;
                        }
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
