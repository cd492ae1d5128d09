//! Single-Relay Sessions
//!
//! Each operation (query, publish, subscribe) runs over its own short-lived
//! websocket session so a wedged subscription can never poison a fan-out
//! query. Timeouts are contracts: connect 3 s, query 3 s, publish 5 s.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, StreamError};
use crate::event::Event;
use crate::relay::filter::Filter;
use crate::relay::protocol::{ClientMessage, RelayMessage};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(3);
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One relay endpoint.
#[derive(Debug, Clone)]
pub struct Relay {
    pub url: String,
}

impl Relay {
    /// Dial the relay once to validate the endpoint.
    pub async fn dial(url: &str) -> Result<Self> {
        let relay = Self {
            url: url.to_string(),
        };
        let mut ws = relay.connect().await?;
        let _ = ws.close(None).await;
        Ok(relay)
    }

    async fn connect(&self) -> Result<WsStream> {
        let connected = timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| StreamError::RelayDialFailed {
                url: self.url.clone(),
                reason: format!("connect timed out after {:?}", CONNECT_TIMEOUT),
            })?
            .map_err(|e| StreamError::RelayDialFailed {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        Ok(connected.0)
    }

    fn subscription_id() -> String {
        format!("es{:08x}", rand::random::<u32>())
    }

    /// Query the relay, collecting events until EOSE or the query deadline.
    pub async fn query(&self, filter: &Filter) -> Result<Vec<Event>> {
        let mut ws = self.connect().await?;
        let subscription_id = Self::subscription_id();
        let req = ClientMessage::Req {
            subscription_id: subscription_id.clone(),
            filter: filter.clone(),
        };
        ws.send(Message::Text(req.to_json()?.into())).await.map_err(|e| {
            StreamError::RelayDialFailed {
                url: self.url.clone(),
                reason: e.to_string(),
            }
        })?;

        let deadline = Instant::now() + QUERY_TIMEOUT;
        let mut events = Vec::new();
        loop {
            let frame = match timeout_at(deadline, ws.next()).await {
                Ok(Some(Ok(frame))) => frame,
                // Deadline or closed stream: return what arrived.
                Ok(Some(Err(_))) | Ok(None) | Err(_) => break,
            };
            let Message::Text(text) = frame else { continue };
            match RelayMessage::from_json(&text) {
                Ok(RelayMessage::Event {
                    subscription_id: sid,
                    event,
                }) if sid == subscription_id => events.push(event),
                Ok(RelayMessage::Eose {
                    subscription_id: sid,
                }) if sid == subscription_id => break,
                Ok(RelayMessage::Notice { message }) => {
                    debug!("{} sent a notice: {}", self.url, message);
                }
                Ok(_) => {}
                Err(e) => debug!("{} sent an unparsable frame: {}", self.url, e),
            }
        }

        let close = ClientMessage::Close { subscription_id };
        let _ = ws.send(Message::Text(close.to_json()?.into())).await;
        let _ = ws.close(None).await;
        debug!("{} returned {} events", self.url, events.len());
        Ok(events)
    }

    /// Publish one event, waiting for the relay's OK within the publish
    /// deadline.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        let mut ws = self.connect().await?;
        let frame = ClientMessage::Event(event.clone());
        ws.send(Message::Text(frame.to_json()?.into())).await.map_err(|e| {
            StreamError::PublishFailed(format!("{}: {}", self.url, e))
        })?;

        let deadline = Instant::now() + PUBLISH_TIMEOUT;
        loop {
            let frame = match timeout_at(deadline, ws.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    return Err(StreamError::PublishFailed(format!("{}: {}", self.url, e)))
                }
                Ok(None) => {
                    return Err(StreamError::PublishFailed(format!(
                        "{} closed before acknowledging {}",
                        self.url, event.id
                    )))
                }
                Err(_) => {
                    return Err(StreamError::PublishFailed(format!(
                        "{} did not acknowledge {} within {:?}",
                        self.url, event.id, PUBLISH_TIMEOUT
                    )))
                }
            };
            let Message::Text(text) = frame else { continue };
            if let Ok(RelayMessage::Ok {
                event_id,
                accepted,
                message,
            }) = RelayMessage::from_json(&text)
            {
                if event_id != event.id {
                    continue;
                }
                let _ = ws.close(None).await;
                return if accepted {
                    Ok(())
                } else {
                    Err(StreamError::PublishFailed(format!(
                        "{} rejected {}: {}",
                        self.url, event.id, message
                    )))
                };
            }
        }
    }

    /// Long-lived subscription: forward matching events into `sink` until
    /// the cancellation token fires or the relay drops the connection.
    pub async fn subscribe(
        &self,
        filter: &Filter,
        sink: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut ws = self.connect().await?;
        let subscription_id = Self::subscription_id();
        let req = ClientMessage::Req {
            subscription_id: subscription_id.clone(),
            filter: filter.clone(),
        };
        ws.send(Message::Text(req.to_json()?.into())).await.map_err(|e| {
            StreamError::RelayDialFailed {
                url: self.url.clone(),
                reason: e.to_string(),
            }
        })?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let close = ClientMessage::Close {
                        subscription_id: subscription_id.clone(),
                    };
                    let _ = ws.send(Message::Text(close.to_json()?.into())).await;
                    let _ = ws.close(None).await;
                    debug!("unsubscribed from {}", self.url);
                    return Ok(());
                }
                frame = ws.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            warn!("subscription to {} failed: {}", self.url, e);
                            return Ok(());
                        }
                        None => {
                            warn!("{} closed the subscription", self.url);
                            return Ok(());
                        }
                    };
                    let Message::Text(text) = frame else { continue };
                    match RelayMessage::from_json(&text) {
                        Ok(RelayMessage::Event { subscription_id: sid, event })
                            if sid == subscription_id =>
                        {
                            if sink.send(event).await.is_err() {
                                // Receiver gone, the loop is over.
                                return Ok(());
                            }
                        }
                        Ok(RelayMessage::Notice { message }) => {
                            debug!("{} sent a notice: {}", self.url, message);
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
