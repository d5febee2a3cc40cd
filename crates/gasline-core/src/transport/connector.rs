//! Opening the push channel.
//!
//! A `Connector` produces a `Link`: a pair of frame channels standing in for
//! one live connection. The link is dead once `incoming` yields `None`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use super::{Frame, TransportError};

/// Frames buffered per direction on one connection.
const FRAME_BUFFER: usize = 64;

/// One live connection as seen by the transport.
#[derive(Debug)]
pub struct Link {
    pub outgoing: mpsc::Sender<Frame>,
    pub incoming: mpsc::Receiver<Frame>,
}

/// The far side of a [`Link`]: whatever pumps frames to and from the wire.
#[derive(Debug)]
pub struct RemoteEnd {
    pub from_client: mpsc::Receiver<Frame>,
    pub to_client: mpsc::Sender<Frame>,
}

impl Link {
    pub fn pair(buffer: usize) -> (Link, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (in_tx, in_rx) = mpsc::channel(buffer);
        (
            Link {
                outgoing: out_tx,
                incoming: in_rx,
            },
            RemoteEnd {
                from_client: out_rx,
                to_client: in_tx,
            },
        )
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Link, TransportError>;
}

/// WebSocket connector for the production push server.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    /// `push_url` is a `ws://` or `wss://` endpoint. The session token, if
    /// any, is passed as a `token` query parameter.
    pub fn new(push_url: &str, token: Option<&str>) -> Result<Self, TransportError> {
        let mut url = Url::parse(push_url)?;
        if let Some(token) = token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let (socket, _response) = connect_async(self.url.as_str()).await?;
        debug!(host = ?self.url.host_str(), "WebSocket connected");

        let (mut sink, mut stream) = socket.split();
        let (link, remote) = Link::pair(FRAME_BUFFER);
        let RemoteEnd {
            mut from_client,
            to_client,
        } = remote;

        // Writer: ends when the transport drops its side of the link.
        tokio::spawn(async move {
            while let Some(frame) = from_client.recv().await {
                let text = match frame.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(event = %frame.event, error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(error = %e, "WebSocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: ends on close, error, or when the transport stops listening.
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => Frame::parse(&text),
                    Ok(Message::Binary(bytes)) => serde_json::from_slice(&bytes),
                    Ok(Message::Close(close)) => {
                        debug!(?close, "WebSocket closed by server");
                        break;
                    }
                    // Pings are answered by tungstenite itself
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "WebSocket read failed");
                        break;
                    }
                };
                match frame {
                    Ok(frame) => {
                        if to_client.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping unparseable frame"),
                }
            }
        });

        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_appended_as_query() {
        let connector =
            WsConnector::new("wss://push.example.com/socket", Some("abc 123")).expect("connector");
        assert_eq!(
            connector.url().as_str(),
            "wss://push.example.com/socket?token=abc+123"
        );
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(matches!(
            WsConnector::new("not a url", None),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_link_pair_carries_frames_both_ways() {
        let (mut link, mut remote) = Link::pair(4);

        link.outgoing.send(Frame::join("a1")).await.expect("send");
        assert_eq!(remote.from_client.recv().await, Some(Frame::join("a1")));

        remote
            .to_client
            .send(Frame::new("ping", serde_json::Value::Null))
            .await
            .expect("send");
        assert_eq!(link.incoming.recv().await.map(|f| f.event), Some("ping".to_string()));

        drop(remote);
        assert_eq!(link.incoming.recv().await, None);
    }
}
