use crate::error::{Error, Result};
use crate::signaling::{LinkFrame, RelayConnector, RelayLink};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

/// Relay по WebSocket: `<base>/<identity>`
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base: Url,
}

impl WebSocketConnector {
    pub fn new(base: &str) -> Result<Self> {
        let base = Url::parse(base)
            .map_err(|e| Error::InvalidConfig(format!("relay url `{base}`: {e}")))?;
        match base.scheme() {
            "ws" | "wss" => Ok(Self { base }),
            other => Err(Error::InvalidConfig(format!(
                "relay url must use ws or wss, got `{other}`"
            ))),
        }
    }

    /// Адрес для конкретного пользователя; имя кодируется как сегмент пути
    pub fn endpoint(&self, identity: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidConfig(format!("relay url `{}` cannot be a base", self.base)))?
            .pop_if_empty()
            .push(identity);
        Ok(url)
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self, identity: &str) -> Result<RelayLink> {
        let url = self.endpoint(identity)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Channel(format!("websocket connect failed: {e}")))?;
        debug!(url = %url, "signaling websocket connected");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkFrame>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_write.send(Message::Text(text)).await {
                    warn!(class = "channel", "websocket write failed: {e}");
                    return;
                }
            }
            // канал закрыт локально
            let _ = ws_write.send(Message::Close(None)).await;
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(LinkFrame::Text(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(close)) => {
                        let _ = in_tx.send(LinkFrame::Closed(close.map(|f| f.reason.to_string())));
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = in_tx.send(LinkFrame::Closed(Some(e.to_string())));
                        return;
                    }
                }
            }
            let _ = in_tx.send(LinkFrame::Closed(None));
        });

        Ok(RelayLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
