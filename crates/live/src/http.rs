//! Client for the zona server API. Snapshots and writes are JSON over HTTP; the change
//! feed is the server-sent event stream at `/api/changes`.

use crate::client::{ChangeFeed, ChangeFilter, ClientError, FeedMessage, Subscription, TableService};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use zona_protocol::{
    routes, stream as sse, Area, AreaPatch, AreaWithFaction, ChangeNotification, Event, EventDraft,
    EventId, Faction, FactionId, ReputationUpdate,
};

#[derive(Debug, Clone)]
pub struct HttpClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ClientError> {
        let mut request = self.client.request(method, self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;
        check_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.send::<()>(Method::GET, path, None)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound(message));
    }
    Err(ClientError::Http {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl TableService for HttpClient {
    async fn select_factions(&self) -> Result<Vec<Faction>, ClientError> {
        self.get_json(routes::API_FACTIONS).await
    }

    async fn select_areas(&self) -> Result<Vec<Area>, ClientError> {
        self.get_json(routes::API_AREAS).await
    }

    async fn select_areas_with_factions(&self) -> Result<Vec<AreaWithFaction>, ClientError> {
        self.get_json(&format!("{}?with=factions", routes::API_AREAS))
            .await
    }

    async fn select_events(&self) -> Result<Vec<Event>, ClientError> {
        self.get_json(routes::API_EVENTS).await
    }

    async fn insert_event(&self, draft: &EventDraft) -> Result<Event, ClientError> {
        self.send(Method::POST, routes::API_EVENTS, Some(draft))
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn update_event(&self, id: EventId, draft: &EventDraft) -> Result<(), ClientError> {
        let path = format!("{}/{id}", routes::API_EVENTS);
        self.send(Method::PATCH, &path, Some(draft)).await?;
        Ok(())
    }

    async fn delete_event(&self, id: EventId) -> Result<(), ClientError> {
        let path = format!("{}/{id}", routes::API_EVENTS);
        self.send::<()>(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn update_area(&self, slug: &str, patch: &AreaPatch) -> Result<(), ClientError> {
        let path = format!("{}/{slug}", routes::API_AREAS);
        self.send(Method::PATCH, &path, Some(patch)).await?;
        Ok(())
    }

    async fn update_faction_reputation(
        &self,
        id: FactionId,
        reputation: i64,
    ) -> Result<(), ClientError> {
        let path = format!("{}/{id}", routes::API_FACTIONS);
        self.send(Method::PATCH, &path, Some(&ReputationUpdate { reputation }))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for HttpClient {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, ClientError> {
        let response = self
            .client
            .get(self.url(routes::API_CHANGES))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ClientError::Request(format!("connect change stream: {e}")))?;
        let response = check_status(response).await?;
        tracing::info!(url = %self.url(routes::API_CHANGES), "change stream connected");

        let body = response.bytes_stream().boxed();
        let messages = stream::unfold(
            (body, SseDecoder::default(), VecDeque::new()),
            move |(mut body, mut decoder, mut pending)| {
                let filter = filter.clone();
                async move {
                    loop {
                        if let Some(message) = pending.pop_front() {
                            return Some((message, (body, decoder, pending)));
                        }
                        match body.next().await {
                            Some(Ok(chunk)) => pending.extend(
                                decoder
                                    .push(&chunk)
                                    .into_iter()
                                    .filter_map(|frame| feed_message(frame, &filter)),
                            ),
                            Some(Err(err)) => {
                                tracing::warn!(error = %err, "change stream broke");
                                return None;
                            }
                            None => return None,
                        }
                    }
                }
            },
        );
        Ok(Subscription::new(messages))
    }
}

fn feed_message(frame: SseFrame, filter: &ChangeFilter) -> Option<FeedMessage> {
    match frame.event.as_str() {
        sse::CHANGE => match serde_json::from_str::<ChangeNotification>(&frame.data) {
            Ok(change) if filter.matches(change.table) => Some(FeedMessage::Change(change)),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(id = ?frame.id, error = %err, "undecodable change frame");
                None
            }
        },
        sse::LAGGED => Some(FeedMessage::Lagged(frame.data.trim().parse().unwrap_or(0))),
        other => {
            tracing::trace!(event = other, "ignoring stream frame");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

impl SseFrame {
    /// Frames without data (keep-alive comments) yield nothing.
    fn parse(input: &str) -> Option<Self> {
        let mut event = "message".to_string();
        let mut data = String::new();
        let mut id = None;

        for line in input.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (key, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match key {
                "event" => event = value.to_string(),
                "data" => {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(value);
                }
                "id" => id = Some(value.to_string()),
                _ => {}
            }
        }

        if data.is_empty() {
            return None;
        }
        Some(Self { event, data, id })
    }
}

/// Splits a byte stream into SSE frames. Bytes are buffered until a blank line so a
/// frame (or a UTF-8 sequence) cut across chunks is reassembled.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut frames = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let raw: Vec<u8> = self.buf.drain(..end + 2).collect();
            if let Some(frame) = SseFrame::parse(&String::from_utf8_lossy(&raw)) {
                frames.push(frame);
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zona_protocol::{ChangeKind, Table};

    #[test]
    fn decoder_reassembles_split_frames() {
        let mut decoder = SseDecoder::default();
        let first = decoder.push(b"event: change\nid: 3\nda");
        assert!(first.is_empty());
        let frames = decoder.push(b"ta: {\"a\":1}\r\n\r\n:keep-alive\n\nevent: lagged\ndata: 4\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "change");
        assert_eq!(frames[0].id.as_deref(), Some("3"));
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[1].event, "lagged");
    }

    #[test]
    fn multibyte_text_survives_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        let text = "data: Pântano\n\n".as_bytes();
        let cut = text.iter().position(|b| *b > 0x7f).unwrap() + 1;
        assert!(decoder.push(&text[..cut]).is_empty());
        let frames = decoder.push(&text[cut..]);
        assert_eq!(frames[0].data, "Pântano");
    }

    #[test]
    fn frames_map_to_feed_messages() {
        let change = ChangeNotification {
            seq: 9,
            table: Table::Areas,
            kind: ChangeKind::Update,
            old: None,
            new: Some(serde_json::json!({ "id": 1 })),
        };
        let frame = SseFrame {
            event: sse::CHANGE.into(),
            data: serde_json::to_string(&change).unwrap(),
            id: Some("9".into()),
        };
        assert_eq!(
            feed_message(frame.clone(), &ChangeFilter::all()),
            Some(FeedMessage::Change(change))
        );
        assert_eq!(feed_message(frame, &ChangeFilter::tables([Table::Events])), None);

        let lagged = SseFrame {
            event: sse::LAGGED.into(),
            data: "12".into(),
            id: None,
        };
        assert_eq!(
            feed_message(lagged, &ChangeFilter::all()),
            Some(FeedMessage::Lagged(12))
        );
    }
}
