use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::fmt;
use zona_protocol::{
    Area, AreaPatch, AreaWithFaction, ChangeNotification, Event, EventDraft, EventId, Faction,
    FactionId, Table,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("http error {status}: {message}")]
    Http { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Query/write access to the authoritative tables. Views hold it behind an `Arc` so a
/// test can hand in a fake.
#[async_trait]
pub trait TableService: Send + Sync {
    async fn select_factions(&self) -> Result<Vec<Faction>, ClientError>;
    async fn select_areas(&self) -> Result<Vec<Area>, ClientError>;
    async fn select_areas_with_factions(&self) -> Result<Vec<AreaWithFaction>, ClientError>;
    /// Newest first.
    async fn select_events(&self) -> Result<Vec<Event>, ClientError>;
    async fn insert_event(&self, draft: &EventDraft) -> Result<Event, ClientError>;
    async fn update_event(&self, id: EventId, draft: &EventDraft) -> Result<(), ClientError>;
    async fn delete_event(&self, id: EventId) -> Result<(), ClientError>;
    async fn update_area(&self, slug: &str, patch: &AreaPatch) -> Result<(), ClientError>;
    async fn update_faction_reputation(
        &self,
        id: FactionId,
        reputation: i64,
    ) -> Result<(), ClientError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeFilter {
    tables: Option<Vec<Table>>,
}

impl ChangeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn tables(tables: impl IntoIterator<Item = Table>) -> Self {
        Self {
            tables: Some(tables.into_iter().collect()),
        }
    }

    pub fn matches(&self, table: Table) -> bool {
        match &self.tables {
            None => true,
            Some(tables) => tables.contains(&table),
        }
    }
}

/// What a subscription yields. The feed is at-least-once; `Lagged` means some
/// notifications were dropped and the local mirror must be rebuilt from a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Change(ChangeNotification),
    Lagged(u64),
}

/// A live change stream. Dropping it (or calling `unsubscribe`) releases the listener.
pub struct Subscription {
    stream: BoxStream<'static, FeedMessage>,
}

impl Subscription {
    pub fn new(stream: impl Stream<Item = FeedMessage> + Send + 'static) -> Self {
        Self {
            stream: stream.boxed(),
        }
    }

    pub async fn next(&mut self) -> Option<FeedMessage> {
        self.stream.next().await
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, ClientError>;
}

/// Anything that can both serve snapshots and push changes.
pub trait LiveClient: TableService + ChangeFeed {}

impl<T: TableService + ChangeFeed + ?Sized> LiveClient for T {}
