//! In-process client: the engine serves both the tables and the push feed.

use crate::client::{ChangeFeed, ChangeFilter, ClientError, FeedMessage, Subscription, TableService};
use async_trait::async_trait;
use futures::future;
use futures::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use zona_engine::Engine;
use zona_protocol::{Area, AreaPatch, AreaWithFaction, Event, EventDraft, EventId, Faction, FactionId};

async fn blocking<T, F>(engine: &Engine, f: F) -> Result<T, ClientError>
where
    T: Send + 'static,
    F: FnOnce(&Engine) -> anyhow::Result<T> + Send + 'static,
{
    let engine = engine.clone();
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| ClientError::Backend(format!("engine task failed: {e}")))?
        .map_err(|e| ClientError::Backend(format!("{e:#}")))
}

fn found(hit: bool, what: impl FnOnce() -> String) -> Result<(), ClientError> {
    if hit {
        Ok(())
    } else {
        Err(ClientError::NotFound(what()))
    }
}

#[async_trait]
impl TableService for Engine {
    async fn select_factions(&self) -> Result<Vec<Faction>, ClientError> {
        blocking(self, |e| e.list_factions()).await
    }

    async fn select_areas(&self) -> Result<Vec<Area>, ClientError> {
        blocking(self, |e| e.list_areas()).await
    }

    async fn select_areas_with_factions(&self) -> Result<Vec<AreaWithFaction>, ClientError> {
        blocking(self, |e| e.list_areas_with_factions()).await
    }

    async fn select_events(&self) -> Result<Vec<Event>, ClientError> {
        blocking(self, |e| e.list_events()).await
    }

    async fn insert_event(&self, draft: &EventDraft) -> Result<Event, ClientError> {
        let draft = draft.clone();
        blocking(self, move |e| e.insert_event(&draft)).await
    }

    async fn update_event(&self, id: EventId, draft: &EventDraft) -> Result<(), ClientError> {
        let draft = draft.clone();
        let row = blocking(self, move |e| e.update_event(id, &draft)).await?;
        found(row.is_some(), || format!("event {id}"))
    }

    async fn delete_event(&self, id: EventId) -> Result<(), ClientError> {
        let hit = blocking(self, move |e| e.delete_event(id)).await?;
        found(hit, || format!("event {id}"))
    }

    async fn update_area(&self, slug: &str, patch: &AreaPatch) -> Result<(), ClientError> {
        let (slug, patch) = (slug.to_string(), patch.clone());
        let key = slug.clone();
        let row = blocking(self, move |e| e.update_area(&key, &patch)).await?;
        found(row.is_some(), || format!("area {slug}"))
    }

    async fn update_faction_reputation(
        &self,
        id: FactionId,
        reputation: i64,
    ) -> Result<(), ClientError> {
        let row = blocking(self, move |e| e.update_faction_reputation(id, reputation)).await?;
        found(row.is_some(), || format!("faction {id}"))
    }
}

#[async_trait]
impl ChangeFeed for Engine {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, ClientError> {
        let stream = BroadcastStream::new(self.listen()).filter_map(move |item| {
            future::ready(match item {
                Ok(change) if filter.matches(change.table) => Some(FeedMessage::Change(change)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(missed)) => Some(FeedMessage::Lagged(missed)),
            })
        });
        Ok(Subscription::new(stream))
    }
}
