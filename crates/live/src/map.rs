use crate::client::{ChangeFilter, FeedMessage, LiveClient, Subscription};
use crate::reconciler::{EventStreamReconciler, Reconciled};
use crate::scope::ViewScope;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use zona_protocol::{AreaId, AreaWithFaction, Event, EventId, MapPosition};

/// Hook for the user-facing side of a new arrival (open the log panel, play a sound).
pub trait ArrivalNotifier: Send + Sync {
    fn event_arrived(&self, event: &Event);
}

impl<F> ArrivalNotifier for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn event_arrived(&self, event: &Event) {
        self(event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ping {
    pub event_id: EventId,
    pub position: MapPosition,
    pub color: String,
    pub title: String,
}

impl Ping {
    fn of(event: &Event) -> Option<Self> {
        if !event.active {
            return None;
        }
        Some(Self {
            event_id: event.id,
            position: event.map_position()?,
            color: event.color.clone(),
            title: event.title.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MapState {
    pub areas: Vec<AreaWithFaction>,
    pub events: Vec<Event>,
    pub pings: Vec<Ping>,
    pub history_open: bool,
    pub selected_area: Option<AreaId>,
    pub arrivals: u64,
}

/// The public map: areas with their factions, the event log and its pings, kept live
/// from the change feed.
pub struct MapView<C: ?Sized> {
    client: Arc<C>,
    notifier: Arc<dyn ArrivalNotifier>,
    scope: ViewScope,
    areas: Vec<AreaWithFaction>,
    log: EventStreamReconciler,
    history_open: bool,
    selected_area: Option<AreaId>,
    arrivals: u64,
}

impl<C: LiveClient + ?Sized> MapView<C> {
    pub fn new(client: Arc<C>, notifier: Arc<dyn ArrivalNotifier>) -> Self {
        Self {
            client,
            notifier,
            scope: ViewScope::new(),
            areas: Vec::new(),
            log: EventStreamReconciler::new(),
            history_open: false,
            selected_area: None,
            arrivals: 0,
        }
    }

    pub fn scope(&self) -> &ViewScope {
        &self.scope
    }

    /// Subscribes first and loads the snapshot second, so nothing committed in between
    /// is lost; replays of rows already in the snapshot hit the seen-set. Without a
    /// subscription the view still shows the snapshot, just not live.
    pub async fn mount(&mut self) -> Option<Subscription> {
        let subscription = match self.client.subscribe(ChangeFilter::all()).await {
            Ok(sub) => Some(sub),
            Err(err) => {
                tracing::warn!(error = %err, "map subscription failed; live updates disabled");
                None
            }
        };
        self.refresh().await;
        subscription
    }

    pub fn unmount(&self) {
        self.scope.close();
    }

    /// Full reload of areas and events. Failures keep whatever was shown before.
    pub async fn refresh(&mut self) {
        let ticket = self.scope.ticket();
        match self.client.select_areas_with_factions().await {
            Ok(areas) if ticket.is_live() => self.areas = areas,
            Ok(_) => return,
            Err(err) => tracing::debug!(error = %err, "area snapshot failed; keeping stale areas"),
        }
        match self.log.load_snapshot(&*self.client, &ticket).await {
            Ok(Some(count)) => tracing::debug!(count, "event snapshot loaded"),
            Ok(None) => {}
            Err(err) => tracing::debug!(error = %err, "event snapshot failed; keeping stale log"),
        }
        if let Some(id) = self.selected_area {
            if !self.areas.iter().any(|a| a.area.id == id) {
                self.selected_area = None;
            }
        }
    }

    pub async fn apply(&mut self, message: FeedMessage) -> Reconciled {
        if !self.scope.is_live() {
            return Reconciled::Ignored;
        }
        let change = match message {
            FeedMessage::Change(change) => change,
            FeedMessage::Lagged(missed) => {
                tracing::warn!(missed, "change feed lagged; reloading map");
                self.refresh().await;
                return Reconciled::NeedsReload;
            }
        };

        let outcome = self.log.apply_change(&change);
        match outcome {
            Reconciled::Arrived => {
                self.history_open = true;
                self.arrivals += 1;
                if let Some(event) = self.log.events().first() {
                    tracing::info!(id = event.id, title = %event.title, "new event");
                    self.notifier.event_arrived(event);
                }
            }
            Reconciled::NeedsReload => {
                tracing::debug!(table = change.table.as_str(), "non-event change; reloading map");
                self.refresh().await;
            }
            Reconciled::Replaced | Reconciled::Removed | Reconciled::Ignored => {}
        }
        outcome
    }

    pub fn areas(&self) -> &[AreaWithFaction] {
        &self.areas
    }

    pub fn events(&self) -> &[Event] {
        self.log.events()
    }

    pub fn reconciler(&self) -> &EventStreamReconciler {
        &self.log
    }

    pub fn pings(&self) -> Vec<Ping> {
        self.log.events().iter().filter_map(Ping::of).collect()
    }

    pub fn history_open(&self) -> bool {
        self.history_open
    }

    pub fn toggle_history(&mut self) -> bool {
        self.history_open = !self.history_open;
        self.history_open
    }

    /// Clicking the selected area again clears the selection.
    pub fn select_area(&mut self, id: AreaId) -> Option<&AreaWithFaction> {
        self.selected_area = match self.selected_area {
            Some(current) if current == id => None,
            _ => self.areas.iter().any(|a| a.area.id == id).then_some(id),
        };
        self.selected_area()
    }

    pub fn selected_area(&self) -> Option<&AreaWithFaction> {
        let id = self.selected_area?;
        self.areas.iter().find(|a| a.area.id == id)
    }

    pub fn arrivals(&self) -> u64 {
        self.arrivals
    }

    pub fn state(&self) -> MapState {
        MapState {
            areas: self.areas.clone(),
            events: self.log.events().to_vec(),
            pings: self.pings(),
            history_open: self.history_open,
            selected_area: self.selected_area,
            arrivals: self.arrivals,
        }
    }
}

/// A map view running on its own task. The listener is released when the session is
/// unmounted or dropped; in-flight work is aborted and its results discarded.
pub struct MapSession {
    scope: ViewScope,
    task: JoinHandle<()>,
    state: watch::Receiver<MapState>,
}

impl MapSession {
    pub fn spawn<C>(client: Arc<C>, notifier: Arc<dyn ArrivalNotifier>) -> Self
    where
        C: LiveClient + ?Sized + 'static,
    {
        let mut view = MapView::new(client, notifier);
        let scope = view.scope().clone();
        let (tx, rx) = watch::channel(MapState::default());
        let task = tokio::spawn(async move {
            let subscription = view.mount().await;
            if tx.send(view.state()).is_err() {
                return;
            }
            let Some(mut subscription) = subscription else {
                return;
            };
            while let Some(message) = subscription.next().await {
                if !view.scope().is_live() {
                    break;
                }
                view.apply(message).await;
                if tx.send(view.state()).is_err() {
                    break;
                }
            }
            tracing::debug!("map session feed ended");
        });
        Self {
            scope,
            task,
            state: rx,
        }
    }

    pub fn state(&self) -> watch::Receiver<MapState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn unmount(self) {
        drop(self);
    }
}

impl Drop for MapSession {
    fn drop(&mut self) {
        self.scope.close();
        self.task.abort();
    }
}
