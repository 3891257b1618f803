use super::*;
use async_trait::async_trait;
use futures::stream;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use zona_engine::Engine;
use zona_protocol::{
    Area, AreaPatch, AreaWithFaction, ChangeKind, ChangeNotification, Event, EventDraft, EventId,
    Faction, FactionId, Table,
};

// ---------------------------------------------------------------------------
// Fake backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeTables {
    factions: Mutex<Vec<Faction>>,
    areas: Mutex<Vec<Area>>,
    events: Mutex<Vec<Event>>,
    next_id: AtomicI64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_subscribe: AtomicBool,
    event_selects: AtomicUsize,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<FeedMessage>>>,
}

impl FakeTables {
    fn seeded() -> Arc<Self> {
        let fake = Self::default();
        fake.next_id.store(100, Ordering::SeqCst);
        *fake.factions.lock().unwrap() = vec![Faction {
            id: 1,
            slug: "guarnicao".into(),
            name: "Guarnição".into(),
            reputation: 45,
        }];
        *fake.areas.lock().unwrap() = vec![area(1, "radar", "Radar Duga"), area(2, "pantano", "Pântano")];
        *fake.events.lock().unwrap() = vec![event(1, "INFO")];
        Arc::new(fake)
    }

    fn set(&self, flag: &AtomicBool, on: bool) {
        flag.store(on, Ordering::SeqCst);
    }

    fn push(&self, message: FeedMessage) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(message.clone()).is_ok());
    }

    fn read(&self) -> Result<(), ClientError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ClientError::Request("offline".into()));
        }
        Ok(())
    }

    fn write(&self) -> Result<(), ClientError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ClientError::Http {
                status: 500,
                message: "write rejected".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TableService for FakeTables {
    async fn select_factions(&self) -> Result<Vec<Faction>, ClientError> {
        self.read()?;
        Ok(self.factions.lock().unwrap().clone())
    }

    async fn select_areas(&self) -> Result<Vec<Area>, ClientError> {
        self.read()?;
        Ok(self.areas.lock().unwrap().clone())
    }

    async fn select_areas_with_factions(&self) -> Result<Vec<AreaWithFaction>, ClientError> {
        self.read()?;
        let factions = self.factions.lock().unwrap().clone();
        Ok(self
            .areas
            .lock()
            .unwrap()
            .iter()
            .map(|a| AreaWithFaction {
                area: a.clone(),
                factions: a
                    .faction_id
                    .and_then(|id| factions.iter().find(|f| f.id == id).cloned()),
            })
            .collect())
    }

    async fn select_events(&self) -> Result<Vec<Event>, ClientError> {
        self.event_selects.fetch_add(1, Ordering::SeqCst);
        self.read()?;
        let mut rows = self.events.lock().unwrap().clone();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rows)
    }

    async fn insert_event(&self, draft: &EventDraft) -> Result<Event, ClientError> {
        self.write()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut row = event(id, &draft.title);
        row.color = draft.color.clone();
        row.message = draft.message.clone();
        if let Some(loc) = &draft.location {
            row.top_pos = Some(loc.top_pos.clone());
            row.left_pos = Some(loc.left_pos.clone());
            row.location_name = Some(loc.location_name.clone());
        }
        self.events.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn update_event(&self, id: EventId, draft: &EventDraft) -> Result<(), ClientError> {
        self.write()?;
        let mut rows = self.events.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| ClientError::NotFound(format!("event {id}")))?;
        row.title = draft.title.clone();
        row.color = draft.color.clone();
        row.message = draft.message.clone();
        Ok(())
    }

    async fn delete_event(&self, id: EventId) -> Result<(), ClientError> {
        self.write()?;
        self.events.lock().unwrap().retain(|e| e.id != id);
        Ok(())
    }

    async fn update_area(&self, slug: &str, patch: &AreaPatch) -> Result<(), ClientError> {
        self.write()?;
        let mut rows = self.areas.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|a| a.slug == slug)
            .ok_or_else(|| ClientError::NotFound(format!("area {slug}")))?;
        row.name = patch.name.clone();
        row.description = patch.description.clone();
        row.faction_id = patch.faction_id;
        row.danger = patch.danger.clone();
        Ok(())
    }

    async fn update_faction_reputation(
        &self,
        id: FactionId,
        reputation: i64,
    ) -> Result<(), ClientError> {
        self.write()?;
        if let Some(f) = self.factions.lock().unwrap().iter_mut().find(|f| f.id == id) {
            f.reputation = reputation;
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for FakeTables {
    async fn subscribe(&self, _filter: ChangeFilter) -> Result<Subscription, ClientError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(ClientError::Request("realtime unavailable".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        Ok(Subscription::new(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|m| (m, rx))
        })))
    }
}

fn area(id: i64, slug: &str, name: &str) -> Area {
    Area {
        id,
        slug: slug.into(),
        name: name.into(),
        faction_id: Some(1),
        danger: "ALTO".into(),
        description: format!("{name} description"),
        image_url: None,
        top_pos: format!("{}%", id * 10),
        left_pos: format!("{}%", id * 20),
        ping_top: (id == 1).then(|| "12%".to_string()),
        ping_left: None,
        z_index: 1,
        width_css: "10%".into(),
    }
}

fn event(id: EventId, title: &str) -> Event {
    Event {
        id,
        created_at: "2026-10-19T12:00:00Z".into(),
        active: true,
        title: title.into(),
        color: "#33ff33".into(),
        message: format!("message {id}"),
        top_pos: None,
        left_pos: None,
        location_name: None,
    }
}

fn change(table: Table, kind: ChangeKind, row: serde_json::Value) -> FeedMessage {
    let (old, new) = match kind {
        ChangeKind::Delete => (Some(row), None),
        _ => (None, Some(row)),
    };
    FeedMessage::Change(ChangeNotification {
        seq: 1,
        table,
        kind,
        old,
        new,
    })
}

fn insert(ev: Event) -> FeedMessage {
    change(Table::Events, ChangeKind::Insert, serde_json::to_value(ev).unwrap())
}

struct CountingNotifier(AtomicUsize);

impl ArrivalNotifier for CountingNotifier {
    fn event_arrived(&self, _event: &Event) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn map_view(fake: &Arc<FakeTables>) -> (MapView<FakeTables>, Arc<CountingNotifier>) {
    let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));
    (MapView::new(fake.clone(), notifier.clone()), notifier)
}

fn ids(events: &[Event]) -> Vec<EventId> {
    events.iter().map(|e| e.id).collect()
}

// ---------------------------------------------------------------------------
// Map view
// ---------------------------------------------------------------------------

#[tokio::test]
async fn map_mount_loads_snapshot_without_arrival() {
    let fake = FakeTables::seeded();
    let (mut view, notifier) = map_view(&fake);
    let sub = view.mount().await;
    assert!(sub.is_some());
    assert_eq!(ids(view.events()), vec![1]);
    assert_eq!(view.areas().len(), 2);
    assert_eq!(view.areas()[0].factions.as_ref().unwrap().slug, "guarnicao");
    assert_eq!(notifier.0.load(Ordering::SeqCst), 0);
    assert!(!view.history_open());

    view.refresh().await;
    assert_eq!(notifier.0.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn map_insert_arrives_once_and_opens_log() {
    let fake = FakeTables::seeded();
    let (mut view, notifier) = map_view(&fake);
    let mut sub = view.mount().await.unwrap();

    fake.push(insert(event(2, "ALERT")));
    fake.push(insert(event(2, "ALERT")));
    fake.push(insert(event(1, "INFO")));
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let message = sub.next().await.unwrap();
        outcomes.push(view.apply(message).await);
    }

    assert_eq!(
        outcomes,
        vec![Reconciled::Arrived, Reconciled::Ignored, Reconciled::Ignored]
    );
    assert_eq!(ids(view.events()), vec![2, 1]);
    assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
    assert_eq!(view.arrivals(), 1);
    assert!(view.history_open());
}

#[tokio::test]
async fn map_update_and_delete_apply_in_place() {
    let fake = FakeTables::seeded();
    fake.events.lock().unwrap().push(event(2, "B"));
    let (mut view, _) = map_view(&fake);
    view.mount().await;
    assert_eq!(ids(view.events()), vec![2, 1]);

    let mut edited = event(1, "EDITED");
    edited.message = "rewritten".into();
    let out = view
        .apply(change(Table::Events, ChangeKind::Update, serde_json::to_value(&edited).unwrap()))
        .await;
    assert_eq!(out, Reconciled::Replaced);
    assert_eq!(ids(view.events()), vec![2, 1]);
    assert_eq!(view.events()[1].title, "EDITED");

    let out = view
        .apply(change(Table::Events, ChangeKind::Delete, serde_json::json!({ "id": 1 })))
        .await;
    assert_eq!(out, Reconciled::Removed);
    assert_eq!(ids(view.events()), vec![2]);
    assert!(!view.reconciler().contains(1));
}

#[tokio::test]
async fn map_reloads_on_other_tables() {
    let fake = FakeTables::seeded();
    let (mut view, notifier) = map_view(&fake);
    view.mount().await;
    let selects = fake.event_selects.load(Ordering::SeqCst);

    fake.factions.lock().unwrap()[0].reputation = 90;
    fake.events.lock().unwrap().push(event(5, "QUIET"));
    let out = view
        .apply(change(Table::Factions, ChangeKind::Update, serde_json::json!({ "id": 1 })))
        .await;

    assert_eq!(out, Reconciled::NeedsReload);
    assert_eq!(fake.event_selects.load(Ordering::SeqCst), selects + 1);
    assert_eq!(view.areas()[0].factions.as_ref().unwrap().reputation, 90);
    // Picked up by the snapshot, so no alert.
    assert_eq!(ids(view.events()), vec![5, 1]);
    assert_eq!(notifier.0.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn map_failed_reload_keeps_stale_state() {
    let fake = FakeTables::seeded();
    let (mut view, _) = map_view(&fake);
    view.mount().await;

    fake.set(&fake.fail_reads, true);
    fake.events.lock().unwrap().clear();
    let out = view.apply(FeedMessage::Lagged(3)).await;
    assert_eq!(out, Reconciled::NeedsReload);
    assert_eq!(ids(view.events()), vec![1]);
    assert_eq!(view.areas().len(), 2);
}

#[tokio::test]
async fn map_without_subscription_still_shows_snapshot() {
    let fake = FakeTables::seeded();
    fake.set(&fake.fail_subscribe, true);
    let (mut view, _) = map_view(&fake);
    assert!(view.mount().await.is_none());
    assert_eq!(ids(view.events()), vec![1]);
}

#[tokio::test]
async fn map_discards_work_after_unmount() {
    let fake = FakeTables::seeded();
    let (mut view, notifier) = map_view(&fake);
    view.mount().await;
    view.unmount();

    fake.events.lock().unwrap().push(event(7, "LATE"));
    view.refresh().await;
    assert_eq!(ids(view.events()), vec![1]);

    assert_eq!(view.apply(insert(event(8, "LATE"))).await, Reconciled::Ignored);
    assert_eq!(ids(view.events()), vec![1]);
    assert_eq!(notifier.0.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn map_pings_and_area_selection() {
    let fake = FakeTables::seeded();
    let mut located = event(3, "ALERT");
    located.top_pos = Some("12%".into());
    located.left_pos = Some("20%".into());
    located.color = "#ff0000".into();
    let mut inactive = located.clone();
    inactive.id = 4;
    inactive.active = false;
    fake.events.lock().unwrap().extend([located, inactive]);

    let (mut view, _) = map_view(&fake);
    view.mount().await;
    let pings = view.pings();
    assert_eq!(pings.len(), 1);
    assert_eq!(pings[0].event_id, 3);
    assert_eq!(pings[0].color, "#ff0000");
    assert_eq!(pings[0].position.top, "12%");

    assert_eq!(view.select_area(2).map(|a| a.area.slug.as_str()), Some("pantano"));
    assert!(view.select_area(2).is_none());
    assert!(view.select_area(99).is_none());

    assert!(view.toggle_history());
    assert!(!view.toggle_history());
}

// ---------------------------------------------------------------------------
// Admin console
// ---------------------------------------------------------------------------

async fn unlocked(fake: &Arc<FakeTables>) -> AdminConsole<FakeTables> {
    let mut console = AdminConsole::new(fake.clone());
    assert!(console.unlock("meowl"));
    console.reload().await;
    console
}

#[tokio::test]
async fn admin_gate_blocks_writes() {
    let fake = FakeTables::seeded();
    let mut console = AdminConsole::new(fake.clone()).with_password("segredo");
    assert!(!console.unlock("MEOWL"));
    assert!(matches!(console.submit_event().await, Err(AdminError::Locked)));
    assert!(matches!(console.set_reputation(1, 10).await, Err(AdminError::Locked)));
    console.reload().await;
    assert!(console.factions().is_empty());

    assert!(console.unlock("Segredo"));
    console.lock();
    assert!(!console.is_unlocked());
}

#[tokio::test]
async fn admin_reputation_stays_optimistic_when_write_fails() {
    let fake = FakeTables::seeded();
    let mut console = unlocked(&fake).await;
    assert_eq!(console.factions()[0].reputation, 45);

    fake.set(&fake.fail_writes, true);
    assert_eq!(console.set_reputation(1, 70).await.unwrap(), 70);
    assert_eq!(console.factions()[0].reputation, 70);

    console.reload().await;
    assert_eq!(console.factions()[0].reputation, 45);
}

#[tokio::test]
async fn admin_reputation_restore_policy_rolls_back() {
    let fake = FakeTables::seeded();
    let mut console = AdminConsole::new(fake.clone()).with_rollback(RollbackPolicy::Restore);
    console.unlock("MEOWL");
    console.reload().await;

    fake.set(&fake.fail_writes, true);
    console.set_reputation(1, 70).await.unwrap();
    assert_eq!(console.factions()[0].reputation, 45);

    fake.set(&fake.fail_writes, false);
    assert_eq!(console.set_reputation(1, 180).await.unwrap(), 100);
    assert_eq!(fake.factions.lock().unwrap()[0].reputation, 100);
}

#[tokio::test]
async fn admin_creates_event_at_area_ping() {
    let fake = FakeTables::seeded();
    let mut console = unlocked(&fake).await;
    {
        let form = console.event_form_mut();
        form.title = "ALERT".into();
        form.color = "#ff0000".into();
        form.message = "contato no radar".into();
        form.area_slug = Some("radar".into());
    }
    assert_eq!(console.submit_event().await.unwrap(), SubmitOutcome::Created);

    let created = console.events()[0].clone();
    assert_eq!(created.title, "ALERT");
    assert_eq!(created.top_pos.as_deref(), Some("12%"));
    assert_eq!(created.left_pos.as_deref(), Some("20%"));
    assert_eq!(created.location_name.as_deref(), Some("Radar Duga"));

    let form = console.event_form();
    assert_eq!(form.title, DEFAULT_EVENT_TITLE);
    assert!(form.message.is_empty());
    assert_eq!(form.color, "#ff0000");
    assert_eq!(form.mode, FormMode::Creating);
}

#[tokio::test]
async fn admin_empty_message_submits_nothing() {
    let fake = FakeTables::seeded();
    let mut console = unlocked(&fake).await;
    assert_eq!(console.submit_event().await.unwrap(), SubmitOutcome::Skipped);
    console.event_form_mut().message = "  \n\t ".into();
    assert_eq!(console.submit_event().await.unwrap(), SubmitOutcome::Skipped);
    assert_eq!(fake.events.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn admin_titles_are_sent_upper_cased() {
    let fake = FakeTables::seeded();
    let mut console = unlocked(&fake).await;
    {
        let form = console.event_form_mut();
        form.title = "alerta ||vermelho||".into();
        form.message = "emissão".into();
    }
    assert_eq!(console.submit_event().await.unwrap(), SubmitOutcome::Created);
    assert_eq!(console.events()[0].title, "ALERTA ||VERMELHO||");
}

#[tokio::test]
async fn admin_edit_form_state_machine() {
    let fake = FakeTables::seeded();
    let mut located = event(2, "ALERT");
    located.location_name = Some("Pântano".into());
    fake.events.lock().unwrap().push(located);
    let mut console = unlocked(&fake).await;

    assert_eq!(console.start_edit(99), None);
    assert_eq!(console.start_edit(2), Some(UiEffect::ScrollToTop));
    let form = console.event_form().clone();
    assert_eq!(form.mode, FormMode::Editing(2));
    assert_eq!(form.title, "ALERT");
    assert_eq!(form.message, "message 2");
    assert_eq!(form.area_slug.as_deref(), Some("pantano"));

    console.cancel_edit();
    assert_eq!(console.event_form().mode, FormMode::Creating);
    assert!(console.event_form().message.is_empty());
    assert_eq!(fake.events.lock().unwrap()[1].message, "message 2");

    console.start_edit(2);
    console.event_form_mut().message = "atualizado".into();
    assert_eq!(console.submit_event().await.unwrap(), SubmitOutcome::Updated);
    assert_eq!(console.event_form().mode, FormMode::Creating);
    let stored = console.events().iter().find(|e| e.id == 2).unwrap();
    assert_eq!(stored.message, "atualizado");
}

#[tokio::test]
async fn admin_event_write_failures_are_silent() {
    let fake = FakeTables::seeded();
    let mut console = unlocked(&fake).await;
    fake.set(&fake.fail_writes, true);
    console.event_form_mut().message = "perdido".into();
    assert_eq!(console.submit_event().await.unwrap(), SubmitOutcome::Created);
    assert_eq!(ids(console.events()), vec![1]);
    assert!(console.delete_event(1).await.is_ok());
    assert_eq!(ids(console.events()), vec![1]);
}

#[tokio::test]
async fn admin_area_save_surfaces_failures() {
    let fake = FakeTables::seeded();
    let mut console = unlocked(&fake).await;
    assert!(matches!(console.save_area().await, Err(AdminError::NoAreaSelected)));

    console.select_area("radar");
    assert_eq!(console.area_form().name, "Radar Duga");
    assert_eq!(console.area_form().faction_id, Some(1));
    console.area_form_mut().danger = "EXTREMO".into();
    console.area_form_mut().faction_id = None;

    fake.set(&fake.fail_writes, true);
    let err = console.save_area().await.unwrap_err();
    assert!(matches!(err, AdminError::AreaWrite { ref slug, .. } if slug == "radar"));

    fake.set(&fake.fail_writes, false);
    console.save_area().await.unwrap();
    let radar = console.areas().iter().find(|a| a.slug == "radar").unwrap();
    assert_eq!(radar.danger, "EXTREMO");
    assert_eq!(radar.faction_id, None);
}

#[tokio::test]
async fn admin_reloads_on_any_change() {
    let fake = FakeTables::seeded();
    let mut console = AdminConsole::new(fake.clone());
    assert!(matches!(console.mount().await, Err(AdminError::Locked)));
    console.unlock("MEOWL");
    let mut sub = console.mount().await.unwrap().unwrap();

    fake.events.lock().unwrap().push(event(3, "NEW"));
    fake.push(insert(event(3, "NEW")));
    sub.next().await.unwrap();
    console.on_change().await;
    assert_eq!(ids(console.events()), vec![3, 1]);

    console.unmount();
    fake.events.lock().unwrap().clear();
    console.on_change().await;
    assert_eq!(ids(console.events()), vec![3, 1]);
}

// ---------------------------------------------------------------------------
// Against the real engine
// ---------------------------------------------------------------------------

fn temp_engine() -> Arc<Engine> {
    let p = std::env::temp_dir().join(format!(
        "zona-live-test-{}.db",
        time::OffsetDateTime::now_utc().unix_timestamp_nanos()
    ));
    let engine = Engine::new(p);
    engine.seed_defaults().expect("seed db");
    Arc::new(engine)
}

async fn wait_for(
    state: &mut tokio::sync::watch::Receiver<MapState>,
    pred: impl Fn(&MapState) -> bool,
) -> MapState {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if pred(&state.borrow_and_update()) {
                return state.borrow().clone();
            }
            state.changed().await.expect("session alive");
        }
    })
    .await
    .expect("map state reached in time")
}

#[tokio::test]
async fn session_follows_admin_writes_on_engine() {
    let engine = temp_engine();
    let arrived = Arc::new(Mutex::new(Vec::new()));
    let sink = arrived.clone();
    let notifier: Arc<dyn ArrivalNotifier> = Arc::new(move |ev: &Event| {
        sink.lock().unwrap().push(ev.id);
    });

    let session = MapSession::spawn(engine.clone(), notifier);
    let mut state = session.state();
    wait_for(&mut state, |s| s.areas.len() == 4).await;

    let mut console = AdminConsole::new(engine.clone());
    console.unlock("MEOWL");
    console.reload().await;
    console.event_form_mut().message = "sinal no radar".into();
    console.event_form_mut().area_slug = Some("radar".into());
    console.submit_event().await.unwrap();
    let id = console.events()[0].id;

    let s = wait_for(&mut state, |s| s.arrivals == 1).await;
    assert!(s.history_open);
    assert_eq!(s.pings.len(), 1);
    assert_eq!(s.pings[0].position.top, "22%");
    assert_eq!(*arrived.lock().unwrap(), vec![id]);

    console.delete_event(id).await.unwrap();
    let s = wait_for(&mut state, |s| s.events.is_empty()).await;
    assert!(s.pings.is_empty());

    let guarnicao = console
        .factions()
        .iter()
        .find(|f| f.slug == "guarnicao")
        .unwrap()
        .id;
    console.set_reputation(guarnicao, 80).await.unwrap();
    wait_for(&mut state, |s| {
        s.areas
            .iter()
            .any(|a| a.factions.as_ref().is_some_and(|f| f.reputation == 80))
    })
    .await;

    session.unmount();
    assert_eq!(arrived.lock().unwrap().len(), 1);
}
