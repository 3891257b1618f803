use crate::client::{ChangeFilter, ClientError, LiveClient, Subscription, TableService};
use crate::scope::ViewScope;
use std::sync::Arc;
use zona_protocol::{clamp_reputation, Area, AreaPatch, Event, EventDraft, EventId, Faction, FactionId};

pub const DEFAULT_ADMIN_PASSWORD: &str = "MEOWL";
pub const DEFAULT_EVENT_TITLE: &str = "INFO";
pub const DEFAULT_EVENT_COLOR: &str = "#33ff33";

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("admin console is locked")]
    Locked,
    #[error("no area selected")]
    NoAreaSelected,
    #[error("failed to update area {slug}: {source}")]
    AreaWrite {
        slug: String,
        #[source]
        source: ClientError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormMode {
    Creating,
    Editing(EventId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventForm {
    pub mode: FormMode,
    pub title: String,
    pub color: String,
    pub message: String,
    /// Slug of the area the event pings, if any.
    pub area_slug: Option<String>,
}

impl Default for EventForm {
    fn default() -> Self {
        Self {
            mode: FormMode::Creating,
            title: DEFAULT_EVENT_TITLE.to_string(),
            color: DEFAULT_EVENT_COLOR.to_string(),
            message: String::new(),
            area_slug: None,
        }
    }
}

impl EventForm {
    fn reset_text(&mut self) {
        self.message.clear();
        self.title = DEFAULT_EVENT_TITLE.to_string();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AreaForm {
    pub slug: Option<String>,
    pub name: String,
    pub description: String,
    pub faction_id: Option<FactionId>,
    pub danger: String,
}

/// What happens to an optimistic reputation change when the write fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackPolicy {
    /// Leave the local value in place until the next reload corrects it.
    #[default]
    Keep,
    /// Put the previous value back immediately.
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Created,
    Updated,
    /// Nothing to send: the message was empty or blank.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEffect {
    ScrollToTop,
}

/// The game master's console. Writes go straight to the table service and are followed
/// by a full reload; only faction reputation is patched locally ahead of the write.
pub struct AdminConsole<C: ?Sized> {
    client: Arc<C>,
    password: String,
    unlocked: bool,
    rollback: RollbackPolicy,
    scope: ViewScope,
    factions: Vec<Faction>,
    areas: Vec<Area>,
    events: Vec<Event>,
    event_form: EventForm,
    area_form: AreaForm,
}

impl<C: TableService + ?Sized> AdminConsole<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            password: DEFAULT_ADMIN_PASSWORD.to_string(),
            unlocked: false,
            rollback: RollbackPolicy::default(),
            scope: ViewScope::new(),
            factions: Vec::new(),
            areas: Vec::new(),
            events: Vec::new(),
            event_form: EventForm::default(),
            area_form: AreaForm::default(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into().to_uppercase();
        self
    }

    pub fn with_rollback(mut self, policy: RollbackPolicy) -> Self {
        self.rollback = policy;
        self
    }

    /// Client-side gate only; the input is upper-cased like the password field does.
    pub fn unlock(&mut self, input: &str) -> bool {
        self.unlocked = input.to_uppercase() == self.password;
        self.unlocked
    }

    pub fn lock(&mut self) {
        self.unlocked = false;
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    pub fn scope(&self) -> &ViewScope {
        &self.scope
    }

    pub fn factions(&self) -> &[Faction] {
        &self.factions
    }

    pub fn areas(&self) -> &[Area] {
        &self.areas
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn event_form(&self) -> &EventForm {
        &self.event_form
    }

    pub fn event_form_mut(&mut self) -> &mut EventForm {
        &mut self.event_form
    }

    pub fn area_form(&self) -> &AreaForm {
        &self.area_form
    }

    pub fn area_form_mut(&mut self) -> &mut AreaForm {
        &mut self.area_form
    }

    /// Reloads factions, areas and events. Each table keeps its stale rows on failure.
    pub async fn reload(&mut self) {
        if !self.unlocked {
            return;
        }
        let ticket = self.scope.ticket();

        let factions = self.client.select_factions().await;
        let areas = self.client.select_areas().await;
        let events = self.client.select_events().await;
        if !ticket.is_live() {
            return;
        }

        match factions {
            Ok(rows) => self.factions = rows,
            Err(err) => tracing::debug!(error = %err, "faction reload failed"),
        }
        match areas {
            Ok(rows) => {
                self.areas = rows;
                self.fill_area_form();
            }
            Err(err) => tracing::debug!(error = %err, "area reload failed"),
        }
        match events {
            Ok(rows) => self.events = rows,
            Err(err) => tracing::debug!(error = %err, "event reload failed"),
        }
    }

    /// Moves the slider: the local row changes first, then the write is sent.
    pub async fn set_reputation(&mut self, id: FactionId, value: i64) -> Result<i64, AdminError> {
        if !self.unlocked {
            return Err(AdminError::Locked);
        }
        let value = clamp_reputation(value);
        let previous = self.factions.iter_mut().find(|f| f.id == id).map(|f| {
            let previous = f.reputation;
            f.reputation = value;
            previous
        });

        let ticket = self.scope.ticket();
        if let Err(err) = self.client.update_faction_reputation(id, value).await {
            tracing::warn!(faction = id, value, error = %err, "reputation write failed");
            if let (RollbackPolicy::Restore, Some(previous), true) =
                (self.rollback, previous, ticket.is_live())
            {
                if let Some(f) = self.factions.iter_mut().find(|f| f.id == id) {
                    f.reputation = previous;
                }
            }
        }
        Ok(value)
    }

    /// Loads an event into the form. The caller scrolls the page to the form.
    pub fn start_edit(&mut self, id: EventId) -> Option<UiEffect> {
        let event = self.events.iter().find(|e| e.id == id)?;
        let area_slug = event.location_name.as_deref().and_then(|name| {
            self.areas
                .iter()
                .find(|a| a.name == name)
                .map(|a| a.slug.clone())
        });
        self.event_form = EventForm {
            mode: FormMode::Editing(id),
            title: event.title.clone(),
            color: event.color.clone(),
            message: event.message.clone(),
            area_slug,
        };
        Some(UiEffect::ScrollToTop)
    }

    pub fn cancel_edit(&mut self) {
        self.event_form.mode = FormMode::Creating;
        self.event_form.reset_text();
    }

    /// Creates or updates depending on the form mode, then reloads. Write failures are
    /// logged and otherwise not reported.
    pub async fn submit_event(&mut self) -> Result<SubmitOutcome, AdminError> {
        if !self.unlocked {
            return Err(AdminError::Locked);
        }
        if self.event_form.message.trim().is_empty() {
            return Ok(SubmitOutcome::Skipped);
        }

        let area = self
            .event_form
            .area_slug
            .as_deref()
            .and_then(|slug| self.areas.iter().find(|a| a.slug == slug));
        let draft = EventDraft::new(
            self.event_form.title.to_uppercase(),
            self.event_form.color.clone(),
            self.event_form.message.clone(),
        )
        .at_area(area);

        let outcome = match self.event_form.mode {
            FormMode::Editing(id) => {
                if let Err(err) = self.client.update_event(id, &draft).await {
                    tracing::warn!(id, error = %err, "event update failed");
                }
                self.event_form.mode = FormMode::Creating;
                SubmitOutcome::Updated
            }
            FormMode::Creating => {
                match self.client.insert_event(&draft).await {
                    Ok(event) => tracing::info!(id = event.id, title = %event.title, "event created"),
                    Err(err) => tracing::warn!(error = %err, "event insert failed"),
                }
                SubmitOutcome::Created
            }
        };

        self.reload().await;
        self.event_form.reset_text();
        Ok(outcome)
    }

    /// Confirmation is the caller's job.
    pub async fn delete_event(&mut self, id: EventId) -> Result<(), AdminError> {
        if !self.unlocked {
            return Err(AdminError::Locked);
        }
        if let Err(err) = self.client.delete_event(id).await {
            tracing::warn!(id, error = %err, "event delete failed");
        }
        self.reload().await;
        Ok(())
    }

    /// Picks the area to edit and fills the form from its current row.
    pub fn select_area(&mut self, slug: &str) {
        self.area_form.slug = Some(slug.to_string());
        self.fill_area_form();
    }

    fn fill_area_form(&mut self) {
        let Some(slug) = self.area_form.slug.as_deref() else {
            return;
        };
        if let Some(area) = self.areas.iter().find(|a| a.slug == slug) {
            self.area_form.name = area.name.clone();
            self.area_form.description = area.description.clone();
            self.area_form.faction_id = area.faction_id;
            self.area_form.danger = area.danger.clone();
        }
    }

    /// The one write whose failure is reported back.
    pub async fn save_area(&mut self) -> Result<(), AdminError> {
        if !self.unlocked {
            return Err(AdminError::Locked);
        }
        let slug = self
            .area_form
            .slug
            .clone()
            .ok_or(AdminError::NoAreaSelected)?;
        let patch = AreaPatch {
            name: self.area_form.name.clone(),
            description: self.area_form.description.clone(),
            faction_id: self.area_form.faction_id,
            danger: self.area_form.danger.clone(),
        };
        self.client
            .update_area(&slug, &patch)
            .await
            .map_err(|source| AdminError::AreaWrite {
                slug: slug.clone(),
                source,
            })?;
        tracing::info!(%slug, "area updated");
        self.reload().await;
        Ok(())
    }
}

impl<C: LiveClient + ?Sized> AdminConsole<C> {
    /// Loads everything and starts listening. Any change on any table triggers a full
    /// reload via [`AdminConsole::on_change`].
    pub async fn mount(&mut self) -> Result<Option<Subscription>, AdminError> {
        if !self.unlocked {
            return Err(AdminError::Locked);
        }
        let subscription = match self.client.subscribe(ChangeFilter::all()).await {
            Ok(sub) => Some(sub),
            Err(err) => {
                tracing::warn!(error = %err, "admin subscription failed; live updates disabled");
                None
            }
        };
        self.reload().await;
        Ok(subscription)
    }

    pub async fn on_change(&mut self) {
        if self.scope.is_live() {
            self.reload().await;
        }
    }

    pub fn unmount(&self) {
        self.scope.close();
    }
}
