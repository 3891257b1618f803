//! Live views for the Zona tactical map.
//!
//! Both views follow the same pattern: load a snapshot of the authoritative tables,
//! then keep a local copy current from the change feed. The map applies event changes
//! incrementally through [`EventStreamReconciler`]; the admin console simply reloads.
//! Clients are injected (`Arc<impl LiveClient>`), so the same views run against the
//! in-process [`zona_engine::Engine`], the HTTP API ([`HttpClient`]) or a test fake.

mod admin;
mod client;
mod http;
mod local;
mod map;
mod reconciler;
mod scope;

pub use admin::{
    AdminConsole, AdminError, AreaForm, EventForm, FormMode, RollbackPolicy, SubmitOutcome,
    UiEffect, DEFAULT_ADMIN_PASSWORD, DEFAULT_EVENT_COLOR, DEFAULT_EVENT_TITLE,
};
pub use client::{
    ChangeFeed, ChangeFilter, ClientError, FeedMessage, LiveClient, Subscription, TableService,
};
pub use http::HttpClient;
pub use map::{ArrivalNotifier, MapSession, MapState, MapView, Ping};
pub use reconciler::{EventStreamReconciler, Reconciled};
pub use scope::{ScopeTicket, ViewScope};

#[cfg(test)]
mod tests;
