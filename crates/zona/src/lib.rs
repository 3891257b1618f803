//! The Zona tactical map in one dependency.
//!
//! `engine` is the SQLite store and change feed, `protocol` the records shared with
//! browsers and clients, `live` the map and admin views that follow the feed.

pub use zona_engine as engine;
pub use zona_live as live;
pub use zona_protocol as protocol;

pub use zona_live::{AdminConsole, HttpClient, MapSession, MapView};
