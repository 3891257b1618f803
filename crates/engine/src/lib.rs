use anyhow::Context;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use zona_protocol::{
    clamp_reputation, Area, AreaPatch, AreaWithFaction, ChangeKind, ChangeNotification, Event,
    EventDraft, EventId, Faction, FactionId, Table,
};

pub const DEFAULT_FEED_CAPACITY: usize = 256;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

pub fn rfc3339_from_ms(ms: i64) -> String {
    time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|t| {
            t.format(&time::format_description::well_known::Rfc3339)
                .ok()
        })
        .unwrap_or_default()
}

pub fn now_rfc3339() -> String {
    rfc3339_from_ms(now_ms())
}

/// Table store for factions, areas and events. Every committed write is appended to
/// `change_log` and pushed to live subscribers.
///
/// Writes from all clones of an engine are serialized, so notifications reach the feed
/// in `seq` order.
#[derive(Debug, Clone)]
pub struct Engine {
    db_path: PathBuf,
    feed: broadcast::Sender<ChangeNotification>,
    writer: Arc<Mutex<()>>,
}

impl Engine {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self::with_feed_capacity(db_path, DEFAULT_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(db_path: impl Into<PathBuf>, capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        Self {
            db_path: db_path.into(),
            feed,
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn open(&self) -> anyhow::Result<Connection> {
        let path = self.db_path.clone();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create db dir: {}", dir.display()))?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open sqlite db: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        migrate(&conn)?;
        Ok(conn)
    }

    pub fn listen(&self) -> broadcast::Receiver<ChangeNotification> {
        self.feed.subscribe()
    }

    /// Inserts the demo zone when the tables are empty. Safe to call on every start.
    pub fn seed_defaults(&self) -> anyhow::Result<()> {
        let _writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let conn = self.open()?;
        let factions: i64 = conn.query_row("SELECT COUNT(*) FROM factions", [], |r| r.get(0))?;
        if factions == 0 {
            for (slug, name, reputation) in SEED_FACTIONS {
                conn.execute(
                    "INSERT INTO factions (slug, name, reputation) VALUES (?1, ?2, ?3)",
                    (slug, name, reputation),
                )?;
            }
        }

        let areas: i64 = conn.query_row("SELECT COUNT(*) FROM areas", [], |r| r.get(0))?;
        if areas == 0 {
            for seed in SEED_AREAS {
                let faction_id: Option<i64> = match seed.faction {
                    Some(slug) => conn
                        .query_row("SELECT id FROM factions WHERE slug = ?1", [slug], |r| {
                            r.get(0)
                        })
                        .optional()?,
                    None => None,
                };
                conn.execute(
                    "INSERT INTO areas (slug, name, faction_id, danger, description, image_url,
                       top_pos, left_pos, ping_top, ping_left, z_index, width_css)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    (
                        seed.slug,
                        seed.name,
                        faction_id,
                        seed.danger,
                        seed.description,
                        format!("/images/{}.png", seed.slug),
                        seed.top,
                        seed.left,
                        seed.ping.map(|p| p.0),
                        seed.ping.map(|p| p.1),
                        seed.z_index,
                        seed.width,
                    ),
                )?;
            }
            tracing::info!(count = SEED_AREAS.len(), "seeded demo areas");
        }
        Ok(())
    }

    pub fn list_factions(&self) -> anyhow::Result<Vec<Faction>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!("SELECT {FACTION_COLUMNS} FROM factions ORDER BY name"))?;
        let rows = stmt.query_map([], faction_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn list_areas(&self) -> anyhow::Result<Vec<Area>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!("SELECT {AREA_COLUMNS} FROM areas ORDER BY name"))?;
        let rows = stmt.query_map([], area_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn list_areas_with_factions(&self) -> anyhow::Result<Vec<AreaWithFaction>> {
        let factions = self.list_factions()?;
        Ok(self
            .list_areas()?
            .into_iter()
            .map(|area| {
                let linked = area
                    .faction_id
                    .and_then(|id| factions.iter().find(|f| f.id == id).cloned());
                AreaWithFaction {
                    area,
                    factions: linked,
                }
            })
            .collect())
    }

    /// Newest first.
    pub fn list_events(&self) -> anyhow::Result<Vec<Event>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY created_at_ms DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], event_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn get_event(&self, id: EventId) -> anyhow::Result<Option<Event>> {
        let conn = self.open()?;
        Ok(select_event(&conn, id)?)
    }

    pub fn insert_event(&self, draft: &EventDraft) -> anyhow::Result<Event> {
        self.write(|tx| {
            let ts = now_ms();
            let loc = draft.location.as_ref();
            tx.execute(
                "INSERT INTO events (created_at, created_at_ms, active, title, color, message,
                   top_pos, left_pos, location_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                (
                    rfc3339_from_ms(ts),
                    ts,
                    draft.active,
                    &draft.title,
                    &draft.color,
                    &draft.message,
                    loc.map(|l| l.top_pos.as_str()),
                    loc.map(|l| l.left_pos.as_str()),
                    loc.map(|l| l.location_name.as_str()),
                ),
            )?;
            let id = tx.last_insert_rowid();
            let event = select_event(tx, id)?.context("inserted event vanished")?;
            let change = append_change_tx(tx, Table::Events, ChangeKind::Insert, None, Some(&event))?;
            Ok((event, Some(change)))
        })
    }

    /// Rewrites the text fields of an event. The stored location is only replaced when
    /// the draft carries one.
    pub fn update_event(&self, id: EventId, draft: &EventDraft) -> anyhow::Result<Option<Event>> {
        self.write(|tx| {
            let Some(old) = select_event(tx, id)? else {
                return Ok((None, None));
            };
            tx.execute(
                "UPDATE events SET active = ?2, title = ?3, color = ?4, message = ?5 WHERE id = ?1",
                (id, draft.active, &draft.title, &draft.color, &draft.message),
            )?;
            if let Some(loc) = &draft.location {
                tx.execute(
                    "UPDATE events SET top_pos = ?2, left_pos = ?3, location_name = ?4 WHERE id = ?1",
                    (id, &loc.top_pos, &loc.left_pos, &loc.location_name),
                )?;
            }
            let new = select_event(tx, id)?.context("updated event vanished")?;
            let change = append_change_tx(tx, Table::Events, ChangeKind::Update, Some(&old), Some(&new))?;
            Ok((Some(new), Some(change)))
        })
    }

    pub fn delete_event(&self, id: EventId) -> anyhow::Result<bool> {
        self.write(|tx| {
            let Some(old) = select_event(tx, id)? else {
                return Ok((false, None));
            };
            tx.execute("DELETE FROM events WHERE id = ?1", [id])?;
            let change =
                append_change_tx::<Event>(tx, Table::Events, ChangeKind::Delete, Some(&old), None)?;
            Ok((true, Some(change)))
        })
    }

    pub fn update_area(&self, slug: &str, patch: &AreaPatch) -> anyhow::Result<Option<Area>> {
        self.write(|tx| {
            let Some(old) = select_area_by_slug(tx, slug)? else {
                return Ok((None, None));
            };
            tx.execute(
                "UPDATE areas SET name = ?2, description = ?3, faction_id = ?4, danger = ?5 WHERE slug = ?1",
                (slug, &patch.name, &patch.description, patch.faction_id, &patch.danger),
            )
            .with_context(|| format!("update area {slug}"))?;
            let new = select_area_by_slug(tx, slug)?.context("updated area vanished")?;
            let change = append_change_tx(tx, Table::Areas, ChangeKind::Update, Some(&old), Some(&new))?;
            Ok((Some(new), Some(change)))
        })
    }

    pub fn update_faction_reputation(
        &self,
        id: FactionId,
        reputation: i64,
    ) -> anyhow::Result<Option<Faction>> {
        self.write(|tx| {
            let Some(old) = select_faction(tx, id)? else {
                return Ok((None, None));
            };
            tx.execute(
                "UPDATE factions SET reputation = ?2 WHERE id = ?1",
                (id, clamp_reputation(reputation)),
            )?;
            let new = select_faction(tx, id)?.context("updated faction vanished")?;
            let change = append_change_tx(tx, Table::Factions, ChangeKind::Update, Some(&old), Some(&new))?;
            Ok((Some(new), Some(change)))
        })
    }

    pub fn get_rev(&self) -> anyhow::Result<i64> {
        let conn = self.open()?;
        let rev: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM change_log", [], |row| row.get(0))?;
        Ok(rev.unwrap_or(0))
    }

    /// Change-log entries with `seq > after`, oldest first.
    pub fn changes_since(&self, after: i64, limit: usize) -> anyhow::Result<Vec<ChangeNotification>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT seq, table_name, kind, old_json, new_json FROM change_log
             WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map((after, limit), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (seq, table, kind, old, new) = row?;
            let (Some(table), Some(kind)) = (Table::parse(&table), ChangeKind::parse(&kind)) else {
                tracing::warn!(seq, %table, %kind, "skipping unrecognized change-log row");
                continue;
            };
            out.push(ChangeNotification {
                seq,
                table,
                kind,
                old: old.map(|s| serde_json::from_str(&s)).transpose()?,
                new: new.map(|s| serde_json::from_str(&s)).transpose()?,
            });
        }
        Ok(out)
    }

    /// Runs `f` in an IMMEDIATE transaction under the writer lock and publishes its change
    /// after commit, still under the lock. `f` returns no change when it matched no row.
    fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> anyhow::Result<(T, Option<ChangeNotification>)>,
    ) -> anyhow::Result<T> {
        // The guard only orders writers; a panicked writer left no state behind it.
        let _writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (out, change) = f(&tx)?;
        tx.commit()?;
        if let Some(change) = change {
            self.publish(change);
        }
        Ok(out)
    }

    fn publish(&self, change: ChangeNotification) {
        tracing::debug!(
            seq = change.seq,
            table = change.table.as_str(),
            kind = change.kind.as_str(),
            "publish change"
        );
        // No receivers is fine: nobody is watching right now.
        let _ = self.feed.send(change);
    }
}

const FACTION_COLUMNS: &str = "id, slug, name, reputation";
const AREA_COLUMNS: &str = "id, slug, name, faction_id, danger, description, image_url, \
     top_pos, left_pos, ping_top, ping_left, z_index, width_css";
const EVENT_COLUMNS: &str =
    "id, created_at, active, title, color, message, top_pos, left_pos, location_name";

fn faction_from_row(row: &Row<'_>) -> rusqlite::Result<Faction> {
    Ok(Faction {
        id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        reputation: row.get(3)?,
    })
}

fn area_from_row(row: &Row<'_>) -> rusqlite::Result<Area> {
    Ok(Area {
        id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        faction_id: row.get(3)?,
        danger: row.get(4)?,
        description: row.get(5)?,
        image_url: row.get(6)?,
        top_pos: row.get(7)?,
        left_pos: row.get(8)?,
        ping_top: row.get(9)?,
        ping_left: row.get(10)?,
        z_index: row.get(11)?,
        width_css: row.get(12)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        created_at: row.get(1)?,
        active: row.get(2)?,
        title: row.get(3)?,
        color: row.get(4)?,
        message: row.get(5)?,
        top_pos: row.get(6)?,
        left_pos: row.get(7)?,
        location_name: row.get(8)?,
    })
}

fn select_event(conn: &Connection, id: EventId) -> rusqlite::Result<Option<Event>> {
    conn.query_row(
        &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
        [id],
        event_from_row,
    )
    .optional()
}

fn select_area_by_slug(conn: &Connection, slug: &str) -> rusqlite::Result<Option<Area>> {
    conn.query_row(
        &format!("SELECT {AREA_COLUMNS} FROM areas WHERE slug = ?1"),
        [slug],
        area_from_row,
    )
    .optional()
}

fn select_faction(conn: &Connection, id: FactionId) -> rusqlite::Result<Option<Faction>> {
    conn.query_row(
        &format!("SELECT {FACTION_COLUMNS} FROM factions WHERE id = ?1"),
        [id],
        faction_from_row,
    )
    .optional()
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if v < 1 {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS factions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  slug TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  reputation INTEGER NOT NULL DEFAULT 50 CHECK (reputation BETWEEN 0 AND 100)
);

CREATE TABLE IF NOT EXISTS areas (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  slug TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  faction_id INTEGER REFERENCES factions(id) ON DELETE SET NULL,
  danger TEXT NOT NULL DEFAULT '',
  description TEXT NOT NULL DEFAULT '',
  image_url TEXT,
  top_pos TEXT NOT NULL DEFAULT '0%',
  left_pos TEXT NOT NULL DEFAULT '0%',
  z_index INTEGER NOT NULL DEFAULT 1,
  width_css TEXT NOT NULL DEFAULT '10%'
);

CREATE TABLE IF NOT EXISTS events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  created_at TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  active INTEGER NOT NULL DEFAULT 1,
  title TEXT NOT NULL DEFAULT 'INFO',
  color TEXT NOT NULL DEFAULT '#33ff33',
  message TEXT NOT NULL,
  top_pos TEXT,
  left_pos TEXT,
  location_name TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at_ms);

-- Monotonic revision source for live clients.
CREATE TABLE IF NOT EXISTS change_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  ts_ms INTEGER NOT NULL,
  table_name TEXT NOT NULL,
  kind TEXT NOT NULL,
  old_json TEXT,
  new_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_change_log_ts ON change_log(ts_ms);
"#,
        )?;

        conn.pragma_update(None, "user_version", 1_i64)?;
    }

    // Ping coordinates arrived after the first areas were drawn.
    ensure_column(conn, "areas", "ping_top", "TEXT")?;
    ensure_column(conn, "areas", "ping_left", "TEXT")?;

    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, col: &str, decl: &str) -> anyhow::Result<()> {
    let sql = format!("ALTER TABLE {table} ADD COLUMN {col} {decl}");
    match conn.execute(&sql, []) {
        Ok(_) => Ok(()),
        Err(e) => {
            if e.to_string().to_lowercase().contains("duplicate column") {
                return Ok(());
            }
            Err(e).with_context(|| format!("ensure column {table}.{col}"))
        }
    }
}

fn append_change_tx<T: serde::Serialize>(
    tx: &Transaction<'_>,
    table: Table,
    kind: ChangeKind,
    old: Option<&T>,
    new: Option<&T>,
) -> anyhow::Result<ChangeNotification> {
    let old = old.map(serde_json::to_value).transpose()?;
    let new = new.map(serde_json::to_value).transpose()?;
    tx.execute(
        "INSERT INTO change_log (ts_ms, table_name, kind, old_json, new_json) VALUES (?1, ?2, ?3, ?4, ?5)",
        (
            now_ms(),
            table.as_str(),
            kind.as_str(),
            old.as_ref().map(|v| v.to_string()),
            new.as_ref().map(|v| v.to_string()),
        ),
    )?;
    Ok(ChangeNotification {
        seq: tx.last_insert_rowid(),
        table,
        kind,
        old,
        new,
    })
}

const SEED_FACTIONS: [(&str, &str, i64); 3] = [
    ("guarnicao", "Guarnição Duga", 45),
    ("cientistas", "Cientistas do Anel", 62),
    ("saqueadores", "Saqueadores", 18),
];

struct SeedArea {
    slug: &'static str,
    name: &'static str,
    faction: Option<&'static str>,
    danger: &'static str,
    description: &'static str,
    top: &'static str,
    left: &'static str,
    ping: Option<(&'static str, &'static str)>,
    z_index: i64,
    width: &'static str,
}

const SEED_AREAS: [SeedArea; 4] = [
    SeedArea {
        slug: "radar",
        name: "Radar Duga",
        faction: Some("guarnicao"),
        danger: "EXTREMO",
        description: "Antena abandonada. Sinal intermitente.",
        top: "18%",
        left: "54%",
        ping: Some(("22%", "58%")),
        z_index: 3,
        width: "20%",
    },
    SeedArea {
        slug: "laboratorio",
        name: "Laboratório X-8",
        faction: Some("cientistas"),
        danger: "ALTO",
        description: "Complexo subterrâneo lacrado.",
        top: "52%",
        left: "28%",
        ping: None,
        z_index: 2,
        width: "16%",
    },
    SeedArea {
        slug: "ferrovia",
        name: "Pátio Ferroviário",
        faction: Some("saqueadores"),
        danger: "MÉDIO",
        description: "Vagões enferrujados e emboscadas.",
        top: "64%",
        left: "62%",
        ping: Some(("68%", "66%")),
        z_index: 1,
        width: "22%",
    },
    SeedArea {
        slug: "pantano",
        name: "Pântano",
        faction: None,
        danger: "DESCONHECIDO",
        description: "Território contestado.",
        top: "34%",
        left: "10%",
        ping: None,
        z_index: 1,
        width: "18%",
    },
];
