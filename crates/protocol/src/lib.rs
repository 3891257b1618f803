use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub type EventId = i64;
pub type AreaId = i64;
pub type FactionId = i64;

pub const REPUTATION_MIN: i64 = 0;
pub const REPUTATION_MAX: i64 = 100;

pub fn clamp_reputation(value: i64) -> i64 {
    value.clamp(REPUTATION_MIN, REPUTATION_MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Faction {
    pub id: FactionId,
    pub slug: String,
    pub name: String,
    pub reputation: i64,
}

impl Faction {
    pub fn standing(&self) -> Standing {
        Standing::from_reputation(self.reputation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Standing {
    Hostile,
    Neutral,
    Allied,
}

impl Standing {
    pub fn from_reputation(value: i64) -> Self {
        if value <= 30 {
            Self::Hostile
        } else if value <= 60 {
            Self::Neutral
        } else {
            Self::Allied
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hostile => "hostile",
            Self::Neutral => "neutral",
            Self::Allied => "allied",
        }
    }
}

/// CSS-style offset of a marker on the map canvas ("42%", "120px").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapPosition {
    pub top: String,
    pub left: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub id: AreaId,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub faction_id: Option<FactionId>,
    pub danger: String,
    pub description: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub top_pos: String,
    pub left_pos: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_top: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_left: Option<String>,
    pub z_index: i64,
    pub width_css: String,
}

impl Area {
    /// Where events that reference this area are pinned. Each axis falls back to the
    /// area's own position when no dedicated ping coordinate is stored.
    pub fn ping_position(&self) -> MapPosition {
        fn pick(ping: &Option<String>, fallback: &str) -> String {
            match ping.as_deref() {
                Some(v) if !v.is_empty() => v.to_string(),
                _ => fallback.to_string(),
            }
        }
        MapPosition {
            top: pick(&self.ping_top, &self.top_pos),
            left: pick(&self.ping_left, &self.left_pos),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaWithFaction {
    #[serde(flatten)]
    pub area: Area,
    #[serde(default)]
    pub factions: Option<Faction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaPatch {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub faction_id: Option<FactionId>,
    pub danger: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub created_at: String,
    pub active: bool,
    pub title: String,
    pub color: String,
    pub message: String,
    #[serde(default)]
    pub top_pos: Option<String>,
    #[serde(default)]
    pub left_pos: Option<String>,
    #[serde(default)]
    pub location_name: Option<String>,
}

impl Event {
    pub fn map_position(&self) -> Option<MapPosition> {
        match (self.top_pos.as_deref(), self.left_pos.as_deref()) {
            (Some(top), Some(left)) if !top.is_empty() && !left.is_empty() => Some(MapPosition {
                top: top.to_string(),
                left: left.to_string(),
            }),
            _ => None,
        }
    }

    /// Active events with coordinates show up as map markers; everything else is log-only.
    pub fn is_ping(&self) -> bool {
        self.active && self.map_position().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLocation {
    pub top_pos: String,
    pub left_pos: String,
    pub location_name: String,
}

impl EventLocation {
    pub fn of_area(area: &Area) -> Self {
        let pos = area.ping_position();
        Self {
            top_pos: pos.top,
            left_pos: pos.left,
            location_name: area.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDraft {
    pub title: String,
    pub color: String,
    pub message: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<EventLocation>,
}

fn default_active() -> bool {
    true
}

impl EventDraft {
    pub fn new(title: impl Into<String>, color: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            color: color.into(),
            message: message.into(),
            active: true,
            location: None,
        }
    }

    pub fn at_area(mut self, area: Option<&Area>) -> Self {
        self.location = area.map(EventLocation::of_area);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationUpdate {
    pub reputation: i64,
}

/// One piece of a title split on `||`; odd pieces are highlighted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan<'a> {
    pub text: &'a str,
    pub highlighted: bool,
}

pub fn highlight_spans(text: &str) -> Vec<TextSpan<'_>> {
    text.split("||")
        .enumerate()
        .map(|(i, text)| TextSpan {
            text,
            highlighted: i % 2 == 1,
        })
        .filter(|span| !span.text.is_empty())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Factions,
    Areas,
    Events,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Factions, Table::Areas, Table::Events];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Factions => "factions",
            Self::Areas => "areas",
            Self::Events => "events",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A row-level change pushed to subscribers. `seq` orders notifications by commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub seq: i64,
    pub table: Table,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<serde_json::Value>,
}

impl ChangeNotification {
    pub fn new_record<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.new.clone().map(serde_json::from_value)
    }

    pub fn old_id(&self) -> Option<i64> {
        self.old.as_ref()?.get("id")?.as_i64()
    }
}

pub mod routes {
    pub const LANDING: &str = "/";
    pub const MAP: &str = "/mapa";
    pub const ADMIN: &str = "/admin-mestre";
    pub const HEALTH: &str = "/health";
    pub const API_FACTIONS: &str = "/api/factions";
    pub const API_AREAS: &str = "/api/areas";
    pub const API_EVENTS: &str = "/api/events";
    pub const API_CHANGES: &str = "/api/changes";
    pub const API_REV: &str = "/api/rev";
    pub const API_UNLOCK: &str = "/api/admin/unlock";
}

/// SSE event names used on the change stream.
pub mod stream {
    pub const CHANGE: &str = "change";
    pub const LAGGED: &str = "lagged";
}
