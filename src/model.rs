//! Domain records shared by the server and the native client.
//!
//! DESIGN
//! ======
//! `Room` mirrors the `rooms` table. `Shape`, `Presence` and
//! `BroadcastEvent` are the payloads carried by channel frames; their JSON
//! form uses camelCase keys so browser and native clients agree.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ROOM
// =============================================================================

/// A canvas room record. The creator is always present in `collaborators`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub workspace_id: Uuid,
    pub created_by: Uuid,
    pub collaborators: Vec<Uuid>,
    pub is_public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
}

impl Room {
    #[must_use]
    pub fn is_collaborator(&self, user_id: Uuid) -> bool {
        self.collaborators.contains(&user_id)
    }

    pub fn touch(&mut self) {
        self.last_modified = OffsetDateTime::now_utc();
    }
}

/// Role a user holds in a workspace. Absence of a membership row is "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceRole {
    Admin,
    Member,
}

impl WorkspaceRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            _ => None,
        }
    }
}

// =============================================================================
// SHAPES
// =============================================================================

/// One drawable object in a room's shared store, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shape {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub fill: String,
    pub stroke: String,
    pub stroke_width: f64,
    pub opacity: f64,
    pub rotation: f64,
    pub scale_x: f64,
    pub scale_y: f64,
    /// Stacking order. Bring-to-front and send-to-back rewrite this field.
    #[serde(default)]
    pub z_index: i64,
}

impl Shape {
    /// Check that every numeric field is usable and the opacity is in range.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason for the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() || self.id.len() > 128 {
            return Err("shape id must be 1..=128 characters".into());
        }
        if self.kind.is_empty() {
            return Err("shape type required".into());
        }
        let numbers = [
            ("x", self.x),
            ("y", self.y),
            ("width", self.width),
            ("height", self.height),
            ("strokeWidth", self.stroke_width),
            ("opacity", self.opacity),
            ("rotation", self.rotation),
            ("scaleX", self.scale_x),
            ("scaleY", self.scale_y),
        ];
        if let Some((name, _)) = numbers.iter().find(|(_, value)| !value.is_finite()) {
            return Err(format!("{name} must be finite"));
        }
        if !(0.0..=1.0).contains(&self.opacity) {
            return Err("opacity must be within 0..=1".into());
        }
        Ok(())
    }
}

// =============================================================================
// PRESENCE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// One sample of an in-progress free-hand stroke.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrokeSample {
    pub x: f64,
    pub y: f64,
    pub pressure: f64,
}

/// Ephemeral per-connection state. Always sent whole; peers replace their
/// copy wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub cursor: Option<Point>,
    pub selection: Option<Vec<String>>,
    pub stroke: Option<Vec<StrokeSample>>,
    pub color: String,
}

const MAX_SELECTION_LEN: usize = 500;
const MAX_STROKE_SAMPLES: usize = 2000;
const MAX_COLOR_LEN: usize = 32;

impl Presence {
    /// Bound what a connection can make the server relay to every peer.
    ///
    /// # Errors
    ///
    /// Returns a reason for an oversized selection, stroke or color, or a
    /// non-finite coordinate.
    pub fn validate(&self) -> Result<(), String> {
        if self.color.len() > MAX_COLOR_LEN {
            return Err(format!("color must be at most {MAX_COLOR_LEN} bytes"));
        }
        if let Some(selection) = &self.selection {
            if selection.len() > MAX_SELECTION_LEN {
                return Err(format!("selection must hold at most {MAX_SELECTION_LEN} ids"));
            }
            if selection.iter().any(|id| id.len() > 128) {
                return Err("selected shape id too long".into());
            }
        }
        if let Some(stroke) = &self.stroke {
            if stroke.len() > MAX_STROKE_SAMPLES {
                return Err(format!("stroke must hold at most {MAX_STROKE_SAMPLES} samples"));
            }
            if stroke.iter().any(|s| !(s.x.is_finite() && s.y.is_finite() && s.pressure.is_finite())) {
                return Err("stroke samples must be finite".into());
            }
        }
        if self.cursor.is_some_and(|c| !(c.x.is_finite() && c.y.is_finite())) {
            return Err("cursor must be finite".into());
        }
        Ok(())
    }
}

impl Default for Presence {
    fn default() -> Self {
        Self { cursor: None, selection: None, stroke: None, color: "#000000".into() }
    }
}

/// A connected participant's presence as seen by others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPresence {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub presence: Presence,
}

// =============================================================================
// BROADCAST EVENTS
// =============================================================================

const MAX_EMOJI_LEN: usize = 16;
const MAX_CHAT_LEN: usize = 1000;

/// One-shot message to currently connected peers. Never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum BroadcastEvent {
    Reaction { emoji: String, point: Point },
    Chat { text: String },
}

impl BroadcastEvent {
    /// # Errors
    ///
    /// Returns a reason when the emoji or chat text is empty or too long.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Reaction { emoji, point } => {
                if emoji.is_empty() || emoji.len() > MAX_EMOJI_LEN {
                    return Err(format!("emoji must be 1..={MAX_EMOJI_LEN} bytes"));
                }
                if !point.x.is_finite() || !point.y.is_finite() {
                    return Err("reaction point must be finite".into());
                }
                Ok(())
            }
            Self::Chat { text } => {
                if text.trim().is_empty() || text.len() > MAX_CHAT_LEN {
                    return Err(format!("chat text must be 1..={MAX_CHAT_LEN} bytes"));
                }
                Ok(())
            }
        }
    }
}
