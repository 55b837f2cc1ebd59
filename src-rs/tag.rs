use crate::canvas::{Color, Position};
use crate::diff::DiffEntry;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Placeholder in the user template that receives the encoded pixel.
pub const TEMPLATE_PLACEHOLDER: &str = "<gw>";

static VERBOSE_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"graffitiwall:([0-9]{1,3}):([0-9]{1,3}):#([0-9a-fA-F]{6})")
        .expect("verbose tag pattern is valid")
});

static COMPACT_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"gw:([0-9]{3})([0-9]{3})([0-9a-fA-F]{6})").expect("compact tag pattern is valid")
});

/// One pixel write announced on the wall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WallUpdate {
    pub position: Position,
    pub color: Color,
}

/// A decoded tag, keeping track of which format it was written in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WallTag {
    /// `graffitiwall:<x>:<y>:#<rrggbb>`
    Verbose(WallUpdate),
    /// `gw:<xxx><yyy><rrggbb>`
    Compact(WallUpdate),
}

impl WallTag {
    #[cfg(test)]
    pub fn update(&self) -> &WallUpdate {
        match self {
            WallTag::Verbose(update) | WallTag::Compact(update) => update,
        }
    }

    pub fn into_update(self) -> WallUpdate {
        match self {
            WallTag::Verbose(update) | WallTag::Compact(update) => update,
        }
    }
}

type TagMatcher = fn(&str) -> Option<WallTag>;

/// Tried in order, first hit wins.
const MATCHERS: [TagMatcher; 2] = [match_verbose, match_compact];

fn match_verbose(text: &str) -> Option<WallTag> {
    VERBOSE_TAG
        .captures(text)
        .and_then(|caps| update_from_captures(&caps))
        .map(WallTag::Verbose)
}

fn match_compact(text: &str) -> Option<WallTag> {
    COMPACT_TAG
        .captures(text)
        .and_then(|caps| update_from_captures(&caps))
        .map(WallTag::Compact)
}

fn update_from_captures(caps: &Captures<'_>) -> Option<WallUpdate> {
    let x = caps.get(1)?.as_str().parse().ok()?;
    let y = caps.get(2)?.as_str().parse().ok()?;
    let color = Color::parse(caps.get(3)?.as_str())?;
    Some(WallUpdate {
        position: Position::new(x, y),
        color,
    })
}

/// Drops every code point at or above U+0080.
pub fn strip_non_ascii(text: &str) -> String {
    text.chars().filter(char::is_ascii).collect()
}

/// Turns a `0x`-prefixed hex graffiti field into the ASCII text it carries.
/// Returns `None` when the field isn't valid hex.
pub fn graffiti_text(hex_payload: &str) -> Option<String> {
    let raw = hex_payload
        .strip_prefix("0x")
        .or_else(|| hex_payload.strip_prefix("0X"))
        .unwrap_or(hex_payload);
    let bytes = hex::decode(raw).ok()?;
    Some(strip_non_ascii(&String::from_utf8_lossy(&bytes)))
}

pub fn parse_tag(text: &str) -> Option<WallTag> {
    let text = strip_non_ascii(text);
    MATCHERS.iter().find_map(|matcher| matcher(&text))
}

pub fn decode_graffiti(hex_payload: &str) -> Option<WallTag> {
    parse_tag(&graffiti_text(hex_payload)?)
}

/// Compact tag for one pending pixel, coordinates zero-padded to 3 digits.
/// `None` when a coordinate needs more than 3 digits.
pub fn encode_payload(entry: &DiffEntry) -> Option<String> {
    if !entry.fits_compact_tag() {
        return None;
    }
    Some(format!(
        "gw:{:03}{:03}{}",
        entry.position.x, entry.position.y, entry.color
    ))
}

/// Substitutes the encoded pixel (or nothing) for the first placeholder.
pub fn render_template(template: &str, entry: Option<&DiffEntry>) -> String {
    let payload = entry.and_then(encode_payload).unwrap_or_default();
    template.replacen(TEMPLATE_PLACEHOLDER, &payload, 1)
}
