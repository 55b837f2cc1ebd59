use anyhow::{bail, Context, Result};
use image::RgbImage;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Largest coordinate the fixed-width compact tag can address.
pub const COMPACT_COORD_MAX: u32 = 999;

const BACKGROUND_RGB: [u8; 3] = [255, 255, 255];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    pub x: u32,
    pub y: u32,
}

impl Position {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Key used for this position in the persisted state record.
    pub fn state_key(&self) -> String {
        format!("{}-{}", self.x, self.y)
    }

    pub fn from_state_key(key: &str) -> Option<Self> {
        let (x, y) = key.split_once('-')?;
        Some(Self::new(x.parse().ok()?, y.parse().ok()?))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(X: {}, Y: {})", self.x, self.y)
    }
}

/// Six lowercase hex digits, no leading `#`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Color(String);

impl Color {
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == 6 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(raw.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn from_rgb(rgb: [u8; 3]) -> Self {
        Self(format!("{:02x}{:02x}{:02x}", rgb[0], rgb[1], rgb[2]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every pixel ever reported by a decoded wall tag, last writer wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedWall {
    pixels: HashMap<Position, Color>,
}

impl ObservedWall {
    pub fn get(&self, pos: Position) -> Option<&Color> {
        self.pixels.get(&pos)
    }

    pub fn set(&mut self, pos: Position, color: Color) -> Option<Color> {
        self.pixels.insert(pos, color)
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Position, &Color)> {
        self.pixels.iter()
    }
}

impl FromIterator<(Position, Color)> for ObservedWall {
    fn from_iter<I: IntoIterator<Item = (Position, Color)>>(iter: I) -> Self {
        Self {
            pixels: iter.into_iter().collect(),
        }
    }
}

/// The image we want on the wall, placed at `offset`. Only non-background
/// pixels are kept; a missing local position means "leave as-is".
#[derive(Debug, Clone)]
pub struct TargetImage {
    width: u32,
    height: u32,
    offset: Position,
    pixels: HashMap<Position, Color>,
}

impl TargetImage {
    pub fn from_rgb(img: &RgbImage, offset: Position) -> Result<Self> {
        let (width, height) = img.dimensions();
        if offset.x.checked_add(width).is_none() || offset.y.checked_add(height).is_none() {
            bail!(
                "target placement overflows the coordinate range: offset {offset}, size {width}x{height}"
            );
        }

        let mut pixels = HashMap::new();
        for (x, y, px) in img.enumerate_pixels() {
            if px.0 == BACKGROUND_RGB {
                continue;
            }
            pixels.insert(Position::new(x, y), Color::from_rgb(px.0));
        }

        Ok(Self {
            width,
            height,
            offset,
            pixels,
        })
    }

    pub fn load(path: &Path, offset: Position) -> Result<Self> {
        if !path.exists() {
            bail!("target image not found: {}", path.display());
        }
        let decoded = image::open(path)
            .with_context(|| format!("failed to open target image: {}", path.display()))?;
        Self::from_rgb(&decoded.to_rgb8(), offset)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn offset(&self) -> Position {
        self.offset
    }

    pub fn pixel_count(&self) -> usize {
        self.pixels.len()
    }

    pub fn color_at(&self, local: Position) -> Option<&Color> {
        self.pixels.get(&local)
    }

    /// Whether an absolute wall position falls inside the placement rectangle.
    pub fn contains(&self, pos: Position) -> bool {
        let x = u64::from(pos.x);
        let y = u64::from(pos.y);
        let ox = u64::from(self.offset.x);
        let oy = u64::from(self.offset.y);
        x >= ox && x < ox + u64::from(self.width) && y >= oy && y < oy + u64::from(self.height)
    }

    pub fn to_absolute(&self, local: Position) -> Position {
        Position::new(self.offset.x + local.x, self.offset.y + local.y)
    }

    /// False when part of the placement can't be expressed as a compact tag.
    pub fn fits_compact_tag(&self) -> bool {
        let max_x = u64::from(self.offset.x) + u64::from(self.width);
        let max_y = u64::from(self.offset.y) + u64::from(self.height);
        max_x <= u64::from(COMPACT_COORD_MAX) + 1 && max_y <= u64::from(COMPACT_COORD_MAX) + 1
    }
}
