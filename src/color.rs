//! Packed colors and the per-image result record.

use std::fmt;

/// A 24-bit color packed as `0x00RRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rgb(u32);

impl Rgb {
    /// Packs three channel values. Only the low 8 bits of each are kept.
    pub const fn from_channels(r: u32, g: u32, b: u32) -> Self {
        Rgb(((r & 0xFF) << 16) | ((g & 0xFF) << 8) | (b & 0xFF))
    }

    pub const fn from_packed(value: u32) -> Self {
        Rgb(value)
    }

    pub const fn packed(self) -> u32 {
        self.0
    }

    pub const fn red(self) -> u8 {
        ((self.0 >> 16) & 0xFF) as u8
    }

    pub const fn green(self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }

    pub const fn blue(self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

impl From<[u8; 3]> for Rgb {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Rgb::from_channels(r as u32, g as u32, b as u32)
    }
}

/// Renders as lowercase `#rrggbb`; bits above the low 24 are ignored.
impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06x}", self.0 & 0x00FF_FFFF)
    }
}

/// The three most frequent colors of one image, most frequent first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorResult {
    url: String,
    colors: [Rgb; 3],
}

impl ColorResult {
    pub const HEADER: &'static str = "\"url\",\"color1\",\"color2\",\"color3\"\n";

    pub fn new(url: impl Into<String>, colors: [Rgb; 3]) -> Self {
        Self {
            url: url.into(),
            colors,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn colors(&self) -> [Rgb; 3] {
        self.colors
    }

    /// One CSV line, newline included.
    pub fn record(&self) -> String {
        format!(
            "\"{}\",\"{}\",\"{}\",\"{}\"\n",
            self.url, self.colors[0], self.colors[1], self.colors[2]
        )
    }
}
