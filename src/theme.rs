//! Theme system: scope resolution and token metadata packing
//!
//! Themes are YAML files mapping highlight scopes to colors and font
//! styles. Built-in themes are embedded at compile time; user themes load
//! from a file path. The resolver turns a token's scope list plus language
//! id into one packed `u32` the renderer can consume directly.
//!
//! ## Metadata layout
//!
//! ```text
//! bits  0..8   language id
//! bit   8      bracket flag (scope contained "punctuation")
//! bits  9..12  font style (bold | italic | underline)
//! bits 12..22  foreground palette index (0 = theme default foreground)
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::languages::LanguageId;

// Embed theme YAML files at compile time
pub const DEFAULT_DARK_YAML: &str = include_str!("../themes/dark.yaml");
pub const DEFAULT_LIGHT_YAML: &str = include_str!("../themes/light.yaml");

/// A built-in theme entry
pub struct BuiltinTheme {
    /// Stable identifier for config (e.g. "default-dark")
    pub id: &'static str,
    /// Embedded YAML content
    pub yaml: &'static str,
}

/// Registry of all built-in themes
pub const BUILTIN_THEMES: &[BuiltinTheme] = &[
    BuiltinTheme {
        id: "default-dark",
        yaml: DEFAULT_DARK_YAML,
    },
    BuiltinTheme {
        id: "default-light",
        yaml: DEFAULT_LIGHT_YAML,
    },
];

/// RGBA color (0-255 per channel)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    /// Create a new color from RGB values (alpha defaults to 255)
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// Convert to ARGB u32 for framebuffer output
    pub fn to_argb_u32(&self) -> u32 {
        ((self.a as u32) << 24) | ((self.r as u32) << 16) | ((self.g as u32) << 8) | (self.b as u32)
    }

    /// Parse from "#RRGGBB" or "#RRGGBBAA" hex string
    pub fn from_hex(s: &str) -> Result<Self, String> {
        let s = s.trim_start_matches('#');
        match s.len() {
            6 => Ok(Color {
                r: u8::from_str_radix(&s[0..2], 16).map_err(|e| e.to_string())?,
                g: u8::from_str_radix(&s[2..4], 16).map_err(|e| e.to_string())?,
                b: u8::from_str_radix(&s[4..6], 16).map_err(|e| e.to_string())?,
                a: 255,
            }),
            8 => Ok(Color {
                r: u8::from_str_radix(&s[0..2], 16).map_err(|e| e.to_string())?,
                g: u8::from_str_radix(&s[2..4], 16).map_err(|e| e.to_string())?,
                b: u8::from_str_radix(&s[4..6], 16).map_err(|e| e.to_string())?,
                a: u8::from_str_radix(&s[6..8], 16).map_err(|e| e.to_string())?,
            }),
            _ => Err(format!("Invalid color format: {}", s)),
        }
    }
}

/// Font style bits packed into token metadata
pub const STYLE_BOLD: u32 = 1;
pub const STYLE_ITALIC: u32 = 2;
pub const STYLE_UNDERLINE: u32 = 4;

const LANGUAGE_MASK: u32 = 0xFF;
const BRACKET_BIT: u32 = 1 << 8;
const STYLE_SHIFT: u32 = 9;
const STYLE_MASK: u32 = 0b111;
const COLOR_SHIFT: u32 = 12;
const COLOR_MASK: u32 = 0x3FF;

/// Pack a resolved style into token metadata
pub fn pack_metadata(color_index: u16, style: u32, language: LanguageId, has_bracket: bool) -> u32 {
    let mut meta = language.encoded() as u32;
    if has_bracket {
        meta |= BRACKET_BIT;
    }
    meta |= (style & STYLE_MASK) << STYLE_SHIFT;
    meta |= (color_index as u32 & COLOR_MASK) << COLOR_SHIFT;
    meta
}

/// Foreground palette index from packed metadata (0 = default foreground)
pub fn metadata_color_index(meta: u32) -> u16 {
    ((meta >> COLOR_SHIFT) & COLOR_MASK) as u16
}

/// Font style bits from packed metadata
pub fn metadata_style(meta: u32) -> u32 {
    (meta >> STYLE_SHIFT) & STYLE_MASK
}

/// Encoded language id from packed metadata
pub fn metadata_language(meta: u32) -> u8 {
    (meta & LANGUAGE_MASK) as u8
}

/// Bracket flag from packed metadata
pub fn metadata_has_bracket(meta: u32) -> bool {
    meta & BRACKET_BIT != 0
}

/// Raw scope style as parsed from YAML
#[derive(Debug, Clone, Deserialize)]
struct ScopeStyleData {
    color: String,
    #[serde(default)]
    bold: bool,
    #[serde(default)]
    italic: bool,
    #[serde(default)]
    underline: bool,
}

/// Raw theme data as parsed from YAML
#[derive(Debug, Clone, Deserialize)]
struct ThemeData {
    #[allow(dead_code)]
    version: u32,
    name: String,
    foreground: String,
    scopes: HashMap<String, ScopeStyleData>,
}

/// A resolved scope style: palette index plus font style bits
#[derive(Debug, Clone, Copy)]
struct ScopeStyle {
    color_index: u16,
    style: u32,
}

/// Resolved theme: scope table plus foreground palette.
///
/// Palette index 0 is always the theme's default foreground; filler tokens
/// (metadata 0) therefore render correctly without special-casing.
#[derive(Debug, Clone)]
pub struct Theme {
    pub name: String,
    palette: Vec<Color>,
    scopes: HashMap<String, ScopeStyle>,
}

impl Theme {
    /// Parse a theme from YAML content
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        let data: ThemeData =
            serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse theme: {}", e))?;

        let mut palette = vec![Color::from_hex(&data.foreground)?];
        let mut scopes = HashMap::new();

        // Deterministic palette order so equal themes produce equal metadata
        let mut entries: Vec<_> = data.scopes.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (scope, raw) in entries {
            let color = Color::from_hex(&raw.color)?;
            let color_index = match palette.iter().position(|&c| c == color) {
                Some(i) => i as u16,
                None => {
                    palette.push(color);
                    (palette.len() - 1) as u16
                }
            };
            let mut style = 0;
            if raw.bold {
                style |= STYLE_BOLD;
            }
            if raw.italic {
                style |= STYLE_ITALIC;
            }
            if raw.underline {
                style |= STYLE_UNDERLINE;
            }
            scopes.insert(scope, ScopeStyle { color_index, style });
        }

        Ok(Self {
            name: data.name,
            palette,
            scopes,
        })
    }

    /// Load a built-in theme by id
    pub fn from_builtin(id: &str) -> Result<Self, String> {
        BUILTIN_THEMES
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| format!("Unknown builtin theme: {}", id))
            .and_then(|t| Self::from_yaml(t.yaml))
    }

    /// Load a theme from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read theme file {}: {}", path.display(), e))?;
        Self::from_yaml(&content)
    }

    /// The default dark theme (embedded; parse is covered by tests)
    pub fn default_dark() -> Self {
        Self::from_yaml(DEFAULT_DARK_YAML).expect("embedded dark theme must parse")
    }

    /// Look up the style for a single scope with hierarchy fallback:
    /// "keyword.control.import" falls back to "keyword.control", then
    /// "keyword".
    fn resolve_scope(&self, name: &str) -> Option<ScopeStyle> {
        let mut current = name;
        loop {
            if let Some(style) = self.scopes.get(current) {
                return Some(*style);
            }
            let Some(dot_pos) = current.rfind('.') else {
                break;
            };
            current = &current[..dot_pos];
        }
        None
    }

    /// Resolve a token's scope list into packed metadata.
    ///
    /// The last scope in the list that resolves wins: scopes are appended
    /// in capture order, so later (more specific) captures override earlier
    /// ones. An unresolvable list packs palette index 0 (default
    /// foreground) but still carries language and bracket bits.
    pub fn find_metadata(&self, scopes: &[&str], language: LanguageId, has_bracket: bool) -> u32 {
        let resolved = scopes.iter().rev().find_map(|s| self.resolve_scope(s));
        match resolved {
            Some(style) => pack_metadata(style.color_index, style.style, language, has_bracket),
            None => pack_metadata(0, 0, language, has_bracket),
        }
    }

    /// Foreground color for a palette index (out of range falls back to
    /// the default foreground)
    pub fn color(&self, index: u16) -> Color {
        self.palette
            .get(index as usize)
            .copied()
            .unwrap_or(self.palette[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_from_hex_6() {
        let color = Color::from_hex("#1E1E1E").unwrap();
        assert_eq!(color.r, 0x1E);
        assert_eq!(color.a, 255);
    }

    #[test]
    fn test_color_from_hex_8() {
        let color = Color::from_hex("#1E1E1E80").unwrap();
        assert_eq!(color.a, 0x80);
    }

    #[test]
    fn test_color_from_hex_invalid() {
        assert!(Color::from_hex("#12").is_err());
        assert!(Color::from_hex("#GGGGGG").is_err());
    }

    #[test]
    fn test_builtin_themes_parse() {
        for builtin in BUILTIN_THEMES {
            let theme = Theme::from_yaml(builtin.yaml);
            assert!(
                theme.is_ok(),
                "builtin theme {} failed: {:?}",
                builtin.id,
                theme.err()
            );
        }
    }

    #[test]
    fn test_metadata_round_trip() {
        let meta = pack_metadata(42, STYLE_BOLD | STYLE_ITALIC, LanguageId::Rust, true);
        assert_eq!(metadata_color_index(meta), 42);
        assert_eq!(metadata_style(meta), STYLE_BOLD | STYLE_ITALIC);
        assert_eq!(metadata_language(meta), LanguageId::Rust.encoded());
        assert!(metadata_has_bracket(meta));

        let plain = pack_metadata(0, 0, LanguageId::PlainText, false);
        assert_eq!(plain, 0);
    }

    #[test]
    fn test_scope_hierarchy_fallback() {
        let theme = Theme::default_dark();
        let exact = theme.find_metadata(&["keyword"], LanguageId::Rust, false);
        let nested = theme.find_metadata(&["keyword.control.import"], LanguageId::Rust, false);
        assert_eq!(metadata_color_index(exact), metadata_color_index(nested));
    }

    #[test]
    fn test_last_resolving_scope_wins() {
        let theme = Theme::default_dark();
        let meta = theme.find_metadata(&["keyword", "string"], LanguageId::Rust, false);
        let string_meta = theme.find_metadata(&["string"], LanguageId::Rust, false);
        assert_eq!(metadata_color_index(meta), metadata_color_index(string_meta));
    }

    #[test]
    fn test_unknown_scope_uses_default_foreground() {
        let theme = Theme::default_dark();
        let meta = theme.find_metadata(&["zalgo.nonsense"], LanguageId::Json, false);
        assert_eq!(metadata_color_index(meta), 0);
        assert_eq!(metadata_language(meta), LanguageId::Json.encoded());
    }
}
