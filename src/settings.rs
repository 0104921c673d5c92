//! Reader display settings injected into content documents
//!
//! Settings are shared between the caller and the fetcher through
//! [`SharedSettings`]; the inject stage takes a snapshot at every read, so a
//! change is visible on the next read without parsing the publication again.

use std::sync::{Arc, RwLock};

use quick_xml::escape::escape;

/// Settings shared with the fetcher
pub type SharedSettings = Arc<RwLock<UserSettings>>;

/// Color theme of the reading surface
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Appearance {
    #[default]
    Default,
    Sepia,
    Night,
}

impl Appearance {
    fn css_value(&self) -> &'static str {
        match self {
            Appearance::Default => "readium-default-on",
            Appearance::Sepia => "readium-sepia-on",
            Appearance::Night => "readium-night-on",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TextAlign {
    #[default]
    Justify,
    Start,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ColumnCount {
    #[default]
    Auto,
    One,
    Two,
}

/// Display preferences of the reader
#[derive(Debug, Clone, PartialEq)]
pub struct UserSettings {
    pub appearance: Appearance,

    /// Font size, in percent of the default size
    pub font_size: u32,

    /// Font family, `Original` keeps the publisher's fonts
    pub font_family: String,

    /// Keeps the publisher's typography, the advanced settings below are ignored when set
    pub publisher_default: bool,

    pub text_align: TextAlign,

    pub column_count: ColumnCount,

    /// Word spacing, in rem
    pub word_spacing: f32,

    /// Letter spacing, in em
    pub letter_spacing: f32,

    /// Page margins factor
    pub page_margins: f32,

    /// Line height factor
    pub line_height: f32,

    /// Continuous scroll instead of pagination
    pub scroll: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            appearance: Appearance::Default,
            font_size: 100,
            font_family: "Original".to_string(),
            publisher_default: true,
            text_align: TextAlign::Justify,
            column_count: ColumnCount::Auto,
            word_spacing: 0.0,
            letter_spacing: 0.0,
            page_margins: 1.0,
            line_height: 1.0,
            scroll: false,
        }
    }
}

impl UserSettings {
    /// The ReadiumCSS user properties matching these settings, in declaration order
    pub fn css_properties(&self) -> Vec<(&'static str, String)> {
        let font_override = self.font_family != "Original";

        vec![
            ("--USER__appearance", self.appearance.css_value().to_string()),
            ("--USER__fontSize", format!("{}%", self.font_size)),
            ("--USER__fontFamily", self.font_family.clone()),
            (
                "--USER__fontOverride",
                if font_override { "readium-font-on" } else { "readium-font-off" }.to_string(),
            ),
            (
                "--USER__advancedSettings",
                if self.publisher_default { "readium-advanced-off" } else { "readium-advanced-on" }
                    .to_string(),
            ),
            (
                "--USER__textAlign",
                match self.text_align {
                    TextAlign::Justify => "justify",
                    TextAlign::Start => "start",
                }
                .to_string(),
            ),
            (
                "--USER__colCount",
                match self.column_count {
                    ColumnCount::Auto => "auto",
                    ColumnCount::One => "1",
                    ColumnCount::Two => "2",
                }
                .to_string(),
            ),
            ("--USER__wordSpacing", format!("{}rem", self.word_spacing)),
            ("--USER__letterSpacing", format!("{}em", self.letter_spacing)),
            ("--USER__pageMargins", self.page_margins.to_string()),
            ("--USER__lineHeight", self.line_height.to_string()),
            (
                "--USER__view",
                if self.scroll { "readium-scroll-on" } else { "readium-scroll-off" }.to_string(),
            ),
        ]
    }

    /// The properties as the value of a `style` attribute
    ///
    /// Values are escaped, the result can be placed between quotes as is.
    pub fn to_style_attribute(&self) -> String {
        self.css_properties()
            .iter()
            .map(|(name, value)| format!("{}: {};", name, escape(value.as_str())))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use crate::settings::{Appearance, UserSettings};

    #[test]
    fn test_default_style_attribute() {
        let style = UserSettings::default().to_style_attribute();
        assert!(style.starts_with("--USER__appearance: readium-default-on;"));
        assert!(style.contains("--USER__fontSize: 100%;"));
        assert!(style.contains("--USER__fontOverride: readium-font-off;"));
        assert!(style.contains("--USER__advancedSettings: readium-advanced-off;"));
        assert!(style.ends_with("--USER__view: readium-scroll-off;"));
    }

    #[test]
    fn test_customized_properties() {
        let settings = UserSettings {
            appearance: Appearance::Night,
            font_size: 150,
            font_family: "OpenDyslexic".to_string(),
            publisher_default: false,
            word_spacing: 0.25,
            scroll: true,
            ..Default::default()
        };

        let properties = settings.css_properties();
        let value = |name: &str| {
            properties
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.as_str())
                .unwrap()
        };

        assert_eq!(value("--USER__appearance"), "readium-night-on");
        assert_eq!(value("--USER__fontSize"), "150%");
        assert_eq!(value("--USER__fontOverride"), "readium-font-on");
        assert_eq!(value("--USER__advancedSettings"), "readium-advanced-on");
        assert_eq!(value("--USER__wordSpacing"), "0.25rem");
        assert_eq!(value("--USER__view"), "readium-scroll-on");
    }

    /// Quotes and markup characters in a value never leave the attribute
    #[test]
    fn test_style_attribute_escapes_values() {
        let settings = UserSettings {
            font_family: "\"Open Dyslexic\", serif & <mono>".to_string(),
            ..Default::default()
        };

        let style = settings.to_style_attribute();
        assert!(style.contains(
            "--USER__fontFamily: &quot;Open Dyslexic&quot;, serif &amp; &lt;mono&gt;;"
        ));
        assert!(!style.contains('"'));
        assert!(!style.contains('<'));
    }
}
