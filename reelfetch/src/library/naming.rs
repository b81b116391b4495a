//! Library path naming.

use serde::{Deserialize, Serialize};

use crate::media::MediaInfo;
use crate::utils::filename::sanitize_component;

/// Maps a media descriptor onto library path components.
///
/// Each method returns a single, already sanitized path component. The
/// result must be deterministic for the same input.
pub trait PathNamer: Send + Sync {
    /// Show folder, relative to the library root.
    fn show_path(&self, media: &MediaInfo) -> String;

    /// Season folder, relative to the show folder.
    fn season_path(&self, media: &MediaInfo) -> String;

    /// Media file name without extension.
    fn file_name(&self, media: &MediaInfo) -> String;
}

/// Templates used by [`TemplateNamer`].
///
/// Placeholders: `{show}`, `{season}`, `{episode}` (both zero-padded to two
/// digits), `{title}`, `{aired}` (`YYYY-MM-DD`, empty when unknown), `{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    pub show_template: String,
    pub season_template: String,
    pub episode_template: String,
    /// File name for bonus material and season 0.
    pub bonus_template: String,
    /// Season folder for bonus material and season 0.
    pub specials_folder: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            show_template: "{show}".to_string(),
            season_template: "Season {season}".to_string(),
            episode_template: "{show} - S{season}E{episode} - {title}".to_string(),
            bonus_template: "{show} - {title}".to_string(),
            specials_folder: "Specials".to_string(),
        }
    }
}

/// Template-driven [`PathNamer`].
#[derive(Debug, Clone, Default)]
pub struct TemplateNamer {
    config: NamingConfig,
}

impl TemplateNamer {
    pub fn new(config: NamingConfig) -> Self {
        Self { config }
    }

    fn is_special(media: &MediaInfo) -> bool {
        media.is_bonus || media.season == 0
    }

    /// Expand `template`, sanitizing every substituted value and then the
    /// whole result. Unknown placeholders are kept verbatim.
    fn expand(template: &str, media: &MediaInfo) -> String {
        let mut out = String::with_capacity(template.len() + 32);
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                out.push_str(&rest[open..]);
                rest = "";
                break;
            };
            let key = &after[..close];
            match Self::placeholder(key, media) {
                Some(value) => out.push_str(&value),
                None => {
                    out.push('{');
                    out.push_str(key);
                    out.push('}');
                }
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        sanitize_component(&out)
    }

    fn placeholder(key: &str, media: &MediaInfo) -> Option<String> {
        let value = match key {
            "show" => sanitize_component(&media.show),
            "title" => sanitize_component(&media.title),
            "id" => sanitize_component(&media.id),
            "season" => format!("{:02}", media.season),
            "episode" => format!("{:02}", media.episode),
            "aired" => media
                .aired
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            _ => return None,
        };
        Some(value)
    }
}

impl PathNamer for TemplateNamer {
    fn show_path(&self, media: &MediaInfo) -> String {
        Self::expand(&self.config.show_template, media)
    }

    fn season_path(&self, media: &MediaInfo) -> String {
        if Self::is_special(media) {
            sanitize_component(&self.config.specials_folder)
        } else {
            Self::expand(&self.config.season_template, media)
        }
    }

    fn file_name(&self, media: &MediaInfo) -> String {
        let template = if Self::is_special(media) {
            &self.config.bonus_template
        } else {
            &self.config.episode_template
        };
        Self::expand(template, media)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn episode() -> MediaInfo {
        MediaInfo {
            id: "ep-42".into(),
            show: "Doctor Who?".into(),
            season: 3,
            episode: 7,
            title: "Blink".into(),
            aired: NaiveDate::from_ymd_opt(2007, 6, 9),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_templates() {
        let namer = TemplateNamer::default();
        let media = episode();
        assert_eq!(namer.show_path(&media), "Doctor Who_");
        assert_eq!(namer.season_path(&media), "Season 03");
        assert_eq!(namer.file_name(&media), "Doctor Who_ - S03E07 - Blink");
    }

    #[test]
    fn test_bonus_goes_to_specials() {
        let namer = TemplateNamer::default();
        let media = MediaInfo {
            is_bonus: true,
            title: "Behind the scenes".into(),
            ..episode()
        };
        assert_eq!(namer.season_path(&media), "Specials");
        assert_eq!(namer.file_name(&media), "Doctor Who_ - Behind the scenes");

        let season_zero = MediaInfo {
            season: 0,
            ..episode()
        };
        assert_eq!(namer.season_path(&season_zero), "Specials");
    }

    #[test]
    fn test_custom_template_with_date_and_unknown_key() {
        let namer = TemplateNamer::new(NamingConfig {
            episode_template: "{aired} {title} [{id}] {quality}".into(),
            ..Default::default()
        });
        assert_eq!(namer.file_name(&episode()), "2007-06-09 Blink [ep-42] {quality}");
    }

    #[test]
    fn test_separators_cannot_escape_component() {
        let namer = TemplateNamer::new(NamingConfig {
            show_template: "{show}/../{title}".into(),
            ..Default::default()
        });
        let path = namer.show_path(&episode());
        assert!(!path.contains('/'));
        assert!(!path.contains('\\'));
    }

    #[test]
    fn test_empty_title_yields_empty_component() {
        let namer = TemplateNamer::new(NamingConfig {
            show_template: "{title}".into(),
            ..Default::default()
        });
        let media = MediaInfo {
            title: "???".into(),
            ..episode()
        };
        // A lone replacement char survives; an all-dot title does not.
        assert_eq!(namer.show_path(&media), "_");
        let dots = MediaInfo {
            title: "...".into(),
            ..episode()
        };
        assert_eq!(namer.show_path(&dots), "");
    }

    #[test]
    fn test_deterministic() {
        let namer = TemplateNamer::default();
        let media = episode();
        assert_eq!(namer.file_name(&media), namer.file_name(&media));
    }
}
