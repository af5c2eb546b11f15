//! Kodi/Jellyfin `.nfo` sidecar files.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use html_escape::encode_text;

const MAX_GENRES: usize = 5;
const OUTLINE_CHARS: usize = 100;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NfoActor {
    pub name: String,
    /// Path of the saved avatar, when there is one.
    pub thumb: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NfoDocument {
    pub id: String,
    pub title: String,
    pub plot: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub runtime_minutes: Option<u32>,
    pub genres: Vec<String>,
    pub actors: Vec<NfoActor>,
    pub poster: Option<String>,
    pub fanart: Vec<String>,
    pub source_url: Option<String>,
}

impl NfoDocument {
    pub fn render(&self, added: NaiveDateTime) -> String {
        let title = if self.title.trim().is_empty() {
            self.id.as_str()
        } else {
            self.title.trim()
        };

        let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<movie>\n");
        push_element(&mut out, 1, "title", title);
        push_element(&mut out, 1, "originaltitle", &self.id);
        if let Some(plot) = self.plot.as_deref().map(str::trim).filter(|plot| !plot.is_empty()) {
            push_element(&mut out, 1, "plot", plot);
            push_element(&mut out, 1, "outline", &outline(plot));
        }
        if let Some(date) = self.release_date {
            let date = date.format("%Y-%m-%d").to_string();
            push_element(&mut out, 1, "premiered", &date);
            push_element(&mut out, 1, "releasedate", &date);
        }
        if let Some(minutes) = self.runtime_minutes {
            push_element(&mut out, 1, "runtime", &minutes.to_string());
        }
        out.push_str(&format!(
            "  <uniqueid type=\"plate\" default=\"true\">{}</uniqueid>\n",
            encode_text(&self.id)
        ));
        push_element(
            &mut out,
            1,
            "dateadded",
            &added.format("%Y-%m-%d %H:%M:%S").to_string(),
        );
        if let Some(url) = &self.source_url {
            push_element(&mut out, 1, "trailer", url);
        }
        if self.poster.is_some() || !self.fanart.is_empty() {
            out.push_str("  <art>\n");
            if let Some(poster) = &self.poster {
                push_element(&mut out, 2, "poster", poster);
            }
            for fanart in &self.fanart {
                push_element(&mut out, 2, "fanart", fanart);
            }
            out.push_str("  </art>\n");
        }
        for actor in &self.actors {
            out.push_str("  <actor>\n");
            push_element(&mut out, 2, "name", &actor.name);
            if let Some(thumb) = &actor.thumb {
                push_element(&mut out, 2, "thumb", thumb);
            }
            out.push_str("  </actor>\n");
        }
        for genre in self.genres.iter().take(MAX_GENRES) {
            push_element(&mut out, 1, "genre", genre);
        }
        out.push_str("</movie>\n");
        out
    }

    pub fn write(&self, path: &Path, added: NaiveDateTime) -> Result<()> {
        fs::write(path, self.render(added)).with_context(|| format!("writing {}", path.display()))
    }
}

fn outline(plot: &str) -> String {
    match plot.char_indices().nth(OUTLINE_CHARS) {
        Some((end, _)) => format!("{}...", &plot[..end]),
        None => plot.to_string(),
    }
}

fn push_element(out: &mut String, depth: usize, tag: &str, text: &str) {
    out.push_str(&"  ".repeat(depth));
    out.push_str(&format!("<{tag}>{}</{tag}>\n", encode_text(text)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn added() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap()
    }

    #[test]
    fn render_escapes_text_and_lists_art() {
        let doc = NfoDocument {
            id: "ABC-123".into(),
            title: "Cats & <Dogs>".into(),
            poster: Some("ABC-123-poster.jpg".into()),
            fanart: vec!["ABC-123-fanart-1.jpg".into(), "ABC-123-fanart-2.jpg".into()],
            ..NfoDocument::default()
        };
        let xml = doc.render(added());
        assert!(xml.contains("<title>Cats &amp; &lt;Dogs&gt;</title>"));
        assert!(xml.contains("<uniqueid type=\"plate\" default=\"true\">ABC-123</uniqueid>"));
        assert!(xml.contains("<dateadded>2024-05-01 12:30:00</dateadded>"));
        assert!(xml.contains("    <poster>ABC-123-poster.jpg</poster>"));
        assert_eq!(xml.matches("<fanart>").count(), 2);
        assert!(!xml.contains("<trailer>"));
    }

    #[test]
    fn render_falls_back_to_identifier_title_without_art() {
        let doc = NfoDocument {
            id: "XYZ-9".into(),
            ..NfoDocument::default()
        };
        let xml = doc.render(added());
        assert!(xml.contains("<title>XYZ-9</title>"));
        assert!(!xml.contains("<art>"));
        assert!(!xml.contains("<plot>"));
        assert!(!xml.contains("<runtime>"));
    }

    #[test]
    fn render_includes_scraped_metadata() {
        let doc = NfoDocument {
            id: "ABC-123".into(),
            title: "Evening Walk".into(),
            plot: Some("x".repeat(150)),
            release_date: NaiveDate::from_ymd_opt(2023, 11, 2),
            runtime_minutes: Some(120),
            genres: (1..=7).map(|n| format!("tag{n}")).collect(),
            actors: vec![
                NfoActor {
                    name: "Aiko".into(),
                    thumb: Some("/data/thumb/Aiko.jpg".into()),
                },
                NfoActor {
                    name: "Mei".into(),
                    thumb: None,
                },
            ],
            ..NfoDocument::default()
        };
        let xml = doc.render(added());
        assert!(xml.contains(&format!("<plot>{}</plot>", "x".repeat(150))));
        assert!(xml.contains(&format!("<outline>{}...</outline>", "x".repeat(100))));
        assert!(xml.contains("<premiered>2023-11-02</premiered>"));
        assert!(xml.contains("<releasedate>2023-11-02</releasedate>"));
        assert!(xml.contains("<runtime>120</runtime>"));
        assert_eq!(xml.matches("<genre>").count(), 5);
        assert!(xml.contains("<genre>tag5</genre>"));
        assert!(!xml.contains("<genre>tag6</genre>"));
        assert_eq!(xml.matches("<actor>").count(), 2);
        assert!(xml.contains("    <thumb>/data/thumb/Aiko.jpg</thumb>"));
        assert!(xml.contains("    <name>Mei</name>"));
    }

    #[test]
    fn short_plot_outline_is_untouched() {
        assert_eq!(outline("short plot"), "short plot");
    }
}
