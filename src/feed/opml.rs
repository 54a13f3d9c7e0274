use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use super::types::FeedSource;
use crate::util::validate_url;

/// Maximum outline nesting. Deeper documents are rejected outright.
const MAX_OPML_DEPTH: usize = 50;

#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),
}

/// Reads an OPML subscription list into feed sources.
///
/// Each outline carrying `xmlUrl` becomes a [`FeedSource`]. The title of the
/// nearest enclosing folder outline becomes its `category_id`. Two custom
/// attributes are honored: `hideFromAll="true"` and `active="false"`.
///
/// Outlines whose URL fails [`validate_url`] (non-HTTP schemes, localhost,
/// private ranges) are skipped with a warning.
///
/// # Security
///
/// `quick-xml` 0.37 never expands `<!ENTITY>` declarations; custom entity
/// references fail to unescape. The version is pinned in `Cargo.toml` for
/// that reason.
pub async fn parse_sources(path: &str) -> Result<Vec<FeedSource>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read OPML file: {}", path))?;
    parse_opml_content(&content)
}

/// One open `<outline>` element: a folder title, or `None` for a feed
/// outline that happens to have children.
type OpenOutline = Option<String>;

pub(crate) fn parse_opml_content(content: &str) -> Result<Vec<FeedSource>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut sources = Vec::new();
    let mut open: Vec<OpenOutline> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                if open.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH).into());
                }
                let outline = read_outline(&e, &reader)?;
                let folder = if outline.xml_url.is_some() {
                    None
                } else {
                    outline.title.clone()
                };
                if let Some(source) = outline.into_source(current_category(&open)) {
                    sources.push(source);
                }
                open.push(folder);
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                let outline = read_outline(&e, &reader)?;
                if let Some(source) = outline.into_source(current_category(&open)) {
                    sources.push(source);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                open.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string()).into()),
            _ => {}
        }
        buf.clear();
    }

    tracing::debug!(sources = sources.len(), "Parsed OPML");
    Ok(sources)
}

fn current_category(open: &[OpenOutline]) -> Option<&str> {
    open.iter().rev().find_map(|o| o.as_deref())
}

#[derive(Default)]
struct Outline {
    xml_url: Option<String>,
    title: Option<String>,
    category: Option<String>,
    hide_from_all: bool,
    active: bool,
}

impl Outline {
    fn into_source(self, folder: Option<&str>) -> Option<FeedSource> {
        let url = self.xml_url?;
        if let Err(e) = validate_url(&url) {
            tracing::warn!(url = %url, error = %e, "Skipping invalid feed URL");
            return None;
        }

        Some(FeedSource {
            url,
            category_id: self.category.or_else(|| folder.map(str::to_owned)),
            custom_title: self.title,
            active: self.active,
            hide_from_all: self.hide_from_all,
        })
    }
}

fn read_outline(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Outline> {
    let mut outline = Outline {
        active: true,
        ..Outline::default()
    };
    let mut text = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = || attr.decode_and_unescape_value(reader.decoder());
        match attr.key.as_ref() {
            b"xmlUrl" => outline.xml_url = Some(value()?.trim().to_string()),
            b"title" => outline.title = Some(value()?.to_string()),
            b"text" => text = Some(value()?.to_string()),
            b"category" => outline.category = Some(value()?.to_string()),
            b"hideFromAll" => outline.hide_from_all = value()?.eq_ignore_ascii_case("true"),
            b"active" => outline.active = !value()?.eq_ignore_ascii_case("false"),
            _ => {}
        }
    }

    outline.title = outline.title.or(text).filter(|t| !t.trim().is_empty());
    Ok(outline)
}
