use feed_rs::parser;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::types::{FeedItem, ParsedFeed};
use crate::util::strip_control_chars;

/// Content the parser refused. Treated like a network failure for retry
/// purposes, with the reason kept for diagnostics.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Malicious content: {0}")]
    Malicious(String),

    #[error("Malformed feed: {0}")]
    Malformed(String),
}

/// Turns raw feed text into items, or refuses it.
pub trait SecureParser: Send + Sync {
    fn parse(&self, raw: &str, source_url: &str) -> Result<ParsedFeed, ParseError>;
}

/// Default parser built on `feed-rs`. Accepts RSS 0.9x/1.0/2.0 and Atom.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedRsParser;

/// Declarations that enable entity expansion. Feeds never need them.
const FORBIDDEN_DECLARATIONS: [&str; 2] = ["<!doctype", "<!entity"];

impl SecureParser for FeedRsParser {
    fn parse(&self, raw: &str, source_url: &str) -> Result<ParsedFeed, ParseError> {
        if let Some(decl) = find_forbidden_declaration(raw) {
            tracing::warn!(url = %source_url, declaration = decl, "Rejected feed with DTD declaration");
            return Err(ParseError::Malicious(format!(
                "document contains {} declaration",
                decl.to_uppercase()
            )));
        }

        let feed = parser::parse(raw.as_bytes()).map_err(|e| ParseError::Malformed(e.to_string()))?;

        let title = feed
            .title
            .map(|t| strip_control_chars(t.content.trim()).into_owned())
            .filter(|t| !t.is_empty());

        let items: Vec<FeedItem> = feed
            .entries
            .into_iter()
            .map(|entry| {
                let link = entry
                    .links
                    .first()
                    .map(|l| strip_control_chars(l.href.trim()).into_owned());
                let title = entry
                    .title
                    .map(|t| strip_control_chars(t.content.trim()).into_owned())
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "Untitled".to_string());
                let summary = entry
                    .summary
                    .map(|s| s.content)
                    .or_else(|| entry.content.and_then(|c| c.body))
                    .map(|s| strip_control_chars(&s).into_owned());
                let published = entry.published.or(entry.updated);
                let id = article_identity(&entry.id, link.as_deref(), &title);

                FeedItem {
                    id,
                    title,
                    link,
                    published,
                    summary,
                }
            })
            .collect();

        tracing::trace!(url = %source_url, items = items.len(), "Feed parsed");
        Ok(ParsedFeed { title, items })
    }
}

/// Scans the prolog (everything before the root element) for a DTD.
///
/// Processing instructions and comments are skipped. Markup after the root
/// element starts is never inspected, so HTML inside CDATA content is fine.
fn find_forbidden_declaration(raw: &str) -> Option<&'static str> {
    let mut rest = raw.trim_start_matches('\u{feff}');
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("<?") {
            rest = after.split_once("?>")?.1;
        } else if let Some(after) = rest.strip_prefix("<!--") {
            rest = after.split_once("-->")?.1;
        } else if rest.starts_with("<!") {
            let head = rest.get(..9).unwrap_or(rest).to_ascii_lowercase();
            return FORBIDDEN_DECLARATIONS
                .into_iter()
                .find(|decl| head.starts_with(decl));
        } else {
            return None;
        }
    }
}

/// The feed's guid when present, else `sha256(link|title)`.
pub(crate) fn article_identity(guid: &str, link: Option<&str>, title: &str) -> String {
    let trimmed = guid.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }

    let input = format!("{}|{}", link.unwrap_or(""), title);
    format!("{:x}", Sha256::digest(input.as_bytes()))
}
