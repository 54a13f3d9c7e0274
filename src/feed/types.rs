use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category id that selects every source.
pub const ALL_CATEGORY: &str = "all";

/// One subscribed feed. Owned by the caller; the loader only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    pub url: String,
    pub category_id: Option<String>,
    /// Overrides the feed's own title on loaded articles.
    pub custom_title: Option<String>,
    pub active: bool,
    /// Keep this source out of the "all" view.
    pub hide_from_all: bool,
}

impl FeedSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            category_id: None,
            custom_title: None,
            active: true,
            hide_from_all: false,
        }
    }

    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        self.category_id = Some(category_id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.custom_title = Some(title.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn hidden_from_all(mut self) -> Self {
        self.hide_from_all = true;
        self
    }

    /// Whether this source belongs to the priority group for `category`.
    ///
    /// `None` and `"all"` select every source not hidden from the "all" view.
    pub fn matches_category(&self, category: Option<&str>) -> bool {
        match category {
            None | Some(ALL_CATEGORY) => !self.hide_from_all,
            Some(id) => self.category_id.as_deref() == Some(id),
        }
    }
}

/// An item produced by the secure parser, before source metadata is attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    /// Stable identity: the feed's guid, else a hash of link and title.
    pub id: String,
    pub title: String,
    pub link: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}

/// Parser output for one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub items: Vec<FeedItem>,
}

/// A merged article as published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub title: String,
    pub link: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub source_url: String,
    /// The source's custom title, else the feed's own title.
    pub source_title: Option<String>,
    pub category_id: Option<String>,
}

impl Article {
    /// Dedup key: link plus title, or the source-scoped id for link-less items.
    pub fn identity(&self) -> String {
        match &self.link {
            Some(link) => format!("{link}|{}", self.title),
            None => format!("{}#{}", self.source_url, self.id),
        }
    }

    pub(crate) fn from_item(item: FeedItem, source: &FeedSource, feed_title: Option<&str>) -> Self {
        Self {
            id: item.id,
            title: item.title,
            link: item.link,
            published: item.published,
            summary: item.summary,
            source_url: source.url.clone(),
            source_title: source
                .custom_title
                .clone()
                .or_else(|| feed_title.map(str::to_owned)),
            category_id: source.category_id.clone(),
        }
    }
}
