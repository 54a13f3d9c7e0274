use url::Url;

const FEED_TYPES: [&str; 2] = ["application/rss+xml", "application/atom+xml"];

/// Collects RSS/Atom alternate links advertised by an HTML page.
///
/// Scans `<link>` tags with plain string matching, accepting any attribute
/// order and either quote style. Hrefs are resolved against `base_url` and
/// returned in document order without duplicates. Hrefs that do not resolve
/// are dropped.
pub fn find_feed_links(html: &str, base_url: &str) -> Vec<String> {
    let base = Url::parse(base_url).ok();
    let lower = html.to_ascii_lowercase();
    let mut links: Vec<String> = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = lower[cursor..].find("<link") {
        let start = cursor + offset;
        let Some(len) = lower[start..].find('>') else {
            break;
        };
        let end = start + len + 1;
        cursor = end;

        let tag_lower = &lower[start..end];
        if !is_alternate_feed(tag_lower) {
            continue;
        }

        // Lowercasing ASCII preserves byte offsets, so slice the original for case
        let Some(href) = attr_value(&html[start..end], tag_lower, "href") else {
            continue;
        };
        let Some(resolved) = resolve(href.trim(), base.as_ref()) else {
            tracing::debug!(href = %href, "Unresolvable feed link");
            continue;
        };
        if !links.contains(&resolved) {
            links.push(resolved);
        }
    }

    links
}

fn is_alternate_feed(tag_lower: &str) -> bool {
    let alternate = attr_value(tag_lower, tag_lower, "rel")
        .is_some_and(|rel| rel.split_ascii_whitespace().any(|r| r == "alternate"));
    let feed_type = attr_value(tag_lower, tag_lower, "type")
        .is_some_and(|t| FEED_TYPES.contains(&t.trim()));
    alternate && feed_type
}

/// Quoted value of `name` in `tag`, located via its lowercased twin.
fn attr_value<'a>(tag: &'a str, tag_lower: &str, name: &str) -> Option<&'a str> {
    let needle = format!("{name}=");
    let mut from = 0;
    loop {
        let pos = from + tag_lower[from..].find(&needle)?;
        from = pos + needle.len();
        // Require a word boundary so "data-href=" does not match "href="
        let boundary = tag_lower[..pos]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_whitespace());
        if !boundary {
            continue;
        }

        let rest = &tag[from..];
        let quote = rest.chars().next()?;
        if quote != '"' && quote != '\'' {
            return None;
        }
        let inner = &rest[1..];
        let close = inner.find(quote)?;
        return Some(&inner[..close]);
    }
}

fn resolve(href: &str, base: Option<&Url>) -> Option<String> {
    let url = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}
