use strato_core::provider::{ListEntry, format_swift_time};

/// Output format negotiated from the request's Accept header (and the
/// `format` query parameter, which wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingFormat {
    Json,
    Xml,
    Plain,
}

impl ListingFormat {
    pub fn negotiate(format_param: Option<&str>, accept: Option<&str>) -> Self {
        match format_param {
            Some("json") => return ListingFormat::Json,
            Some("xml") => return ListingFormat::Xml,
            Some("plain") => return ListingFormat::Plain,
            _ => {}
        }
        match accept {
            Some(accept) if accept.contains("application/json") => ListingFormat::Json,
            Some(accept) if accept.contains("/xml") => ListingFormat::Xml,
            _ => ListingFormat::Plain,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ListingFormat::Json => "application/json; charset=utf-8",
            ListingFormat::Xml => "application/xml; charset=utf-8",
            ListingFormat::Plain => "text/plain; charset=utf-8",
        }
    }
}

/// Merge-sorts a local and a remote listing by name. On a name collision
/// the local entry wins and loses its remote marker; entries present only
/// remotely keep their `content_location`.
pub fn merge_listings(
    local: Vec<ListEntry>,
    remote: Vec<ListEntry>,
    limit: usize,
) -> Vec<ListEntry> {
    let mut merged = Vec::with_capacity(local.len() + remote.len());
    let mut local_iter = local.into_iter().peekable();
    let mut remote_iter = remote.into_iter().peekable();

    while merged.len() < limit {
        match (local_iter.peek(), remote_iter.peek()) {
            (Some(local_entry), Some(remote_entry)) => {
                if local_entry.name <= remote_entry.name {
                    if local_entry.name == remote_entry.name {
                        remote_iter.next();
                    }
                    let mut entry = local_iter.next().expect("peeked");
                    entry.content_location = String::new();
                    merged.push(entry);
                } else {
                    merged.push(remote_iter.next().expect("peeked"));
                }
            }
            (Some(_), None) => {
                let mut entry = local_iter.next().expect("peeked");
                entry.content_location = String::new();
                merged.push(entry);
            }
            (None, Some(_)) => merged.push(remote_iter.next().expect("peeked")),
            (None, None) => break,
        }
    }
    merged
}

pub fn render_listing(container: &str, entries: &[ListEntry], format: ListingFormat) -> String {
    match format {
        ListingFormat::Json => render_json(entries),
        ListingFormat::Xml => render_xml(container, entries),
        ListingFormat::Plain => {
            let mut out = String::new();
            for entry in entries {
                out.push_str(&entry.name);
                out.push('\n');
            }
            out
        }
    }
}

fn render_json(entries: &[ListEntry]) -> String {
    let values: Vec<serde_json::Value> = entries
        .iter()
        .map(|entry| {
            if entry.subdir {
                return serde_json::json!({ "subdir": entry.name });
            }
            let mut value = serde_json::json!({
                "name": entry.name,
                "hash": entry.etag,
                "bytes": entry.size_bytes,
                "last_modified": format_swift_time(entry.last_modified),
                "content_type": entry
                    .content_type
                    .as_deref()
                    .unwrap_or("application/octet-stream"),
            });
            if !entry.content_location.is_empty() {
                value["content_location"] =
                    serde_json::json!([entry.content_location.clone()]);
            }
            value
        })
        .collect();
    serde_json::to_string(&values).expect("listing serializes")
}

fn render_xml(container: &str, entries: &[ListEntry]) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<container name=\"");
    xml.push_str(&xml_escape(container));
    xml.push_str("\">");
    for entry in entries {
        if entry.subdir {
            xml.push_str("<subdir name=\"");
            xml.push_str(&xml_escape(&entry.name));
            xml.push_str("\"/>");
            continue;
        }
        xml.push_str("<object>");
        push_tag(&mut xml, "name", &entry.name);
        push_tag(&mut xml, "hash", &entry.etag);
        push_tag(&mut xml, "bytes", &entry.size_bytes.to_string());
        push_tag(
            &mut xml,
            "content_type",
            entry
                .content_type
                .as_deref()
                .unwrap_or("application/octet-stream"),
        );
        push_tag(
            &mut xml,
            "last_modified",
            &format_swift_time(entry.last_modified),
        );
        if !entry.content_location.is_empty() {
            push_tag(&mut xml, "content_location", &entry.content_location);
        }
        xml.push_str("</object>");
    }
    xml.push_str("</container>");
    xml
}

fn push_tag(xml: &mut String, name: &str, value: &str) {
    xml.push('<');
    xml.push_str(name);
    xml.push('>');
    xml.push_str(xml_escape(value).as_str());
    xml.push_str("</");
    xml.push_str(name);
    xml.push('>');
}

fn xml_escape(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&apos;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(name: &str, location: &str) -> ListEntry {
        ListEntry {
            name: name.to_string(),
            etag: "abc".to_string(),
            size_bytes: 3,
            last_modified: Utc::now(),
            content_type: None,
            subdir: false,
            content_location: location.to_string(),
        }
    }

    #[test]
    fn test_merge_local_wins() {
        let local = vec![entry("a", ""), entry("c", "")];
        let remote = vec![entry("a", "remote;id;bucket"), entry("b", "remote;id;bucket")];
        let merged = merge_listings(local, remote, 100);

        let names: Vec<&str> = merged.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        // "a" exists locally, so no marker; "b" is remote-only.
        assert!(merged[0].content_location.is_empty());
        assert_eq!(merged[1].content_location, "remote;id;bucket");
        assert!(merged[2].content_location.is_empty());
    }

    #[test]
    fn test_merge_respects_limit() {
        let local = vec![entry("a", ""), entry("b", "")];
        let remote = vec![entry("c", "r")];
        assert_eq!(merge_listings(local, remote, 2).len(), 2);
    }

    #[test]
    fn test_negotiate_format() {
        assert_eq!(
            ListingFormat::negotiate(Some("json"), None),
            ListingFormat::Json
        );
        assert_eq!(
            ListingFormat::negotiate(None, Some("application/json")),
            ListingFormat::Json
        );
        assert_eq!(
            ListingFormat::negotiate(None, Some("application/xml")),
            ListingFormat::Xml
        );
        assert_eq!(ListingFormat::negotiate(None, None), ListingFormat::Plain);
    }

    #[test]
    fn test_render_json_marks_remote_entries() {
        let entries = vec![entry("only-remote", "https://r;id;b")];
        let rendered = render_json(&entries);
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed[0]["name"], "only-remote");
        assert_eq!(parsed[0]["content_location"][0], "https://r;id;b");
    }

    #[test]
    fn test_render_xml_escapes() {
        let entries = vec![entry("a<b>&c", "")];
        let xml = render_xml("cont\"ainer", &entries);
        assert!(xml.contains("a&lt;b&gt;&amp;c"));
        assert!(xml.contains("cont&quot;ainer"));
    }

    #[test]
    fn test_render_plain() {
        let entries = vec![entry("x", ""), entry("héllo-🚀", "")];
        assert_eq!(
            render_listing("c", &entries, ListingFormat::Plain),
            "x\nhéllo-🚀\n"
        );
    }
}
