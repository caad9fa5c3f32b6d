//! XML and URL helpers shared by the SOAP layer and the parsers.

use quick_xml::events::BytesStart;

use super::types::Endpoint;
use crate::protocol_constants::DEFAULT_SONOS_PORT;

/// Escapes the five XML special characters.
#[must_use]
pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Extracts and entity-decodes the text content of the first `<tag>` element.
///
/// Matches both `<tag>` and `<tag attr="...">` forms as well as namespaced
/// names passed verbatim (e.g. `dc:title`). Returns `None` when the element is
/// missing or self-closing.
#[must_use]
pub fn extract_xml_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);

    let mut search_from = 0;
    let content_start = loop {
        let idx = xml[search_from..].find(&open)? + search_from;
        let after = idx + open.len();
        match xml[after..].chars().next()? {
            '>' => break after + 1,
            c if c.is_whitespace() => {
                let tag_end = xml[after..].find('>')? + after;
                if xml[..tag_end].ends_with('/') {
                    return None;
                }
                break tag_end + 1;
            }
            // Prefix of a longer tag name (e.g. <Track vs <TrackURI)
            _ => search_from = after,
        }
    };

    let content_end = xml[content_start..].find(&close)? + content_start;
    Some(html_escape::decode_html_entities(&xml[content_start..content_end]).into_owned())
}

/// Returns the entity-decoded value of an attribute on a start tag.
#[must_use]
pub fn get_xml_attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(Result::ok)
        .find(|a| a.key.as_ref() == name)
        .map(|a| {
            let raw = String::from_utf8_lossy(&a.value);
            html_escape::decode_html_entities(&raw).into_owned()
        })
}

/// Extracts host and port from a device description URL.
///
/// `http://192.168.1.10:1400/xml/device_description.xml` yields
/// `192.168.1.10:1400`. A missing port falls back to the Sonos default.
#[must_use]
pub fn endpoint_from_location(location: &str) -> Option<Endpoint> {
    let rest = location
        .strip_prefix("http://")
        .or_else(|| location.strip_prefix("https://"))?;
    let authority = rest.split('/').next()?;
    if authority.is_empty() {
        return None;
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            Some(Endpoint::new(host, port))
        }
        None => Some(Endpoint::new(authority, DEFAULT_SONOS_PORT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_xml_handles_all_specials() {
        assert_eq!(
            escape_xml(r#"<a href="x">&'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&apos;&lt;/a&gt;"
        );
    }

    #[test]
    fn extract_xml_text_decodes_entities() {
        let xml = "<s:Body><TrackURI>x-file://a?b=1&amp;c=2</TrackURI></s:Body>";
        assert_eq!(
            extract_xml_text(xml, "TrackURI").as_deref(),
            Some("x-file://a?b=1&c=2")
        );
    }

    #[test]
    fn extract_xml_text_skips_longer_tag_names() {
        let xml = "<TrackURI>uri</TrackURI><Track>3</Track>";
        assert_eq!(extract_xml_text(xml, "Track").as_deref(), Some("3"));
    }

    #[test]
    fn extract_xml_text_with_attributes() {
        let xml = r#"<res duration="0:03:00" protocolInfo="x">http://a/b.mp3</res>"#;
        assert_eq!(extract_xml_text(xml, "res").as_deref(), Some("http://a/b.mp3"));
        assert_eq!(extract_xml_text("<res/>", "res"), None);
        assert_eq!(extract_xml_text(r#"<res a="1"/>"#, "res"), None);
    }

    #[test]
    fn endpoint_from_location_parses_host_and_port() {
        assert_eq!(
            endpoint_from_location("http://192.168.1.10:1400/xml/device_description.xml"),
            Some(Endpoint::new("192.168.1.10", 1400))
        );
        assert_eq!(
            endpoint_from_location("http://speaker.local/xml"),
            Some(Endpoint::new("speaker.local", 1400))
        );
        assert_eq!(endpoint_from_location("not a url"), None);
    }
}
