//! Lightweight XML extraction for SOAP responses
//!
//! Full XML parsing buys nothing here; device responses vary only in
//! namespace prefixes, so string scanning with prefix-agnostic patterns is
//! enough.

/// Extract the text content of a tag, tolerating any namespace prefix
pub fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let prefixed_patterns = [
        format!("<tds:{}>", tag),
        format!("<tt:{}>", tag),
        format!("<trt:{}>", tag),
        format!("<d:{}>", tag),
    ];

    for pattern in &prefixed_patterns {
        if let Some(start) = xml.find(pattern.as_str()) {
            let content_start = start + pattern.len();
            if let Some(end) = xml[content_start..].find("</") {
                let value = xml[content_start..content_start + end].trim().to_string();
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
    }

    // Any prefix
    let pattern = format!(":{}>", tag);
    if let Some(start) = xml.find(pattern.as_str()) {
        let content_start = start + pattern.len();
        if let Some(end) = xml[content_start..].find("</") {
            let value = xml[content_start..content_start + end].trim().to_string();
            if !value.is_empty() {
                return Some(value);
            }
        }
    }

    // No prefix
    let simple_pattern = format!("<{}>", tag);
    if let Some(start) = xml.find(simple_pattern.as_str()) {
        let content_start = start + simple_pattern.len();
        let close_pattern = format!("</{}>", tag);
        if let Some(end) = xml[content_start..].find(close_pattern.as_str()) {
            let value = xml[content_start..content_start + end].trim().to_string();
            if !value.is_empty() {
                return Some(value);
            }
        }
    }

    None
}

/// Extract every element section named `tag` (opening tag through closing
/// tag), regardless of namespace prefix
pub fn extract_sections<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let mut sections = Vec::new();
    let mut search_from = 0;

    while let Some(start) = find_open_tag(&xml[search_from..], tag) {
        let start = search_from + start;
        match find_close_tag(&xml[start..], tag) {
            Some(end) => {
                sections.push(&xml[start..start + end]);
                search_from = start + end;
            }
            None => break,
        }
    }

    sections
}

/// Position of the `<` of the next opening tag named `tag`, any prefix.
/// Name collisions like <ProfilesExt> when looking for <Profiles> are
/// rejected by requiring a delimiter after the name.
fn find_open_tag(xml: &str, tag: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(rel) = xml[from..].find(tag) {
        let pos = from + rel;
        from = pos + tag.len();

        let before_ok = pos > 0 && matches!(xml.as_bytes()[pos - 1], b'<' | b':');
        let after_ok = xml[pos + tag.len()..].starts_with([' ', '>', '\t', '\n', '/']);
        if !before_ok || !after_ok {
            continue;
        }
        if let Some(lt) = xml[..pos].rfind('<') {
            // Opening tag only, not </tag>
            if !xml[lt..pos].contains('/') {
                return Some(lt);
            }
        }
    }
    None
}

/// Offset just past the matching `</[prefix:]tag>` in `xml`
fn find_close_tag(xml: &str, tag: &str) -> Option<usize> {
    let needle = format!("{}>", tag);
    let mut from = 0;
    while let Some(rel) = xml[from..].find(&needle) {
        let pos = from + rel;
        from = pos + needle.len();

        if let Some(close_start) = xml[..pos].rfind("</") {
            let between = &xml[close_start + 2..pos];
            if between.chars().all(|c| c.is_alphanumeric() || c == ':') {
                return Some(pos + needle.len());
            }
        }
    }
    None
}

/// Extract an attribute value from the first occurrence of `tag`
pub fn extract_xml_attribute(xml: &str, tag: &str, attr: &str) -> Option<String> {
    let tag_start = find_open_tag(xml, tag)?;
    let after_tag = &xml[tag_start..];
    let tag_end = after_tag.find('>')?;
    let tag_content = &after_tag[..tag_end];

    let attr_pattern = format!("{}=", attr);
    let attr_start = tag_content.find(attr_pattern.as_str())?;
    let after_attr = &tag_content[attr_start + attr_pattern.len()..];
    let quote = if after_attr.starts_with('\'') { '\'' } else { '"' };
    let val_start = after_attr.find(quote)?;
    let val_content = &after_attr[val_start + 1..];
    let val_end = val_content.find(quote)?;
    Some(val_content[..val_end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_with_namespace_prefix() {
        let xml = "<tds:Manufacturer>Axis</tds:Manufacturer>";
        assert_eq!(extract_xml_value(xml, "Manufacturer"), Some("Axis".to_string()));
    }

    #[test]
    fn test_extract_arbitrary_prefix() {
        let xml = "<d:XAddrs>http://192.168.1.20/onvif/device_service</d:XAddrs>";
        assert_eq!(
            extract_xml_value(xml, "XAddrs"),
            Some("http://192.168.1.20/onvif/device_service".to_string())
        );
    }

    #[test]
    fn test_extract_no_prefix() {
        let xml = "<Uri>rtsp://192.168.1.20:554/profile1</Uri>";
        assert_eq!(
            extract_xml_value(xml, "Uri"),
            Some("rtsp://192.168.1.20:554/profile1".to_string())
        );
    }

    #[test]
    fn test_extract_missing_tag() {
        assert_eq!(extract_xml_value("<Other>x</Other>", "Uri"), None);
    }

    #[test]
    fn test_extract_sections() {
        let xml = "<trt:Profiles token=\"p0\"><tt:Name>Main</tt:Name></trt:Profiles>\
                   <trt:Profiles token=\"p1\"><tt:Name>Sub</tt:Name></trt:Profiles>";
        let sections = extract_sections(xml, "Profiles");
        assert_eq!(sections.len(), 2);
        assert!(sections[0].contains("Main"));
        assert!(sections[1].contains("Sub"));
    }

    #[test]
    fn test_extract_attribute() {
        let xml = "<trt:Profiles token=\"profile_0\" fixed=\"true\">";
        assert_eq!(
            extract_xml_attribute(xml, "Profiles", "token"),
            Some("profile_0".to_string())
        );
    }
}
