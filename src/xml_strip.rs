//! XML component-wrapper stripping (C9, §4.7).
//!
//! HL7 component values sometimes arrive wrapped in a small XML
//! fragment, e.g. `<OBX.5><OBX.5.1>x</OBX.5.1><OBX.5.2>y</OBX.5.2></OBX.5>`.
//! `strip_xml` reduces that to the pipe-joined text of the direct
//! children, with HTML entities decoded.

use quick_xml::events::Event;
use quick_xml::reader::Reader;

/// Strip an XML component wrapper down to its direct children's text,
/// joined with `|`. Empty or absent input passes through unchanged.
pub fn strip_xml(input: Option<&str>) -> String {
    let Some(raw) = input else { return String::new() };
    if raw.trim().is_empty() {
        return String::new();
    }
    if !raw.trim_start().starts_with('<') {
        return raw.to_string();
    }

    let mut reader = Reader::from_str(raw);
    reader.config_mut().trim_text(true);

    let mut fragments: Vec<String> = Vec::new();
    let mut depth = 0u32;
    let mut current = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(_)) => {
                depth += 1;
                if depth == 2 {
                    current.clear();
                }
            },
            Ok(Event::Text(t)) => {
                if depth == 2 {
                    if let Ok(text) = t.decode() {
                        current.push_str(&text);
                    }
                }
            },
            Ok(Event::End(_)) => {
                if depth == 2 {
                    fragments.push(html_escape::decode_html_entities(&current).into_owned());
                }
                if depth > 0 {
                    depth -= 1;
                }
            },
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {},
        }
        buf.clear();
    }

    fragments.into_iter().filter(|f| !f.is_empty()).collect::<Vec<_>>().join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_direct_children_with_pipe() {
        assert_eq!(strip_xml(Some("<X><X.1>a</X.1><X.2>b</X.2></X>")), "a|b");
    }

    #[test]
    fn empty_input_passes_through() {
        assert_eq!(strip_xml(Some("")), "");
        assert_eq!(strip_xml(None), "");
    }

    #[test]
    fn decodes_html_entities() {
        assert_eq!(strip_xml(Some("<X><X.1>a &amp; b</X.1></X>")), "a & b");
    }

    #[test]
    fn non_xml_input_passes_through_unchanged() {
        assert_eq!(strip_xml(Some("110")), "110");
    }

    #[test]
    fn empty_children_are_skipped_not_joined_as_blanks() {
        assert_eq!(strip_xml(Some("<X><X.1></X.1><X.2>b</X.2></X>")), "b");
    }
}
