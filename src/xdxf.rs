//! Basic XDXF to HTML transformation.
//!
//! Covers the common article markup: headwords, color spans, inline
//! styling, cross-references, and transcriptions. Unknown elements are
//! dropped while their text is kept, so no content is lost.

use log::warn;
use quick_xml::events::Event;

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Transforms an XDXF article fragment into HTML. On malformed input the
/// fragment is returned unchanged with a warning.
pub fn xdxf_to_html(xdxf: &str) -> String {
    match transform(xdxf) {
        Ok(html) => html,
        Err(e) => {
            warn!("xdxf transform failed: {e}");
            xdxf.to_string()
        }
    }
}

fn transform(xdxf: &str) -> Result<String, quick_xml::Error> {
    let mut xml = quick_xml::Reader::from_str(xdxf);
    let mut out = String::new();
    // Tags whose HTML counterpart closes an element opened on this stack.
    let mut open: Vec<&'static str> = Vec::new();
    // Inside a kref the text itself becomes the link target.
    let mut kref_text: Option<String> = None;

    loop {
        match xml.read_event()? {
            Event::Eof => break,
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"k" => {
                        out.push_str("<b>");
                        open.push("</b><br/>");
                    }
                    b"b" | b"i" | b"u" | b"sub" | b"sup" => {
                        let tag = String::from_utf8_lossy(&name).into_owned();
                        out.push('<');
                        out.push_str(&tag);
                        out.push('>');
                        open.push(match name.as_slice() {
                            b"b" => "</b>",
                            b"i" => "</i>",
                            b"u" => "</u>",
                            b"sub" => "</sub>",
                            _ => "</sup>",
                        });
                    }
                    b"c" => {
                        let mut color = None;
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"c" {
                                color = Some(String::from_utf8_lossy(&attr.value).into_owned());
                            }
                        }
                        match color {
                            Some(color) => {
                                out.push_str(&format!("<font color=\"{color}\">"))
                            }
                            None => out.push_str("<font color=\"green\">"),
                        }
                        open.push("</font>");
                    }
                    b"kref" => {
                        kref_text = Some(String::new());
                        open.push("");
                    }
                    b"ex" => {
                        out.push_str("<span class=\"ex\">");
                        open.push("</span>");
                    }
                    b"abr" | b"abbr" => {
                        out.push_str("<i>");
                        open.push("</i>");
                    }
                    b"tr" => {
                        out.push('[');
                        open.push("]");
                    }
                    _ => open.push(""),
                }
            }
            Event::End(_) => {
                if let Some(closing) = open.pop() {
                    if let Some(text) = kref_text.take() {
                        // A nested close while collecting link text just
                        // ends the collection.
                        let escaped = escape(&text);
                        out.push_str(&format!(
                            "<a href=\"bword://{escaped}\">{escaped}</a>"
                        ));
                    }
                    out.push_str(closing);
                }
            }
            Event::Empty(e) => {
                if e.name().as_ref() == b"br" {
                    out.push_str("<br/>");
                }
            }
            Event::Text(t) => {
                let text = match t.unescape() {
                    Ok(cow) => cow.into_owned(),
                    Err(_) => String::from_utf8_lossy(&t.clone().into_inner()).into_owned(),
                };
                match &mut kref_text {
                    Some(buf) => buf.push_str(&text),
                    None => out.push_str(&escape(&text)),
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headword_and_color() {
        let html = xdxf_to_html(r#"<k>ion</k><c c="red">charged</c> particle"#);
        assert_eq!(
            html,
            r#"<b>ion</b><br/><font color="red">charged</font> particle"#
        );
    }

    #[test]
    fn kref_becomes_bword_link() {
        let html = xdxf_to_html("see <kref>anion</kref>");
        assert_eq!(html, r#"see <a href="bword://anion">anion</a>"#);
    }

    #[test]
    fn unknown_tags_keep_their_text() {
        let html = xdxf_to_html("<dtrn>a definition</dtrn>");
        assert_eq!(html, "a definition");
    }

    #[test]
    fn text_is_escaped() {
        let html = xdxf_to_html("<k>a</k>1 &lt; 2");
        assert_eq!(html, "<b>a</b><br/>1 &lt; 2");
    }
}
