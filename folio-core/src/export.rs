//! Read-only renderings of a document.

use crate::error::DocResult;
use crate::node::{ElementKind, Marks, NodeId, NodeKind};
use crate::tree::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Visible text with blocks separated by newlines.
    PlainText,
    /// The JSON tree snapshot.
    Snapshot,
    /// HTML-like markup with tracked changes, anchors, and mentions tagged.
    Markup,
}

pub fn export(doc: &Document, format: ExportFormat) -> DocResult<String> {
    match format {
        ExportFormat::PlainText => Ok(doc.plain_text()),
        ExportFormat::Snapshot => doc.to_json(),
        ExportFormat::Markup => Ok(to_markup(doc)),
    }
}

pub fn to_markup(doc: &Document) -> String {
    let mut out = String::new();
    for &child in doc.children(doc.root()) {
        write_node(doc, child, &mut out);
    }
    out
}

fn element_tag(element: ElementKind) -> String {
    match element {
        ElementKind::Document => "div".into(),
        ElementKind::Paragraph => "p".into(),
        ElementKind::Heading { level } => format!("h{}", level.clamp(1, 6)),
        ElementKind::Blockquote => "blockquote".into(),
        ElementKind::CodeBlock => "pre".into(),
        ElementKind::BulletList => "ul".into(),
        ElementKind::OrderedList => "ol".into(),
        ElementKind::ListItem => "li".into(),
        ElementKind::Table => "table".into(),
        ElementKind::TableRow => "tr".into(),
        ElementKind::TableCell => "td".into(),
    }
}

const MARK_TAGS: [(Marks, &str); 5] = [
    (Marks::BOLD, "strong"),
    (Marks::ITALIC, "em"),
    (Marks::UNDERLINE, "u"),
    (Marks::STRIKE, "s"),
    (Marks::CODE, "code"),
];

fn write_children(doc: &Document, id: NodeId, out: &mut String) {
    for &child in doc.children(id) {
        write_node(doc, child, out);
    }
}

fn write_node(doc: &Document, id: NodeId, out: &mut String) {
    let Some(kind) = doc.kind(id) else {
        return;
    };
    match kind {
        NodeKind::Text { content, marks } => {
            let open: Vec<&str> = MARK_TAGS
                .iter()
                .filter(|(m, _)| marks.contains(*m))
                .map(|(_, t)| *t)
                .collect();
            for tag in &open {
                out.push_str(&format!("<{tag}>"));
            }
            out.push_str(&escape(content));
            for tag in open.iter().rev() {
                out.push_str(&format!("</{tag}>"));
            }
        }
        NodeKind::Element { element } => {
            let tag = element_tag(*element);
            out.push_str(&format!("<{tag}>"));
            write_children(doc, id, out);
            out.push_str(&format!("</{tag}>"));
        }
        NodeKind::TrackedInsert(meta) | NodeKind::TrackedDelete(meta) => {
            let tag = if matches!(kind, NodeKind::TrackedInsert(_)) { "ins" } else { "del" };
            out.push_str(&format!(
                "<{tag} data-author=\"{}\" data-name=\"{}\" data-time=\"{}\">",
                meta.author_id,
                escape(&meta.author_name),
                meta.timestamp
            ));
            write_children(doc, id, out);
            out.push_str(&format!("</{tag}>"));
        }
        NodeKind::CommentAnchor { comment_id } => {
            out.push_str(&format!("<span class=\"comment\" data-comment=\"{comment_id}\">"));
            write_children(doc, id, out);
            out.push_str("</span>");
        }
        NodeKind::Mention { user_id, label } => {
            out.push_str(&format!(
                "<span class=\"mention\" data-user=\"{user_id}\">{}</span>",
                escape(label)
            ));
        }
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{Author, ReviewMode, TrackChanges};
    use uuid::Uuid;

    #[test]
    fn test_plain_and_markup() {
        let doc = Document::from_plain_text("a<b\nc");
        assert_eq!(export(&doc, ExportFormat::PlainText).unwrap(), "a<b\nc");
        assert_eq!(to_markup(&doc), "<p>a&lt;b</p><p>c</p>");
    }

    #[test]
    fn test_markup_tags_changes() {
        let mut doc = Document::from_plain_text("ab");
        let mut tc = TrackChanges::new(Author::new(Uuid::nil(), "Ann"));
        tc.set_mode(ReviewMode::Review);
        tc.insert_text(&mut doc, 1, "X", 7).unwrap();
        let markup = to_markup(&doc);
        assert!(markup.starts_with("<p>a<ins "));
        assert!(markup.contains("data-name=\"Ann\" data-time=\"7\">X</ins>"));
        assert!(markup.ends_with("b</p>"));
    }

    #[test]
    fn test_snapshot_export_parses_back() {
        let doc = Document::from_plain_text("one\ntwo");
        let json = export(&doc, ExportFormat::Snapshot).unwrap();
        assert_eq!(Document::from_json(&json).unwrap(), doc);
    }
}
