// Markup stripping for word-processor documents and HTML

use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;
use scraper::{node::Node, ElementRef, Html};

use crate::types::{AppError, AppResult};

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "head", "noscript", "template", "svg"];

/// Elements that end a paragraph.
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "section", "article", "main", "header", "footer", "aside", "nav", "blockquote",
    "pre", "table", "ul", "ol", "dl", "figure", "h1", "h2", "h3", "h4", "h5", "h6", "hr",
];

/// Elements that end a line.
const LINE_ELEMENTS: &[&str] = &["li", "tr", "dt", "dd", "caption", "figcaption"];

const CELL_ELEMENTS: &[&str] = &["td", "th"];

/// Extract the body text of a `.docx` file.
///
/// Paragraphs (`w:p`) become blank-line separated paragraphs, tabs and
/// explicit breaks are kept.
pub fn docx_to_text(bytes: &[u8]) -> AppResult<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| AppError::Validation(format!("Not a valid DOCX archive: {}", e)))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| AppError::Validation(format!("DOCX has no document body: {}", e)))?
        .read_to_string(&mut xml)
        .map_err(|e| AppError::Validation(format!("Unreadable DOCX document body: {}", e)))?;

    wordml_to_text(&xml)
}

fn wordml_to_text(xml: &str) -> AppResult<String> {
    let mut reader = Reader::from_str(xml);
    let mut text = String::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = true;
                }
            }
            Ok(Event::Text(e)) => {
                if in_text_run {
                    let unescaped = e
                        .unescape()
                        .map_err(|e| AppError::Validation(format!("Malformed DOCX text: {}", e)))?;
                    text.push_str(&unescaped);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => text.push_str("\n\n"),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => text.push('\t'),
                b"br" | b"cr" => text.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(AppError::Validation(format!(
                    "Malformed DOCX XML at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(tidy(&text))
}

/// Visible text of an HTML document. Block elements end paragraphs, inline
/// whitespace is collapsed, scripts and styles are dropped.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut text = String::new();
    walk(document.root_element(), false, &mut text);
    tidy(&text)
}

fn walk(element: ElementRef<'_>, preformatted: bool, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(t) => {
                if preformatted {
                    out.push_str(t);
                } else {
                    push_collapsed(t, out);
                }
            }
            Node::Element(el) => {
                let name = el.name();
                if SKIPPED_ELEMENTS.contains(&name) {
                    continue;
                }
                if name == "br" {
                    out.push('\n');
                    continue;
                }

                let Some(child_element) = ElementRef::wrap(child) else {
                    continue;
                };

                if BLOCK_ELEMENTS.contains(&name) {
                    break_lines(out, 2);
                    walk(child_element, preformatted || name == "pre", out);
                    break_lines(out, 2);
                } else if LINE_ELEMENTS.contains(&name) {
                    break_lines(out, 1);
                    walk(child_element, preformatted, out);
                    break_lines(out, 1);
                } else if CELL_ELEMENTS.contains(&name) {
                    walk(child_element, preformatted, out);
                    out.push_str("  ");
                } else {
                    walk(child_element, preformatted, out);
                }
            }
            _ => {}
        }
    }
}

/// Make `out` end with at least `count` newlines.
fn break_lines(out: &mut String, count: usize) {
    let existing = out.chars().rev().take_while(|c| *c == '\n').count();
    for _ in existing..count {
        out.push('\n');
    }
}

fn push_collapsed(text: &str, out: &mut String) {
    let starts_with_space = text.starts_with(char::is_whitespace);
    let ends_with_space = text.ends_with(char::is_whitespace);
    let words: Vec<&str> = text.split_whitespace().collect();

    if words.is_empty() {
        if !text.is_empty() && !out.is_empty() && !out.ends_with(char::is_whitespace) {
            out.push(' ');
        }
        return;
    }

    if starts_with_space && !out.is_empty() && !out.ends_with(char::is_whitespace) {
        out.push(' ');
    }
    out.push_str(&words.join(" "));
    if ends_with_space {
        out.push(' ');
    }
}

/// Trim every line and collapse runs of blank lines into one.
fn tidy(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() && lines.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn docx_with_body(body: &str) -> Vec<u8> {
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
            body
        );

        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            writer
                .start_file("word/document.xml", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(xml.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        buffer.into_inner()
    }

    #[test]
    fn test_docx_paragraphs_become_paragraphs() {
        let docx = docx_with_body(
            r#"<w:p><w:r><w:t>Quarterly</w:t></w:r><w:r><w:t xml:space="preserve"> report</w:t></w:r></w:p><w:p><w:r><w:t>Fish &amp; chips</w:t><w:tab/><w:t>ok</w:t></w:r></w:p>"#,
        );

        let text = docx_to_text(&docx).unwrap();
        assert_eq!(text, "Quarterly report\n\nFish & chips\tok");
    }

    #[test]
    fn test_docx_without_body_is_rejected() {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            writer
                .start_file("other.xml", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"<x/>").unwrap();
            writer.finish().unwrap();
        }

        assert!(matches!(
            docx_to_text(&buffer.into_inner()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_html_strips_tags_and_scripts() {
        let html = r#"<html><head><title>t</title><style>p { color: red }</style></head>
            <body><h1>Pricing</h1><p>Plans start at   <b>$10</b>&nbsp;a month.</p>
            <script>alert(1)</script><ul><li>Basic</li><li>Pro</li></ul></body></html>"#;

        let text = html_to_text(html);
        assert_eq!(text, "Pricing\n\nPlans start at $10 a month.\n\nBasic\nPro");
    }

    #[test]
    fn test_html_line_breaks() {
        let text = html_to_text("<p>one<br>two</p><p>three &amp; four</p>");
        assert_eq!(text, "one\ntwo\n\nthree & four");
    }

    #[test]
    fn test_tidy_collapses_blank_runs() {
        assert_eq!(tidy("\n\n  a  \n\n\n\nb\n\n"), "a\n\nb");
    }
}
