// Fixed-size monospace page layout with lopdf

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};

use crate::types::{AppError, AppResult};

// A4 in points
const PAGE_WIDTH: i64 = 595;
const PAGE_HEIGHT: i64 = 842;
const MARGIN: i64 = 56;

// Courier glyphs are 0.6 em wide: 80 columns of 10pt text take 480pt.
const FONT_SIZE: i64 = 10;
const LEADING: i64 = 12;

pub const COLUMNS: usize = 80;
pub const LINES_PER_PAGE: usize = ((PAGE_HEIGHT - 2 * MARGIN) / LEADING) as usize;

/// Render pre-wrapped lines onto A4 pages, one line per row, starting a new
/// page whenever the current one is full. No input still yields one blank
/// page so the result is always a valid document.
pub fn render_pages(lines: &[String]) -> AppResult<Vec<u8>> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let empty: [String; 0] = [];
    let mut page_lines: Vec<&[String]> = lines.chunks(LINES_PER_PAGE).collect();
    if page_lines.is_empty() {
        page_lines.push(&empty);
    }

    let mut page_ids: Vec<ObjectId> = Vec::with_capacity(page_lines.len());
    for chunk in page_lines {
        let content = page_content(chunk);
        let encoded = content
            .encode()
            .map_err(|e| AppError::Internal(format!("Failed to encode page content: {}", e)))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));

        page_ids.push(doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        }));
    }

    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => page_ids.iter().map(|id| Object::Reference(*id)).collect::<Vec<Object>>(),
        "Count" => Object::Integer(page_ids.len() as i64),
        "Resources" => resources_id,
        "MediaBox" => vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(PAGE_WIDTH),
            Object::Integer(PAGE_HEIGHT),
        ],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .map_err(|e| AppError::Internal(format!("Failed to write PDF: {}", e)))?;

    Ok(buffer)
}

fn page_content(lines: &[String]) -> Content {
    let mut operations = vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec!["F1".into(), Object::Integer(FONT_SIZE)]),
        Operation::new("TL", vec![Object::Integer(LEADING)]),
        Operation::new(
            "Td",
            vec![
                Object::Integer(MARGIN),
                Object::Integer(PAGE_HEIGHT - MARGIN - FONT_SIZE),
            ],
        ),
    ];

    for line in lines {
        if !line.is_empty() {
            operations.push(Operation::new(
                "Tj",
                vec![Object::string_literal(win_ansi(line))],
            ));
        }
        operations.push(Operation::new("T*", vec![]));
    }

    operations.push(Operation::new("ET", vec![]));
    Content { operations }
}

/// Encode for the standard 14 fonts. Anything outside Latin-1 becomes `?`.
fn win_ansi(line: &str) -> Vec<u8> {
    line.chars()
        .map(|c| match c as u32 {
            code @ 0x20..=0x7E | code @ 0xA0..=0xFF => code as u8,
            _ => b'?',
        })
        .collect()
}
