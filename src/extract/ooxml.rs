//! Office Open XML: docx, pptx and xlsx are zip archives of XML parts.

use std::collections::HashMap;
use std::io::Cursor;

use quick_xml::events::Event;
use quick_xml::Reader;

use super::{read_bounded, ExtractError, SlideHeading};

/// Maximum decompressed bytes to read from a single XML part.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_part(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    read_bounded(entry, MAX_XML_ENTRY_BYTES, name).map_err(ExtractError::Ooxml)
}

fn has_part(archive: &Archive<'_>, name: &str) -> bool {
    archive.file_names().any(|n| n == name)
}

fn xml_error(e: quick_xml::Error) -> ExtractError {
    ExtractError::Ooxml(e.to_string())
}

/// Attribute value by local name (`r:id` matches `id`).
fn attr(e: &quick_xml::events::BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.local_name().as_ref() == local {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// Paragraphs of a text body: text of `t` runs collected per `p` element.
/// `tab` and `br` become whitespace inside the paragraph.
fn paragraphs(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paras = Vec::new();
    let mut current = String::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"t" => in_t = true,
                b"p" => current.clear(),
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" => current.push('\n'),
                b"p" => paras.push(String::new()),
                _ => {}
            },
            Event::Text(te) if in_t => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => paras.push(std::mem::take(&mut current)),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(paras)
}

// ============ docx ============

/// Body paragraphs, one per line.
pub(super) fn docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open(bytes)?;
    if !has_part(&archive, "word/document.xml") {
        return Err(ExtractError::Ooxml("word/document.xml not found".to_string()));
    }
    let xml = read_part(&mut archive, "word/document.xml")?;
    Ok(paragraphs(&xml)?.join("\n").trim().to_string())
}

// ============ pptx ============

fn numbered_parts(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Each slide under its own heading, followed by its non-empty paragraphs.
pub(super) fn pptx(bytes: &[u8], heading: SlideHeading) -> Result<String, ExtractError> {
    let mut archive = open(bytes)?;
    let mut out = Vec::new();
    for (idx, name) in numbered_parts(&archive, "ppt/slides/slide")
        .into_iter()
        .enumerate()
    {
        let xml = read_part(&mut archive, &name)?;
        out.push(match heading {
            SlideHeading::Banner => format!("=== Slide {} ===", idx + 1),
            SlideHeading::Plain => format!("Slide {}:", idx + 1),
        });
        out.extend(paragraphs(&xml)?.into_iter().filter(|p| !p.trim().is_empty()));
    }
    Ok(out.join("\n").trim().to_string())
}

// ============ xlsx ============

/// Sheets in workbook order as `(display name, part path)`.
fn worksheets(archive: &mut Archive<'_>) -> Result<Vec<(String, String)>, ExtractError> {
    if !has_part(archive, "xl/workbook.xml") {
        // Workbook part missing: fall back to part numbering.
        return Ok(numbered_parts(archive, "xl/worksheets/sheet")
            .into_iter()
            .enumerate()
            .map(|(i, part)| (format!("Sheet{}", i + 1), part))
            .collect());
    }

    let targets = if has_part(archive, "xl/_rels/workbook.xml.rels") {
        relationship_targets(&read_part(archive, "xl/_rels/workbook.xml.rels")?)?
    } else {
        HashMap::new()
    };

    let xml = read_part(archive, "xl/workbook.xml")?;
    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut sheets = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                let name = attr(&e, b"name").unwrap_or_default();
                let part = attr(&e, b"id")
                    .and_then(|rid| targets.get(&rid).cloned())
                    .unwrap_or_else(|| format!("xl/worksheets/sheet{}.xml", sheets.len() + 1));
                sheets.push((name, part));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(sheets)
}

/// Relationship id to archive path, resolved against `xl/`.
fn relationship_targets(xml: &[u8]) -> Result<HashMap<String, String>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut targets = HashMap::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Target")) {
                    let path = match target.strip_prefix('/') {
                        Some(absolute) => absolute.to_string(),
                        None => format!("xl/{}", target),
                    };
                    targets.insert(id, path);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(targets)
}

/// Every `si` entry, with all of its rich-text runs concatenated.
fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ExtractError> {
    if !has_part(archive, "xl/sharedStrings.xml") {
        return Ok(Vec::new());
    }
    let xml = read_part(archive, "xl/sharedStrings.xml")?;
    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current.clear(),
                b"t" => in_t = true,
                _ => {}
            },
            Event::Text(te) if in_t => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.push(std::mem::take(&mut current)),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Last column Excel allows (`XFD`), zero-based.
const MAX_COLUMN: usize = 16_383;

/// Zero-based column of a cell reference such as `AB12`. `Ok(None)` when the
/// reference has no column letters; an error past column `XFD`.
fn column_index(reference: &str) -> Result<Option<usize>, ExtractError> {
    let mut col = 0usize;
    let mut letters = 0usize;
    for b in reference.bytes().take_while(|b| b.is_ascii_alphabetic()) {
        letters += 1;
        col = col
            .checked_mul(26)
            .and_then(|c| c.checked_add((b.to_ascii_uppercase() - b'A' + 1) as usize))
            .filter(|&c| c <= MAX_COLUMN + 1)
            .ok_or_else(|| ExtractError::Ooxml(format!("cell reference out of range: {}", reference)))?;
    }
    Ok(if letters == 0 { None } else { Some(col - 1) })
}

#[derive(Default)]
struct CellState {
    kind: Option<String>,
    column: Option<usize>,
    value: String,
}

/// Rows of one sheet as ` | `-joined cell text; rows with no text are dropped.
fn sheet_rows(xml: &[u8], shared: &[String], max_rows: usize) -> Result<Vec<String>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut rows_seen = 0usize;
    let mut cell = CellState::default();
    let mut in_value = false;
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"row" => {
                    if rows_seen >= max_rows {
                        break;
                    }
                    rows_seen += 1;
                    row.clear();
                }
                b"c" => {
                    let column = match attr(&e, b"r") {
                        Some(r) => column_index(&r)?,
                        None => None,
                    };
                    cell = CellState {
                        kind: attr(&e, b"t"),
                        column,
                        value: String::new(),
                    };
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Event::Text(te) if in_value => {
                cell.value.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let text = match cell.kind.as_deref() {
                        Some("s") => cell
                            .value
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared.get(i).cloned())
                            .unwrap_or_default(),
                        Some("b") => match cell.value.trim() {
                            "1" => "TRUE".to_string(),
                            _ => "FALSE".to_string(),
                        },
                        _ => cell.value.clone(),
                    };
                    let col = cell.column.unwrap_or(row.len()).min(MAX_COLUMN);
                    if col >= row.len() {
                        row.resize(col + 1, String::new());
                    }
                    row[col] = text;
                }
                b"row" => {
                    if row.iter().any(|c| !c.trim().is_empty()) {
                        rows.push(row.join(" | "));
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

/// Each sheet under `=== Sheet: name ===`, followed by its rows.
pub(super) fn xlsx(bytes: &[u8], max_sheets: usize, max_rows: usize) -> Result<String, ExtractError> {
    let mut archive = open(bytes)?;
    let shared = read_shared_strings(&mut archive)?;
    let mut out = Vec::new();
    for (name, part) in worksheets(&mut archive)?.into_iter().take(max_sheets) {
        if !has_part(&archive, &part) {
            continue;
        }
        let xml = read_part(&mut archive, &part)?;
        out.push(format!("=== Sheet: {} ===", name));
        out.extend(sheet_rows(&xml, &shared, max_rows)?);
    }
    Ok(out.join("\n").trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_letters() {
        assert_eq!(column_index("A1").unwrap(), Some(0));
        assert_eq!(column_index("C7").unwrap(), Some(2));
        assert_eq!(column_index("AA3").unwrap(), Some(26));
        assert_eq!(column_index("XFD9").unwrap(), Some(MAX_COLUMN));
        assert_eq!(column_index("12").unwrap(), None);
    }

    #[test]
    fn column_past_xfd_is_malformed() {
        assert!(matches!(column_index("XFE1"), Err(ExtractError::Ooxml(_))));
        assert!(column_index("ZZZZZZ1").is_err());
        assert!(column_index("AAAAAAAAAAAAAAAAAAAAAAAA1").is_err());
    }

    #[test]
    fn sheet_with_oversized_reference_is_rejected() {
        let xml = br#"<worksheet><sheetData>
            <row r="1"><c r="AAAAAAAAAAAAAAAA1"><v>boom</v></c></row>
        </sheetData></worksheet>"#;
        assert!(matches!(sheet_rows(xml, &[], 10), Err(ExtractError::Ooxml(_))));
    }

    #[test]
    fn paragraphs_keep_split_runs_together() {
        let xml = br#"<w:document xmlns:w="w"><w:body>
            <w:p><w:r><w:t>Hello</w:t></w:r><w:r><w:t xml:space="preserve"> world &amp; co</w:t></w:r></w:p>
            <w:p/>
            <w:p><w:r><w:t>Second</w:t><w:tab/><w:t>line</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let paras = paragraphs(xml).unwrap();
        assert_eq!(paras, vec!["Hello world & co", "", "Second\tline"]);
    }

    #[test]
    fn sheet_rows_fill_gaps_and_resolve_types() {
        let xml = br#"<worksheet><sheetData>
            <row r="1"><c r="A1" t="s"><v>0</v></c><c r="C1" t="s"><v>1</v></c></row>
            <row r="2"><c r="A2"><v>42</v></c><c r="B2" t="b"><v>1</v></c><c r="C2" t="inlineStr"><is><t>inline</t></is></c></row>
            <row r="3"><c r="A3"/></row>
            <row r="4"><c r="A4"><v>late</v></c></row>
        </sheetData></worksheet>"#;
        let shared = vec!["Name".to_string(), "Total".to_string()];
        let rows = sheet_rows(xml, &shared, 3).unwrap();
        assert_eq!(rows, vec!["Name |  | Total", "42 | TRUE | inline"]);
    }
}
