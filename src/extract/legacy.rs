//! Pre-2007 Office binaries. There is no structured parser here: Word files
//! get a printable-text scrape of their `WordDocument` stream, the rest a
//! metadata note.

use std::io::{Cursor, Read};

use super::ExtractError;

const OLE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Scraped text shorter than this is treated as nothing found.
const MIN_SCRAPED_CHARS: usize = 20;

const WORD_STREAM: &str = "/WordDocument";

fn legacy_error(e: std::io::Error) -> ExtractError {
    ExtractError::Legacy(e.to_string())
}

/// Latin-1 printable, as opposed to control characters.
fn printable(c: char) -> bool {
    !c.is_control() && c != '\u{a0}' && c != '\u{ad}'
}

/// Printable lines of a byte stream read as Latin-1.
fn scrape(data: &[u8]) -> String {
    let decoded: String = data
        .iter()
        .map(|&b| b as char)
        .map(|c| if c == '\r' { '\n' } else { c })
        .filter(|&c| printable(c) || c == '\n' || c == '\t')
        .collect();
    decoded
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Word 97-2003: open the OLE container and scrape its `WordDocument`
/// stream. Other streams (tables, summary info) and the container's own
/// directory and allocation sectors are never read.
pub(super) fn doc(bytes: &[u8]) -> Result<Option<String>, ExtractError> {
    if !bytes.starts_with(&OLE_MAGIC) {
        return Err(ExtractError::Legacy("not an OLE compound file".to_string()));
    }
    let mut container = cfb::CompoundFile::open(Cursor::new(bytes)).map_err(legacy_error)?;
    if !container.is_stream(WORD_STREAM) {
        return Err(ExtractError::Legacy("no WordDocument stream".to_string()));
    }
    let mut data = Vec::new();
    container
        .open_stream(WORD_STREAM)
        .map_err(legacy_error)?
        .read_to_end(&mut data)
        .map_err(legacy_error)?;

    let text = scrape(&data);
    if text.chars().count() > MIN_SCRAPED_CHARS {
        Ok(Some(text))
    } else {
        Ok(None)
    }
}

/// Metadata-only record for formats without text extraction.
pub(super) fn note(name: &str, kind: &str) -> String {
    format!(
        "File: {}\nType: {}\nNote: Full-text extraction not supported",
        name, kind
    )
}
