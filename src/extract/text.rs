use std::borrow::Cow;

use super::truncate_chars;

pub(super) fn plain(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// UTF-8 when the bytes are valid UTF-8, otherwise Latin-1.
fn decode_utf8_or_latin1(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(bytes.iter().map(|&b| b as char).collect()),
    }
}

/// First `max_rows` records, non-empty cells joined with ` | `.
pub(super) fn csv(bytes: &[u8], max_rows: usize) -> String {
    let text = decode_utf8_or_latin1(bytes);
    let mut reader = ::csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    reader
        .records()
        .take(max_rows)
        .filter_map(|record| record.ok())
        .map(|record| {
            record
                .iter()
                .filter(|cell| !cell.is_empty())
                .collect::<Vec<_>>()
                .join(" | ")
        })
        .filter(|row| !row.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Pretty-printed JSON with two-space indent, or the raw text when it does
/// not parse. Either way capped at `max_chars`.
pub(super) fn json(bytes: &[u8], max_chars: usize) -> String {
    let raw = String::from_utf8_lossy(bytes);
    let text = match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| raw.to_string()),
        Err(_) => raw.trim().to_string(),
    };
    truncate_chars(&text, max_chars).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_drops_empty_cells_and_blank_rows() {
        let input = b"name,,total\n\n\"Smith, J\",\"said \"\"hi\"\"\",42\n,,\n";
        assert_eq!(csv(input, 100), "name | total\nSmith, J | said \"hi\" | 42");
    }

    #[test]
    fn csv_row_cap() {
        let input = b"a\nb\nc\nd\n";
        assert_eq!(csv(input, 2), "a\nb");
    }

    #[test]
    fn csv_quoted_newline_stays_in_record() {
        let input = b"\"multi\nline\",x\nnext\n";
        assert_eq!(csv(input, 1), "multi\nline | x");
    }

    #[test]
    fn csv_falls_back_to_latin1() {
        assert_eq!(csv(b"caf\xe9,x\n", 10), "caf\u{e9} | x");
        assert_eq!(csv("na\u{ef}ve,y".as_bytes(), 10), "na\u{ef}ve | y");
    }

    #[test]
    fn csv_ragged_rows_are_kept() {
        assert_eq!(csv(b"a,b,c\nd\ne,f\n", 10), "a | b | c\nd\ne | f");
    }

    #[test]
    fn json_is_pretty_printed_in_source_order() {
        let text = json(br#"{"zeta":1,"alpha":[true]}"#, 5000);
        assert_eq!(text, "{\n  \"zeta\": 1,\n  \"alpha\": [\n    true\n  ]\n}");
    }

    #[test]
    fn invalid_json_falls_back_to_raw_and_caps() {
        assert_eq!(json(b"  {not json  ", 100), "{not json");
        assert_eq!(json(b"[1,2,3,4,5,6]", 4), "[\n  ");
    }
}
