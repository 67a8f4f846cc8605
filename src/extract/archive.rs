//! `.zip` handling: either a listing of member names, or the text of the
//! supported members under tighter nested ceilings.

use std::io::Cursor;

use tracing::debug;

use super::{
    extract_structured, read_bounded, truncate_chars, ExtractError, ExtractLimits, FileFormat,
    SlideHeading,
};

fn open(bytes: &[u8]) -> Result<zip::ZipArchive<Cursor<&[u8]>>, ExtractError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractError::Archive(e.to_string()))
}

fn member_names(archive: &mut zip::ZipArchive<Cursor<&[u8]>>) -> Result<Vec<String>, ExtractError> {
    (0..archive.len())
        .map(|i| {
            archive
                .by_index(i)
                .map(|entry| entry.name().to_string())
                .map_err(|e| ExtractError::Archive(e.to_string()))
        })
        .collect()
}

/// Archive name, member count and up to `max_listed` member names.
pub(super) fn list(name: &str, bytes: &[u8], max_listed: usize) -> Result<String, ExtractError> {
    let mut archive = open(bytes)?;
    let names = member_names(&mut archive)?;

    let mut out = vec![
        format!("=== Archive: {} ===", name),
        format!("Contains {} files:", names.len()),
    ];
    out.extend(names.iter().take(max_listed).map(|n| format!("  • {}", n)));
    if names.len() > max_listed {
        out.push(format!("  ... and {} more files", names.len() - max_listed));
    }
    Ok(out.join("\n"))
}

/// Text of the supported members among the first `zip_max_entries`, each
/// under `=== File: name ===` and cut to `zip_entry_max_chars`.
///
/// A member that is too large or fails to parse is left out; it does not
/// fail the archive.
pub(super) fn extract(bytes: &[u8], limits: &ExtractLimits) -> Result<String, ExtractError> {
    let mut archive = open(bytes)?;
    let nested = limits.nested();
    let total = archive.len();

    let mut out = vec![
        "=== Archive ===".to_string(),
        format!("Contains {} files\n", total),
    ];
    for i in 0..total.min(limits.zip_max_entries) {
        let (member, content) = {
            let entry = archive
                .by_index(i)
                .map_err(|e| ExtractError::Archive(e.to_string()))?;
            if entry.is_dir() {
                continue;
            }
            let member = entry.name().to_string();
            if !FileFormat::from_name(&member).is_archive_member() {
                continue;
            }
            match read_bounded(entry, limits.entry_max_bytes, &member) {
                Ok(content) => (member, content),
                Err(reason) => {
                    debug!(member = %member, reason = %reason, "Skipping archive member");
                    continue;
                }
            }
        };

        let format = FileFormat::from_name(&member);
        match extract_structured(format, &content, &nested, SlideHeading::Plain) {
            Ok(Some(text)) if !text.trim().is_empty() => {
                out.push(format!("\n=== File: {} ===", member));
                out.push(truncate_chars(&text, limits.zip_entry_max_chars).to_string());
            }
            Ok(_) => {}
            Err(e) => debug!(member = %member, error = %e, "Archive member extraction failed"),
        }
    }
    Ok(out.join("\n").trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            for (name, body) in members {
                if name.ends_with('/') {
                    zip.add_directory(*name, SimpleFileOptions::default()).unwrap();
                } else {
                    zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                    zip.write_all(body).unwrap();
                }
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn list_mode_caps_names() {
        let names: Vec<String> = (0..5).map(|i| format!("f{}.txt", i)).collect();
        let members: Vec<(&str, &[u8])> = names.iter().map(|n| (n.as_str(), &b"x"[..])).collect();
        let text = list("bundle.zip", &archive(&members), 3).unwrap();
        assert_eq!(
            text,
            "=== Archive: bundle.zip ===\nContains 5 files:\n  • f0.txt\n  • f1.txt\n  • f2.txt\n  ... and 2 more files"
        );
    }

    #[test]
    fn extract_mode_reads_supported_members_only() {
        let long = "y".repeat(3000);
        let bytes = archive(&[
            ("docs/", b""),
            ("docs/readme.txt", b"hello from inside"),
            ("docs/data.csv", b"a,,b\n"),
            ("docs/photo.png", b"\x89PNG"),
            ("docs/long.md", long.as_bytes()),
        ]);
        let text = extract(&bytes, &ExtractLimits::default()).unwrap();
        assert!(text.starts_with("=== Archive ===\nContains 5 files\n"));
        assert!(text.contains("\n=== File: docs/readme.txt ===\nhello from inside"));
        assert!(text.contains("=== File: docs/data.csv ===\na | b"));
        assert!(!text.contains("photo.png"));
        let long_section = text.split("=== File: docs/long.md ===\n").nth(1).unwrap();
        assert_eq!(long_section.len(), 2000);
    }

    #[test]
    fn entry_cap_counts_directories() {
        let bytes = archive(&[("a/", b""), ("a/one.txt", b"one"), ("a/two.txt", b"two")]);
        let limits = ExtractLimits {
            zip_max_entries: 2,
            ..ExtractLimits::default()
        };
        let text = extract(&bytes, &limits).unwrap();
        assert!(text.contains("a/one.txt"));
        assert!(!text.contains("a/two.txt"));
    }

    #[test]
    fn oversized_member_is_skipped() {
        let bytes = archive(&[("big.txt", &[b'z'; 64][..]), ("small.txt", b"ok text")]);
        let limits = ExtractLimits {
            entry_max_bytes: 32,
            ..ExtractLimits::default()
        };
        let text = extract(&bytes, &limits).unwrap();
        assert!(!text.contains("big.txt"));
        assert!(text.contains("=== File: small.txt ===\nok text"));
    }
}
