use std::io::{Cursor, Read};

use tally_core::RawTable;
use tracing::{debug, warn};
use zip::ZipArchive;

use super::{read_container, ContainerKind, ReadContext, ReadError, ReadOutput, SkippedEntry};

/// Upper bound on the buffer reserved up front for an entry. The size an
/// archive declares is not trusted beyond this.
const MAX_PREALLOC: u64 = 8 * 1024 * 1024;

fn read_entry(entry: &mut impl Read, declared_size: u64) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(declared_size.min(MAX_PREALLOC) as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn is_hidden(path: &str) -> bool {
    path.starts_with("__MACOSX/")
        || path
            .rsplit('/')
            .next()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

/// Read every supported entry of a zip archive through the dispatcher and
/// concatenate the results. Entries that fail are reported in
/// `ReadOutput::skipped` instead of failing the whole archive.
pub fn read(file_id: &str, data: &[u8], ctx: &ReadContext) -> Result<ReadOutput, ReadError> {
    let mut archive =
        ZipArchive::new(Cursor::new(data)).map_err(|e| ReadError::CorruptContainer(format!("Zip: {e}")))?;

    let mut table = RawTable::new();
    let mut skipped = Vec::new();

    for i in 0..archive.len() {
        ctx.check_cancelled()?;
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ReadError::CorruptContainer(format!("Zip entry {i}: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        let path = entry.name().to_string();
        if is_hidden(&path) {
            debug!(archive = file_id, entry = %path, "Skipping hidden archive entry");
            continue;
        }

        let Some(kind) = ContainerKind::from_file_name(&path) else {
            skipped.push(SkippedEntry {
                path: path.clone(),
                error: ReadError::UnsupportedFormat(path),
            });
            continue;
        };
        if kind == ContainerKind::Zip && ctx.depth() + 1 > ctx.max_archive_depth {
            skipped.push(SkippedEntry {
                path,
                error: ReadError::CorruptContainer(format!(
                    "archives nested deeper than {}",
                    ctx.max_archive_depth
                )),
            });
            continue;
        }

        let declared_size = entry.size();
        let bytes = match read_entry(&mut entry, declared_size) {
            Ok(bytes) => bytes,
            Err(e) => {
                skipped.push(SkippedEntry {
                    path,
                    error: ReadError::CorruptContainer(format!("Zip entry: {e}")),
                });
                continue;
            }
        };
        drop(entry);

        match read_container(kind, &path, &bytes, &ctx.nested()) {
            Ok(inner) => {
                for record in inner.table.records {
                    table.push(record.into_nested(file_id));
                }
                skipped.extend(inner.skipped.into_iter().map(|s| SkippedEntry {
                    path: format!("{path}/{}", s.path),
                    error: s.error,
                }));
            }
            Err(ReadError::Cancelled) => return Err(ReadError::Cancelled),
            Err(error) => {
                warn!(archive = file_id, entry = %path, error = %error, "Skipping unreadable archive entry");
                skipped.push(SkippedEntry { path, error });
            }
        }
    }

    if table.is_empty() {
        return Err(ReadError::EmptyInput);
    }
    Ok(ReadOutput { table, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::{CompressionMethod, ZipWriter};

    fn zip_of(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = ZipWriter::new(Cursor::new(&mut buf));
            let options: FileOptions<'_, ()> = FileOptions::default().compression_method(CompressionMethod::Stored);
            for (name, body) in entries {
                zip.start_file(*name, options).unwrap();
                zip.write_all(body).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn declared_size_does_not_drive_allocation() {
        let bytes = read_entry(&mut &b"date,amount\n"[..], u64::MAX).unwrap();
        assert_eq!(bytes, b"date,amount\n");
        assert!(bytes.capacity() <= MAX_PREALLOC as usize);
    }

    #[test]
    fn concatenates_entries_with_nested_provenance() {
        let data = zip_of(&[
            ("jan.csv", b"date,amount\n2024-01-15,1\n".to_vec()),
            ("feb.json", br#"[{"date":"2024-02-15","amount":2}]"#.to_vec()),
        ]);
        let out = read("bundle.zip", &data, &ReadContext::default()).unwrap();
        assert_eq!(out.table.len(), 2);
        let first = out.table.records[0].provenance();
        assert_eq!(first.file_id, "bundle.zip");
        assert_eq!(first.raw_ref(), "jan.csv#row=0");
        assert!(out.skipped.is_empty());
    }

    #[test]
    fn unsupported_and_broken_entries_are_reported() {
        let data = zip_of(&[
            ("readme.md", b"hello".to_vec()),
            ("bad.json", b"{oops".to_vec()),
            ("ok.csv", b"date,amount\n2024-01-15,1\n".to_vec()),
            ("__MACOSX/._ok.csv", b"junk".to_vec()),
        ]);
        let out = read("bundle.zip", &data, &ReadContext::default()).unwrap();
        assert_eq!(out.table.len(), 1);
        let paths: Vec<&str> = out.skipped.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, vec!["readme.md", "bad.json"]);
    }

    #[test]
    fn nested_archives_recurse() {
        let inner = zip_of(&[("jan.csv", b"date,amount\n2024-01-15,1\n".to_vec())]);
        let outer = zip_of(&[("inner.zip", inner)]);
        let out = read("outer.zip", &outer, &ReadContext::default()).unwrap();
        assert_eq!(out.table.records[0].provenance().raw_ref(), "inner.zip/jan.csv#row=0");
    }

    #[test]
    fn nesting_limit_is_enforced() {
        let inner = zip_of(&[("jan.csv", b"date,amount\n2024-01-15,1\n".to_vec())]);
        let outer = zip_of(&[("inner.zip", inner), ("top.csv", b"date,amount\n2024-01-15,1\n".to_vec())]);
        let ctx = ReadContext {
            max_archive_depth: 0,
            ..ReadContext::default()
        };
        let out = read("outer.zip", &outer, &ctx).unwrap();
        assert_eq!(out.table.len(), 1);
        assert_eq!(out.skipped[0].path, "inner.zip");
    }

    #[test]
    fn archive_without_readable_entries_is_empty() {
        let data = zip_of(&[("notes.md", b"hi".to_vec())]);
        assert_eq!(read("x.zip", &data, &ReadContext::default()).unwrap_err(), ReadError::EmptyInput);
    }

    #[test]
    fn not_a_zip_is_corrupt() {
        assert!(matches!(
            read("x.zip", b"PK\x03\x04nope", &ReadContext::default()),
            Err(ReadError::CorruptContainer(_))
        ));
    }
}
