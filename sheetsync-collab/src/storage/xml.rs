//! XML document format and the file-backed store.
//!
//! ```text
//! <?xml version="1.0" encoding="utf-8"?>
//! <spreadsheet>
//!     <cell>
//!         <name>A1</name>
//!         <contents>=B2+1</contents>
//!     </cell>
//! </spreadsheet>
//! ```
//!
//! The same encoding is sent to clients as the JOIN OK payload.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use super::{DocumentStore, StoreError};
use crate::cells::CellStore;

const ROOT: &str = "spreadsheet";
const CELL: &str = "cell";
const NAME: &str = "name";
const CONTENTS: &str = "contents";

/// Serialize every non-empty cell.
pub fn encode_spreadsheet(cells: &CellStore) -> Result<String, StoreError> {
    let mut writer = Writer::new(Vec::new());

    emit(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)),
    )?;
    emit(&mut writer, Event::Text(BytesText::new("\n")))?;
    emit(&mut writer, Event::Start(BytesStart::new(ROOT)))?;

    for (name, contents) in cells.iter() {
        emit(&mut writer, Event::Text(BytesText::new("\n\t")))?;
        emit(&mut writer, Event::Start(BytesStart::new(CELL)))?;
        emit_field(&mut writer, NAME, name)?;
        emit_field(&mut writer, CONTENTS, contents)?;
        emit(&mut writer, Event::Text(BytesText::new("\n\t")))?;
        emit(&mut writer, Event::End(BytesEnd::new(CELL)))?;
    }

    emit(&mut writer, Event::Text(BytesText::new("\n")))?;
    emit(&mut writer, Event::End(BytesEnd::new(ROOT)))?;
    emit(&mut writer, Event::Text(BytesText::new("\n")))?;

    String::from_utf8(writer.into_inner()).map_err(|e| StoreError::Encode(e.to_string()))
}

fn emit_field(writer: &mut Writer<Vec<u8>>, tag: &str, value: &str) -> Result<(), StoreError> {
    emit(writer, Event::Text(BytesText::new("\n\t\t")))?;
    emit(writer, Event::Start(BytesStart::new(tag)))?;
    emit(writer, Event::Text(BytesText::new(value)))?;
    emit(writer, Event::End(BytesEnd::new(tag)))
}

fn emit(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), StoreError> {
    writer
        .write_event(event)
        .map_err(|e| StoreError::Encode(e.to_string()))
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Name,
    Contents,
}

/// Parse a spreadsheet document.
///
/// Cells whose name or contents are empty are skipped. Unknown elements are
/// ignored; a document without a `<spreadsheet>` root is rejected.
pub fn decode_spreadsheet(xml: &str) -> Result<CellStore, StoreError> {
    let mut reader = Reader::from_str(xml);
    let mut cells = CellStore::new();

    let mut saw_root = false;
    let mut in_cell = false;
    let mut field: Option<Field> = None;
    let mut name = String::new();
    let mut contents = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"spreadsheet" => saw_root = true,
                b"cell" => {
                    in_cell = true;
                    name.clear();
                    contents.clear();
                }
                b"name" if in_cell => field = Some(Field::Name),
                b"contents" if in_cell => field = Some(Field::Contents),
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.name().as_ref() == b"spreadsheet" {
                    saw_root = true;
                }
            }
            Ok(Event::Text(text)) => {
                if let Some(field) = field {
                    let text = text
                        .unescape()
                        .map_err(|e| StoreError::Malformed(e.to_string()))?;
                    match field {
                        Field::Name => name.push_str(&text),
                        Field::Contents => contents.push_str(&text),
                    }
                }
            }
            Ok(Event::CData(data)) => {
                if let Some(field) = field {
                    let text = std::str::from_utf8(&data)
                        .map_err(|e| StoreError::Malformed(e.to_string()))?;
                    match field {
                        Field::Name => name.push_str(text),
                        Field::Contents => contents.push_str(text),
                    }
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"name" | b"contents" => field = None,
                b"cell" => {
                    in_cell = false;
                    if !name.is_empty() && !contents.is_empty() {
                        cells.set(std::mem::take(&mut name), std::mem::take(&mut contents));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(StoreError::Malformed(format!(
                    "at byte {}: {e}",
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
    }

    if !saw_root {
        return Err(StoreError::Malformed(format!("missing <{ROOT}> root")));
    }
    Ok(cells)
}

/// Stores each document as an XML file at its catalog path.
///
/// Saves go through a sibling temporary file and a rename so a crash never
/// leaves a half-written document behind.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlFileStore;

impl XmlFileStore {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentStore for XmlFileStore {
    fn load(&self, path: &Path) -> Result<CellStore, StoreError> {
        let text = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        decode_spreadsheet(&text)
    }

    fn save(&self, path: &Path, cells: &CellStore) -> Result<(), StoreError> {
        let xml = encode_spreadsheet(cells)?;
        let tmp = temp_path(path);

        fs::write(&tmp, xml).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    fn discard(&self, path: &Path) -> Result<(), StoreError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
