//! Access to the per-partition chunk tables stored in the container's XML
//! property list.
//!
//! The reconstruction only needs the ordered list of `blkx` entries. The
//! [`MetadataReader`] trait is that boundary; [`PlistReader`] is the stock
//! implementation reading Apple's XML property list format with `quick-xml`.
//! It builds a small value tree and walks `resource-fork` → `blkx`, nothing
//! else of the document is interpreted.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::{debug, warn};
use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::{Result, UdifError};

/// Raw chunk table of one partition, with the labels found next to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionBlob {
    /// Human readable name (`Name`, or `CFName` when absent).
    pub name: Option<String>,
    /// Partition identifier (`ID`), usually `-1` for the protective entries.
    pub id: Option<i64>,
    /// Binary `mish` chunk table.
    pub data: Vec<u8>,
}

/// Supplies the ordered per-partition chunk tables of a metadata document.
pub trait MetadataReader {
    fn partition_blobs(&self, document: &[u8]) -> Result<Vec<PartitionBlob>>;
}

/// [`MetadataReader`] for XML property lists.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlistReader;

impl MetadataReader for PlistReader {
    fn partition_blobs(&self, document: &[u8]) -> Result<Vec<PartitionBlob>> {
        let root = parse_plist(document).map_err(UdifError::Metadata)?;

        let blkx = root
            .get("resource-fork")
            .and_then(|fork| fork.get("blkx"))
            .ok_or_else(|| UdifError::Metadata("no resource-fork/blkx entry".into()))?;
        let entries = match blkx {
            PlistValue::Array(entries) => entries,
            _ => return Err(UdifError::Metadata("blkx is not an array".into())),
        };

        let mut blobs = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let data = match entry.get("Data") {
                Some(PlistValue::Data(data)) => data.clone(),
                _ => {
                    return Err(UdifError::Metadata(format!(
                        "blkx entry {} has no Data value",
                        index
                    )))
                }
            };
            let name = entry
                .get("Name")
                .or_else(|| entry.get("CFName"))
                .and_then(PlistValue::as_str)
                .map(str::to_string);
            let id = entry.get("ID").and_then(PlistValue::as_i64);
            debug!(
                "blkx entry {}: {} ({} bytes)",
                index,
                name.as_deref().unwrap_or("<unnamed>"),
                data.len()
            );
            blobs.push(PartitionBlob { name, id, data });
        }
        Ok(blobs)
    }
}

/// Minimal property list value tree.
#[derive(Debug, Clone, PartialEq)]
enum PlistValue {
    Dict(Vec<(String, PlistValue)>),
    Array(Vec<PlistValue>),
    String(String),
    Data(Vec<u8>),
    Integer(i64),
    Bool(bool),
    /// Any element not needed here (`real`, `date`, ...).
    Other,
}

impl PlistValue {
    fn get(&self, key: &str) -> Option<&PlistValue> {
        match self {
            PlistValue::Dict(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            PlistValue::String(s) => Some(s),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            PlistValue::Integer(i) => Some(*i),
            PlistValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

type XmlReader<'a> = Reader<&'a [u8]>;

fn parse_plist(document: &[u8]) -> std::result::Result<PlistValue, String> {
    let mut reader = Reader::from_reader(document);
    reader.config_mut().trim_text(true);

    loop {
        match next_event(&mut reader)? {
            Event::Start(e) if e.name().as_ref() == b"plist" => {
                let event = next_event(&mut reader)?;
                return read_value(&mut reader, event);
            }
            event @ (Event::Start(_) | Event::Empty(_)) => {
                warn!("Property list has no <plist> root element");
                return read_value(&mut reader, event);
            }
            Event::Eof => return Err("empty property list".into()),
            _ => {}
        }
    }
}

/// Next event that carries structure or content.
fn next_event<'a>(reader: &mut XmlReader<'a>) -> std::result::Result<Event<'a>, String> {
    loop {
        match reader.read_event() {
            Ok(Event::Comment(_) | Event::Decl(_) | Event::PI(_) | Event::DocType(_)) => continue,
            Ok(event) => return Ok(event),
            Err(e) => {
                return Err(format!(
                    "XML error at position {}: {}",
                    reader.buffer_position(),
                    e
                ))
            }
        }
    }
}

fn read_value<'a>(reader: &mut XmlReader<'a>, event: Event<'a>) -> std::result::Result<PlistValue, String> {
    match event {
        Event::Start(e) => match e.name().as_ref() {
            b"dict" => read_dict(reader),
            b"array" => read_array(reader),
            b"string" => Ok(PlistValue::String(read_text(reader)?)),
            b"data" => {
                let text: String = read_text(reader)?
                    .chars()
                    .filter(|c| !c.is_ascii_whitespace())
                    .collect();
                BASE64
                    .decode(text.as_bytes())
                    .map(PlistValue::Data)
                    .map_err(|e| format!("invalid base64 in <data>: {}", e))
            }
            b"integer" => {
                let text = read_text(reader)?;
                text.trim()
                    .parse()
                    .map(PlistValue::Integer)
                    .map_err(|_| format!("invalid <integer> value '{}'", text))
            }
            _ => {
                reader
                    .read_to_end(e.name())
                    .map_err(|err| format!("XML error: {}", err))?;
                Ok(PlistValue::Other)
            }
        },
        Event::Empty(e) => Ok(match e.name().as_ref() {
            b"true" => PlistValue::Bool(true),
            b"false" => PlistValue::Bool(false),
            b"dict" => PlistValue::Dict(Vec::new()),
            b"array" => PlistValue::Array(Vec::new()),
            b"string" => PlistValue::String(String::new()),
            b"data" => PlistValue::Data(Vec::new()),
            _ => PlistValue::Other,
        }),
        Event::Eof => Err("unexpected end of property list".into()),
        other => Err(format!("unexpected XML content: {:?}", other)),
    }
}

fn read_dict(reader: &mut XmlReader<'_>) -> std::result::Result<PlistValue, String> {
    let mut entries = Vec::new();
    loop {
        let key = match next_event(reader)? {
            Event::End(_) => return Ok(PlistValue::Dict(entries)),
            Event::Start(e) if e.name().as_ref() == b"key" => read_text(reader)?,
            Event::Empty(e) if e.name().as_ref() == b"key" => String::new(),
            Event::Eof => return Err("unterminated <dict>".into()),
            other => return Err(format!("expected <key> in <dict>, found {:?}", other)),
        };
        let event = next_event(reader)?;
        let value = read_value(reader, event)?;
        entries.push((key, value));
    }
}

fn read_array(reader: &mut XmlReader<'_>) -> std::result::Result<PlistValue, String> {
    let mut items = Vec::new();
    loop {
        match next_event(reader)? {
            Event::End(_) => return Ok(PlistValue::Array(items)),
            Event::Eof => return Err("unterminated <array>".into()),
            event => items.push(read_value(reader, event)?),
        }
    }
}

/// Text content up to the closing tag of the current element.
fn read_text(reader: &mut XmlReader<'_>) -> std::result::Result<String, String> {
    let mut text = String::new();
    loop {
        match next_event(reader)? {
            Event::Text(t) => {
                let part = t.unescape().map_err(|e| format!("invalid text: {}", e))?;
                text.push_str(&part);
            }
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c)),
            Event::End(_) => return Ok(text),
            Event::Eof => return Err("unterminated text element".into()),
            other => return Err(format!("unexpected markup in text element: {:?}", other)),
        }
    }
}

/// Render a minimal property list holding the given `blkx` entries.
///
/// Only used to build synthetic containers in tests.
#[cfg(test)]
pub(crate) fn render_plist(blobs: &[PartitionBlob]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
         <plist version=\"1.0\">\n<dict>\n\t<key>resource-fork</key>\n\t<dict>\n\t\t<key>blkx</key>\n\t\t<array>\n",
    );
    for blob in blobs {
        xml.push_str("\t\t\t<dict>\n\t\t\t\t<key>Attributes</key>\n\t\t\t\t<string>0x0050</string>\n");
        xml.push_str("\t\t\t\t<key>Data</key>\n\t\t\t\t<data>\n");
        let encoded = BASE64.encode(&blob.data);
        for line in encoded.as_bytes().chunks(52) {
            xml.push_str("\t\t\t\t");
            xml.push_str(&String::from_utf8_lossy(line));
            xml.push('\n');
        }
        xml.push_str("\t\t\t\t</data>\n");
        if let Some(id) = blob.id {
            xml.push_str(&format!("\t\t\t\t<key>ID</key>\n\t\t\t\t<string>{}</string>\n", id));
        }
        if let Some(name) = &blob.name {
            xml.push_str(&format!("\t\t\t\t<key>Name</key>\n\t\t\t\t<string>{}</string>\n", name));
        }
        xml.push_str("\t\t\t</dict>\n");
    }
    xml.push_str("\t\t</array>\n\t</dict>\n</dict>\n</plist>\n");
    xml
}
