//! Asciicast v2 writer/reader (spec §3.1, §4.2). Line-delimited JSON: one header object
//! followed by `[elapsed, kind, data]` events. All writes are append-only; the reader
//! tolerates a partially written trailing line and picks it up on the next call.

use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub version: u8,
    pub width: u16,
    pub height: u16,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Header {
    pub fn new(width: u16, height: u16, command: Option<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self { version: 2, width, height, timestamp, env: None, command, title: None }
    }
}

/// One asciicast event, modeled as a sum type (Design Notes §9) rather than the source's
/// dynamically-shaped `[number, string, string]` array; `EventKind` serializes to/from
/// that array form for wire compatibility.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub elapsed: f64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Output(String),
    Input(String),
    Resize { cols: u16, rows: u16 },
    Exit(i32),
}

impl EventKind {
    fn tag(&self) -> &'static str {
        match self {
            EventKind::Output(_) => "o",
            EventKind::Input(_) => "i",
            EventKind::Resize { .. } => "r",
            EventKind::Exit(_) => "x",
        }
    }

    fn payload(&self) -> String {
        match self {
            EventKind::Output(s) | EventKind::Input(s) => s.clone(),
            EventKind::Resize { cols, rows } => format!("{cols}x{rows}"),
            EventKind::Exit(code) => code.to_string(),
        }
    }
}

impl Serialize for Event {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeTuple;
        let mut tup = serializer.serialize_tuple(3)?;
        tup.serialize_element(&self.elapsed)?;
        tup.serialize_element(self.kind.tag())?;
        tup.serialize_element(&self.kind.payload())?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (elapsed, tag, payload): (f64, String, String) = Deserialize::deserialize(deserializer)?;
        let kind = match tag.as_str() {
            "o" => EventKind::Output(payload),
            "i" => EventKind::Input(payload),
            "r" => {
                let (c, r) = payload.split_once('x').ok_or_else(|| {
                    serde::de::Error::custom("resize payload must be colsxrows")
                })?;
                let cols = c.parse().map_err(serde::de::Error::custom)?;
                let rows = r.parse().map_err(serde::de::Error::custom)?;
                EventKind::Resize { cols, rows }
            }
            "x" => EventKind::Exit(payload.parse().map_err(serde::de::Error::custom)?),
            other => return Err(serde::de::Error::custom(format!("unknown event kind: {other}"))),
        };
        Ok(Event { elapsed, kind })
    }
}

/// Append-only writer over the `stdout` asciicast log. One `fs::File` per session, kept
/// open for the session's lifetime; each write is a single buffered line-write followed
/// by an explicit flush (no fsync — spec §4.1 calls this out as fsync-less I/O).
pub struct Writer {
    file: std::fs::File,
    started_at: SystemTime,
}

impl Writer {
    /// Create the log file and write its header line. Errors if the file already exists,
    /// since a session's log is created exactly once.
    pub fn create(path: &Path, header: &Header) -> Result<Self> {
        let mut file = std::fs::OpenOptions::new().create_new(true).write(true).open(path)?;
        let mut line = serde_json::to_vec(header).map_err(|e| Error::Io(std::io::Error::other(e)))?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.flush()?;
        Ok(Self { file, started_at: UNIX_EPOCH + std::time::Duration::from_secs(header.timestamp) })
    }

    fn elapsed(&self) -> f64 {
        SystemTime::now().duration_since(self.started_at).unwrap_or_default().as_secs_f64()
    }

    fn append(&mut self, kind: EventKind) -> Result<()> {
        let event = Event { elapsed: self.elapsed(), kind };
        let mut line = serde_json::to_vec(&event).map_err(|e| Error::Io(std::io::Error::other(e)))?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn output(&mut self, data: &str) -> Result<()> {
        self.append(EventKind::Output(data.to_string()))
    }

    pub fn input(&mut self, data: &str) -> Result<()> {
        self.append(EventKind::Input(data.to_string()))
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.append(EventKind::Resize { cols, rows })
    }

    /// Write the single `"x"` event (invariant P2: exactly one, and nothing follows).
    pub fn exit(&mut self, code: i32) -> Result<()> {
        self.append(EventKind::Exit(code))
    }
}

/// Reads complete lines from an asciicast log starting at a byte offset, tolerating a
/// partially-written trailing line (it is simply not returned until the next read sees
/// a trailing newline for it).
pub struct Reader {
    file: std::fs::File,
    offset: u64,
}

impl Reader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { file: std::fs::File::open(path)?, offset: 0 })
    }

    /// Read the header (first line) without moving the tailing offset.
    pub fn read_header(&mut self) -> Result<Header> {
        use std::io::Seek;
        self.file.seek(std::io::SeekFrom::Start(0))?;
        let mut reader = std::io::BufReader::new(&self.file);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        self.offset = line.len() as u64;
        serde_json::from_str(line.trim_end()).map_err(|e| Error::Io(std::io::Error::other(e)))
    }

    /// Read all complete event lines available since the last call; advances the offset
    /// only past complete (newline-terminated) lines.
    pub fn read_new_events(&mut self) -> Result<Vec<Event>> {
        use std::io::Seek;
        self.file.seek(std::io::SeekFrom::Start(self.offset))?;
        let mut reader = std::io::BufReader::new(&self.file);
        let mut events = Vec::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            if !line.ends_with('\n') {
                // Partial trailing line: don't advance past it, retry on next call.
                break;
            }
            self.offset += n as u64;
            match serde_json::from_str::<Event>(line.trim_end()) {
                Ok(event) => events.push(event),
                Err(_) => continue,
            }
        }
        Ok(events)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_events_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let header = Header::new(80, 24, Some("/bin/sh".to_string()));
        let mut writer = Writer::create(&path, &header).unwrap();
        writer.output("hello\r\n").unwrap();
        writer.input("hi\n").unwrap();
        writer.resize(100, 40).unwrap();
        writer.exit(0).unwrap();

        let mut reader = Reader::open(&path).unwrap();
        let read_header = reader.read_header().unwrap();
        assert_eq!(read_header.width, 80);
        assert_eq!(read_header.height, 24);

        let events = reader.read_new_events().unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].kind, EventKind::Output("hello\r\n".to_string()));
        assert_eq!(events[1].kind, EventKind::Input("hi\n".to_string()));
        assert_eq!(events[2].kind, EventKind::Resize { cols: 100, rows: 40 });
        assert_eq!(events[3].kind, EventKind::Exit(0));
    }

    #[test]
    fn reader_tolerates_partial_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let header = Header::new(80, 24, None);
        let mut writer = Writer::create(&path, &header).unwrap();
        writer.output("a").unwrap();

        let mut reader = Reader::open(&path).unwrap();
        reader.read_header().unwrap();
        let events = reader.read_new_events().unwrap();
        assert_eq!(events.len(), 1);

        // Append a line without the trailing newline directly to simulate a torn write.
        use std::io::Write as _;
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            write!(f, "[1.0,\"o\",\"partial").unwrap();
        }
        let offset_before = reader.offset();
        let events = reader.read_new_events().unwrap();
        assert!(events.is_empty());
        assert_eq!(reader.offset(), offset_before);
    }

    #[test]
    fn wire_array_form_is_stable() {
        let event = Event { elapsed: 1.5, kind: EventKind::Resize { cols: 10, rows: 20 } };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, "[1.5,\"r\",\"10x20\"]");
    }
}
