//! Event sinks for the XML renderer.
//!
//! | Sink | Does |
//! |------|------|
//! | [`XmlWriterSink`] | serialises events back to XML through `quick_xml::Writer` |
//! | [`RecordingSink`] | keeps events in memory for later replay |

use std::io::Write;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::Error;

/// One attribute of a started element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub ns: Option<String>,
    pub local: String,
    pub qname: String,
    pub value: String,
}

impl Attribute {
    pub fn new(qname: impl Into<String>, value: impl Into<String>) -> Self {
        let qname = qname.into();
        let local = qname.rsplit(':').next().unwrap_or_default().to_owned();
        Attribute { ns: None, local, qname, value: value.into() }
    }
}

/// Receiver of rendered XML content.
pub trait EventSink {
    fn start_element(&mut self, ns: Option<&str>, local: &str, qname: &str, attrs: &[Attribute]) -> Result<(), Error>;
    fn characters(&mut self, text: &str) -> Result<(), Error>;
    fn end_element(&mut self, ns: Option<&str>, local: &str, qname: &str) -> Result<(), Error>;
}

// ── Writer sink ───────────────────────────────────────────────────────────────

pub struct XmlWriterSink<W: Write> {
    writer: Writer<W>,
}

fn xml_error(e: impl std::fmt::Display) -> Error {
    Error::Xml(e.to_string())
}

impl<W: Write> XmlWriterSink<W> {
    pub fn new(inner: W) -> Self {
        XmlWriterSink { writer: Writer::new(inner) }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl XmlWriterSink<Vec<u8>> {
    pub fn to_memory() -> Self {
        XmlWriterSink::new(Vec::new())
    }

    /// The XML written so far.
    pub fn into_string(self) -> Result<String, Error> {
        String::from_utf8(self.into_inner()).map_err(xml_error)
    }
}

impl<W: Write> EventSink for XmlWriterSink<W> {
    fn start_element(&mut self, _ns: Option<&str>, _local: &str, qname: &str, attrs: &[Attribute]) -> Result<(), Error> {
        let mut start = BytesStart::new(qname);
        for a in attrs {
            start.push_attribute((a.qname.as_str(), a.value.as_str()));
        }
        self.writer.write_event(Event::Start(start)).map_err(xml_error)
    }

    fn characters(&mut self, text: &str) -> Result<(), Error> {
        if text.is_empty() {
            return Ok(());
        }
        self.writer.write_event(Event::Text(BytesText::new(text))).map_err(xml_error)
    }

    fn end_element(&mut self, _ns: Option<&str>, _local: &str, qname: &str) -> Result<(), Error> {
        self.writer.write_event(Event::End(BytesEnd::new(qname))).map_err(xml_error)
    }
}

// ── Recording sink ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Start { ns: Option<String>, local: String, qname: String, attrs: Vec<Attribute> },
    Text(String),
    End { ns: Option<String>, local: String, qname: String },
}

/// Buffers events so they can be dropped or replayed into another sink.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<SinkEvent>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send every buffered event to `sink`, in order.
    pub fn replay(&self, sink: &mut dyn EventSink) -> Result<(), Error> {
        for event in &self.events {
            match event {
                SinkEvent::Start { ns, local, qname, attrs } => sink.start_element(ns.as_deref(), local, qname, attrs)?,
                SinkEvent::Text(t) => sink.characters(t)?,
                SinkEvent::End { ns, local, qname } => sink.end_element(ns.as_deref(), local, qname)?,
            }
        }
        Ok(())
    }

    /// Concatenated character data.
    pub fn text(&self) -> String {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn start_element(&mut self, ns: Option<&str>, local: &str, qname: &str, attrs: &[Attribute]) -> Result<(), Error> {
        self.events.push(SinkEvent::Start {
            ns: ns.map(str::to_owned),
            local: local.to_owned(),
            qname: qname.to_owned(),
            attrs: attrs.to_vec(),
        });
        Ok(())
    }

    fn characters(&mut self, text: &str) -> Result<(), Error> {
        match self.events.last_mut() {
            Some(SinkEvent::Text(prev)) => prev.push_str(text),
            _ => self.events.push(SinkEvent::Text(text.to_owned())),
        }
        Ok(())
    }

    fn end_element(&mut self, ns: Option<&str>, local: &str, qname: &str) -> Result<(), Error> {
        self.events.push(SinkEvent::End {
            ns: ns.map(str::to_owned),
            local: local.to_owned(),
            qname: qname.to_owned(),
        });
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_escapes_text_and_attributes() {
        let mut sink = XmlWriterSink::to_memory();
        sink.start_element(None, "p", "p", &[Attribute::new("title", "a<b")]).unwrap();
        sink.characters("x & y").unwrap();
        sink.end_element(None, "p", "p").unwrap();
        assert_eq!(sink.into_string().unwrap(), "<p title=\"a&lt;b\">x &amp; y</p>");
    }

    #[test]
    fn recording_merges_text_and_replays() {
        let mut rec = RecordingSink::new();
        rec.start_element(Some("urn:x"), "a", "x:a", &[]).unwrap();
        rec.characters("one ").unwrap();
        rec.characters("two").unwrap();
        rec.end_element(Some("urn:x"), "a", "x:a").unwrap();
        assert_eq!(rec.events.len(), 3);
        assert_eq!(rec.text(), "one two");

        let mut out = XmlWriterSink::to_memory();
        rec.replay(&mut out).unwrap();
        assert_eq!(out.into_string().unwrap(), "<x:a>one two</x:a>");
    }

    #[test]
    fn attribute_local_name() {
        let a = Attribute::new("xml:lang", "en");
        assert_eq!(a.local, "lang");
        assert_eq!(Attribute::new("id", "1").local, "id");
    }
}
