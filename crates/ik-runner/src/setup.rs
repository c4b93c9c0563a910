use anyhow::{anyhow, Result};
use quick_xml::escape::escape;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::Serialize;
use std::path::PathBuf;

const TOOL_TAG: &str = "InverseKinematicsTool";

/// Everything the solver is told about one trial. Built fresh per trial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IkSetup {
    pub name: String,
    pub model_file: PathBuf,
    pub marker_file: PathBuf,
    pub output_motion_file: PathBuf,
    pub results_directory: PathBuf,
    pub start_time: f64,
    pub end_time: f64,
}

impl IkSetup {
    pub fn time_range(&self) -> String {
        format!("{} {}", self.start_time, self.end_time)
    }

    fn fields(&self) -> [(&'static str, String); 5] {
        [
            ("model_file", self.model_file.display().to_string()),
            ("marker_file", self.marker_file.display().to_string()),
            ("output_motion_file", self.output_motion_file.display().to_string()),
            ("results_directory", self.results_directory.display().to_string()),
            ("time_range", self.time_range()),
        ]
    }
}

/// Name of the document's root element, if it has one.
pub(crate) fn root_element(xml: &str) -> Result<Option<String>> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) | Event::Empty(ref e) => {
                return Ok(Some(String::from_utf8_lossy(e.name().as_ref()).into_owned()));
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
        buf.clear();
    }
}

pub(crate) fn validate_template(xml: &str) -> Result<()> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut found = false;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) | Event::Empty(ref e) if e.name().as_ref() == TOOL_TAG.as_bytes() => {
                found = true;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if !found {
        return Err(anyhow!("setup template has no <{}> element", TOOL_TAG));
    }
    Ok(())
}

/// Writes the trial's fields into the first `InverseKinematicsTool` of a setup
/// document. Only direct children of the tool are touched; fields missing from
/// the template are added at the end of the tool element.
pub fn render_setup(template: &str, setup: &IkSetup) -> Result<String> {
    let fields = setup.fields();
    let mut written = [false; 5];
    let mut reader = Reader::from_str(template);
    let mut writer = Writer::new(Vec::new());
    let mut buf = Vec::new();
    let mut skip_buf = Vec::new();
    let mut depth = 0usize;
    // Depth of the tool's children while inside it.
    let mut tool_depth: Option<usize> = None;
    let mut tool_done = false;
    let mut last_text = String::new();

    loop {
        let text_before = std::mem::take(&mut last_text);
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) if !tool_done && tool_depth.is_none() && is_tool(e) => {
                writer.write_event(Event::Start(renamed_tool(e, &setup.name)?))?;
                depth += 1;
                tool_depth = Some(depth);
            }
            Event::Empty(ref e) if !tool_done && tool_depth.is_none() && is_tool(e) => {
                writer.write_event(Event::Start(renamed_tool(e, &setup.name)?))?;
                write_missing_fields(&mut writer, &fields, &written, "")?;
                writer.write_event(Event::End(BytesEnd::new(TOOL_TAG)))?;
                tool_done = true;
            }
            Event::Start(ref e) if tool_depth == Some(depth) => {
                match field_index(&fields, e) {
                    Some(idx) => {
                        let end = e.to_end().into_owned();
                        reader.read_to_end_into(end.name(), &mut skip_buf)?;
                        skip_buf.clear();
                        write_field(&mut writer, fields[idx].0, &fields[idx].1)?;
                        written[idx] = true;
                    }
                    None => {
                        writer.write_event(Event::Start(e.clone()))?;
                        depth += 1;
                    }
                }
            }
            Event::Empty(ref e) if tool_depth == Some(depth) => match field_index(&fields, e) {
                Some(idx) => {
                    write_field(&mut writer, fields[idx].0, &fields[idx].1)?;
                    written[idx] = true;
                }
                None => writer.write_event(Event::Empty(e.clone()))?,
            },
            Event::Start(ref e) => {
                writer.write_event(Event::Start(e.clone()))?;
                depth += 1;
            }
            Event::End(ref e) => {
                if tool_depth == Some(depth) {
                    let indent = trailing_indent(&text_before);
                    write_missing_fields(&mut writer, &fields, &written, indent)?;
                    tool_depth = None;
                    tool_done = true;
                }
                writer.write_event(Event::End(e.clone()))?;
                depth = depth.saturating_sub(1);
            }
            Event::Text(ref e) => {
                last_text = String::from_utf8_lossy(e).into_owned();
                writer.write_event(Event::Text(e.clone()))?;
            }
            Event::Eof => break,
            other => writer.write_event(other)?,
        }
        buf.clear();
    }

    if !tool_done {
        return Err(anyhow!("setup template has no <{}> element", TOOL_TAG));
    }
    Ok(String::from_utf8(writer.into_inner())?)
}

fn is_tool(e: &BytesStart<'_>) -> bool {
    e.name().as_ref() == TOOL_TAG.as_bytes()
}

fn field_index(fields: &[(&'static str, String)], e: &BytesStart<'_>) -> Option<usize> {
    fields
        .iter()
        .position(|(tag, _)| e.name().as_ref() == tag.as_bytes())
}

/// Tool start tag with its `name` attribute set, other attributes kept in order.
fn renamed_tool(e: &BytesStart<'_>, name: &str) -> Result<BytesStart<'static>> {
    let mut start = BytesStart::new(TOOL_TAG);
    let mut named = false;
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == b"name" {
            start.push_attribute(("name", name));
            named = true;
        } else {
            start.push_attribute(attr);
        }
    }
    if !named {
        start.push_attribute(("name", name));
    }
    Ok(start)
}

fn write_field(writer: &mut Writer<Vec<u8>>, tag: &str, value: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::from_escaped(escape(value))))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

fn write_missing_fields(
    writer: &mut Writer<Vec<u8>>,
    fields: &[(&'static str, String)],
    written: &[bool],
    indent: &str,
) -> Result<()> {
    for ((tag, value), done) in fields.iter().zip(written) {
        if *done {
            continue;
        }
        if indent.is_empty() {
            write_field(writer, tag, value)?;
        } else {
            writer.write_event(Event::Text(BytesText::from_escaped("\t")))?;
            write_field(writer, tag, value)?;
            writer.write_event(Event::Text(BytesText::from_escaped(format!("\n{}", indent))))?;
        }
    }
    Ok(())
}

/// Indentation of the line a closing tag sits on, from the whitespace before it.
/// Empty when the tag does not start its own line.
fn trailing_indent(text: &str) -> &str {
    match text.rfind('\n') {
        Some(nl) if text.chars().all(char::is_whitespace) => &text[nl + 1..],
        _ => "",
    }
}
