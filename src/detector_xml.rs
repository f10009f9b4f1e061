use std::io::Cursor;

use anyhow::{anyhow, bail, Context as _, Result};
use camino::Utf8Path;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::detector::{
    Detector, EndOffset, Operation, Rule, SizeCompare, SizeOperand, Test, TestOp,
};

/// Offsets in detector files are hex, optionally signed.
fn parse_offset(s: &str) -> Result<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let digits = digits.strip_prefix("0x").unwrap_or(digits);
    let value = i64::from_str_radix(digits, 16)
        .map_err(|_| anyhow!("invalid offset '{}' in detector", s))?;
    Ok(if negative { -value } else { value })
}

fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => bail!("invalid boolean '{}' in detector", other),
    }
}

fn emit_offset(value: i64) -> String {
    if value < 0 {
        format!("-{:x}", -value)
    } else {
        format!("{:x}", value)
    }
}

struct RawAttrs(Vec<(String, String)>);

impl RawAttrs {
    fn read(start: &BytesStart) -> Result<Self> {
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr.context("malformed attribute in detector")?;
            attrs.push((
                String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
                String::from_utf8_lossy(&attr.value).into_owned(),
            ));
        }
        Ok(RawAttrs(attrs))
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn parse_data_test(attrs: &RawAttrs, op: TestOp) -> Result<Test> {
    let value = hex::decode(attrs.get("value").unwrap_or_default())
        .map_err(|_| anyhow!("invalid value in detector test"))?;
    let mask = match attrs.get("mask") {
        Some(mask) if !mask.is_empty() => {
            let mask = hex::decode(mask).map_err(|_| anyhow!("invalid mask in detector test"))?;
            if mask.len() != value.len() {
                bail!("detector test mask and value lengths differ");
            }
            Some(mask)
        }
        _ => None,
    };
    Ok(Test::Data {
        op,
        offset: attrs.get("offset").map(parse_offset).transpose()?.unwrap_or(0),
        mask,
        value,
        result: attrs.get("result").map(parse_bool).transpose()?.unwrap_or(true),
    })
}

fn parse_file_test(attrs: &RawAttrs) -> Result<Test> {
    let size = match attrs.get("size") {
        Some("PO2") | Some("po2") | None => SizeOperand::PowerOfTwo,
        Some(size) => SizeOperand::Size(parse_offset(size)? as u64),
    };
    let compare = match attrs.get("operator") {
        Some("less") => SizeCompare::Less,
        Some("greater") => SizeCompare::Greater,
        _ => SizeCompare::Equal,
    };
    Ok(Test::FileSize {
        compare,
        size,
        result: attrs.get("result").map(parse_bool).transpose()?.unwrap_or(true),
    })
}

/// Parse a clrmamepro header-detector XML document.
pub fn parse(text: &str) -> Result<Detector> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut detector = Detector::default();
    let mut rule: Option<Rule> = None;
    let mut text_target: Option<String> = None;

    loop {
        let event = reader.read_event().context("malformed detector XML")?;
        match event {
            Event::Start(ref start) | Event::Empty(ref start) => {
                let empty = matches!(event, Event::Empty(_));
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let attrs = RawAttrs::read(start)?;
                match name.as_str() {
                    "detector" => {}
                    "name" | "author" | "version" => {
                        if !empty {
                            text_target = Some(name);
                        }
                    }
                    "rule" => {
                        let new_rule = Rule {
                            start_offset: attrs
                                .get("start_offset")
                                .map(parse_offset)
                                .transpose()?
                                .unwrap_or(0),
                            end_offset: match attrs.get("end_offset") {
                                Some("EOF") | None => EndOffset::Eof,
                                Some(offset) => EndOffset::Offset(parse_offset(offset)?),
                            },
                            operation: match attrs.get("operation") {
                                Some("bitswap") => Operation::BitSwap,
                                Some("byteswap") => Operation::ByteSwap,
                                Some("wordswap") => Operation::WordSwap,
                                Some("none") | None => Operation::None,
                                Some(other) => bail!("unknown detector operation '{}'", other),
                            },
                            tests: Vec::new(),
                        };
                        if rule.is_some() {
                            bail!("nested rule in detector");
                        }
                        if empty {
                            detector.rules.push(new_rule);
                        } else {
                            rule = Some(new_rule);
                        }
                    }
                    "data" | "or" | "and" | "xor" | "file" => {
                        let test = match name.as_str() {
                            "data" => parse_data_test(&attrs, TestOp::Data)?,
                            "or" => parse_data_test(&attrs, TestOp::Or)?,
                            "and" => parse_data_test(&attrs, TestOp::And)?,
                            "xor" => parse_data_test(&attrs, TestOp::Xor)?,
                            _ => parse_file_test(&attrs)?,
                        };
                        rule.as_mut()
                            .ok_or_else(|| anyhow!("detector test outside a rule"))?
                            .tests
                            .push(test);
                    }
                    other => bail!("unknown element '{}' in detector", other),
                }
            }
            Event::Text(text) => {
                if let Some(target) = text_target.take() {
                    let value = text.unescape()?.into_owned();
                    match target.as_str() {
                        "name" => detector.name = value,
                        "author" => detector.author = value,
                        "version" => detector.version = value,
                        _ => {}
                    }
                }
            }
            Event::End(end) => {
                if end.name().as_ref() == b"rule" {
                    if let Some(rule) = rule.take() {
                        detector.rules.push(rule);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(detector)
}

pub fn parse_file(path: &Utf8Path) -> Result<Detector> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read detector file '{}'", path))?;
    parse(&text).with_context(|| format!("cannot parse detector file '{}'", path))
}

/// Emit the same clrmamepro format the parser accepts; parse-then-emit is
/// the identity modulo whitespace.
pub fn emit(detector: &Detector) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer.write_event(Event::Start(BytesStart::new("detector")))?;
    for (element, value) in [
        ("name", &detector.name),
        ("author", &detector.author),
        ("version", &detector.version),
    ] {
        writer.write_event(Event::Start(BytesStart::new(element)))?;
        writer.write_event(Event::Text(BytesText::new(value)))?;
        writer.write_event(Event::End(BytesEnd::new(element)))?;
    }

    for rule in &detector.rules {
        let mut start = BytesStart::new("rule");
        start.push_attribute(("start_offset", emit_offset(rule.start_offset).as_str()));
        match rule.end_offset {
            EndOffset::Eof => start.push_attribute(("end_offset", "EOF")),
            EndOffset::Offset(offset) => {
                start.push_attribute(("end_offset", emit_offset(offset).as_str()))
            }
        }
        if rule.operation != Operation::None {
            let operation = match rule.operation {
                Operation::BitSwap => "bitswap",
                Operation::ByteSwap => "byteswap",
                Operation::WordSwap => "wordswap",
                Operation::None => unreachable!(),
            };
            start.push_attribute(("operation", operation));
        }
        writer.write_event(Event::Start(start))?;

        for test in &rule.tests {
            match test {
                Test::Data {
                    op,
                    offset,
                    mask,
                    value,
                    result,
                } => {
                    let element = match op {
                        TestOp::Data => "data",
                        TestOp::Or => "or",
                        TestOp::And => "and",
                        TestOp::Xor => "xor",
                    };
                    let mut start = BytesStart::new(element);
                    start.push_attribute(("offset", emit_offset(*offset).as_str()));
                    if let Some(mask) = mask {
                        start.push_attribute(("mask", hex::encode(mask).as_str()));
                    }
                    start.push_attribute(("value", hex::encode(value).as_str()));
                    start.push_attribute(("result", if *result { "true" } else { "false" }));
                    writer.write_event(Event::Empty(start))?;
                }
                Test::FileSize {
                    compare,
                    size,
                    result,
                } => {
                    let mut start = BytesStart::new("file");
                    match size {
                        SizeOperand::PowerOfTwo => start.push_attribute(("size", "PO2")),
                        SizeOperand::Size(size) => {
                            start.push_attribute(("size", format!("{:x}", size).as_str()))
                        }
                    }
                    let operator = match compare {
                        SizeCompare::Equal => "equal",
                        SizeCompare::Less => "less",
                        SizeCompare::Greater => "greater",
                    };
                    start.push_attribute(("operator", operator));
                    start.push_attribute(("result", if *result { "true" } else { "false" }));
                    writer.write_event(Event::Empty(start))?;
                }
            }
        }

        writer.write_event(Event::End(BytesEnd::new("rule")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("detector")))?;
    Ok(String::from_utf8(writer.into_inner().into_inner())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<detector>
  <name>No-Intro_NES</name>
  <author>somebody</author>
  <version>20080328</version>
  <rule start_offset="10" end_offset="EOF">
    <data offset="0" value="4e45531a" result="true"/>
    <file size="PO2" operator="equal" result="false"/>
  </rule>
</detector>
"#;

    #[test]
    fn parses_the_clrmamepro_format() {
        let detector = parse(SAMPLE).unwrap();
        assert_eq!(detector.name, "No-Intro_NES");
        assert_eq!(detector.rules.len(), 1);
        let rule = &detector.rules[0];
        assert_eq!(rule.start_offset, 0x10);
        assert_eq!(rule.end_offset, EndOffset::Eof);
        assert_eq!(rule.tests.len(), 2);
        assert_eq!(
            rule.tests[0],
            Test::Data {
                op: TestOp::Data,
                offset: 0,
                mask: None,
                value: vec![0x4e, 0x45, 0x53, 0x1a],
                result: true,
            }
        );
        assert_eq!(
            rule.tests[1],
            Test::FileSize {
                compare: SizeCompare::Equal,
                size: SizeOperand::PowerOfTwo,
                result: false,
            }
        );
    }

    #[test]
    fn parse_emit_parse_is_identity() {
        let detector = parse(SAMPLE).unwrap();
        let emitted = emit(&detector).unwrap();
        let reparsed = parse(&emitted).unwrap();
        assert_eq!(detector, reparsed);
    }

    #[test]
    fn negative_offsets_round_trip() {
        let detector = Detector {
            name: "tail".to_owned(),
            author: String::new(),
            version: String::new(),
            rules: vec![Rule {
                start_offset: 0,
                end_offset: EndOffset::Offset(-0x80),
                operation: Operation::ByteSwap,
                tests: vec![Test::Data {
                    op: TestOp::Xor,
                    offset: -0x10,
                    mask: Some(vec![0xff, 0x0f]),
                    value: vec![0xaa, 0x05],
                    result: true,
                }],
            }],
        };
        let reparsed = parse(&emit(&detector).unwrap()).unwrap();
        assert_eq!(detector, reparsed);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("<detector><rule><bogus/></rule></detector>").is_err());
        assert!(parse(r#"<detector><rule start_offset="zz"/></detector>"#).is_err());
    }
}
