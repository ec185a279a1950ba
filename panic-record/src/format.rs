use crate::PanicRecord;
use serde::Serialize;
use std::fmt::Write;

/// The rule line that opens and closes every formatted record
pub const RULE: &str =
    "********************************************************************************";

/// Renders a record into its fixed textual layout.
///
/// The output is a pure function of the record, formatting the same record
/// twice always yields identical strings.
///
/// ```text
/// ****...****
/// <message>
///
/// Native stack:
/// 	<frame>
///
/// Logical stack:
/// 	<frame>
///
/// Details:
/// 	<details as JSON, indented by 4 spaces>
/// ****...****
/// ```
pub fn format(record: &PanicRecord) -> String {
    let stack = record.stack();

    let mut out = String::new();

    // Writing to a String can't fail
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "{}", record.message());
    out.push('\n');

    out.push_str("Native stack:\n");
    push_indented(&mut out, stack.native.iter().map(|frame| frame.to_string()));
    out.push('\n');

    out.push_str("Logical stack:\n");
    push_indented(&mut out, stack.logical.iter().cloned());
    out.push('\n');

    out.push_str("Details:\n");
    push_indented(&mut out, pretty_details(record.details()).lines().map(String::from));

    let _ = writeln!(out, "{RULE}");

    out
}

/// Appends each line prefixed by a tab. An empty block still emits a single
/// tab line so that every section has the same shape.
fn push_indented(out: &mut String, lines: impl Iterator<Item = String>) {
    let mut wrote = false;

    for line in lines {
        out.push('\t');
        out.push_str(&line);
        out.push('\n');
        wrote = true;
    }

    if !wrote {
        out.push_str("\t\n");
    }
}

fn pretty_details(details: &serde_json::Value) -> String {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);

    if details.serialize(&mut ser).is_err() {
        return details.to_string();
    }

    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod test {
    use super::{RULE, format};
    use crate::{Frame, PanicRecord, Stack};

    fn record() -> PanicRecord {
        PanicRecord::with_stack(
            "divide by zero",
            serde_json::json!({ "type": "arithmetic", "address": "0x1000" }),
            Stack {
                native: vec![
                    Frame::Resolved {
                        address: 0x1000,
                        module: "app".to_owned(),
                        symbol: "main".to_owned(),
                        offset: 0x10,
                    },
                    Frame::Unresolved {
                        address: 0x2000,
                        module: None,
                    },
                ],
                logical: vec!["handler::on_exception".to_owned()],
            },
        )
    }

    #[test]
    fn renders_layout() {
        let expected = format!(
            "{RULE}
divide by zero

Native stack:
\t0x1000 app!main+0x10
\t0x2000

Logical stack:
\thandler::on_exception

Details:
\t{{
\t    \"address\": \"0x1000\",
\t    \"type\": \"arithmetic\"
\t}}
{RULE}
"
        );

        assert_eq!(format(&record()), expected);
    }

    #[test]
    fn is_deterministic() {
        let record = record();
        let first = format(&record);

        assert_eq!(first, format(&record));
        assert_eq!(first, record.to_string());

        let mut lines = first.lines();
        assert_eq!(lines.next(), Some(RULE));
        assert_eq!(lines.last(), Some(RULE));
    }

    #[test]
    fn empty_sections() {
        let record = PanicRecord::with_stack(
            "abort was called",
            serde_json::json!({}),
            Stack {
                native: Vec::new(),
                logical: Vec::new(),
            },
        );

        let expected = format!(
            "{RULE}\nabort was called\n\nNative stack:\n\t\n\nLogical stack:\n\t\n\nDetails:\n\t{{}}\n{RULE}\n"
        );

        assert_eq!(format(&record), expected);
    }
}
