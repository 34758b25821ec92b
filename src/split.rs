//! Delimited line splitting.

use crate::row::{Record, Value};

/// Split one line into fields on `delimiter`, which may span several characters.
///
/// With a `qualifier`, a field whose first non-blank character is the
/// qualifier is read verbatim up to the closing qualifier, so it may contain
/// the delimiter. A doubled qualifier inside such a field stands for one
/// literal qualifier. A qualifier only closes the field when nothing but
/// blanks separates it from the next delimiter or the end of the line;
/// otherwise it is kept as content.
pub fn split_record(line: &str, delimiter: &str, qualifier: Option<char>) -> Vec<String> {
    if delimiter.is_empty() {
        return vec![line.to_string()];
    }
    let q = match qualifier {
        Some(q) => q,
        None => return line.split(delimiter).map(str::to_string).collect(),
    };

    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut i = 0;

    while i < line.len() {
        let rest = &line[i..];
        if !quoted && rest.starts_with(delimiter) {
            fields.push(std::mem::take(&mut field));
            i += delimiter.len();
            continue;
        }

        let c = match rest.chars().next() {
            Some(c) => c,
            None => break,
        };
        let width = c.len_utf8();

        if c == q {
            if !quoted && field.chars().all(char::is_whitespace) {
                field.clear();
                quoted = true;
                i += width;
                continue;
            }
            if quoted {
                let after = &rest[width..];
                let trimmed = after.trim_start();
                if trimmed.is_empty() || trimmed.starts_with(delimiter) {
                    quoted = false;
                    i += width + (after.len() - trimmed.len());
                    continue;
                }
                if after.starts_with(q) {
                    field.push(q);
                    i += width * 2;
                    continue;
                }
            }
        }

        field.push(c);
        i += width;
    }

    fields.push(field);
    fields
}

/// Split a line into a record of text values, mapping `null_value` to [`Value::Null`]
pub fn split_to_record(
    line: &str,
    delimiter: &str,
    qualifier: Option<char>,
    null_value: Option<&str>,
) -> Record {
    split_record(line, delimiter, qualifier)
        .into_iter()
        .map(|field| match null_value {
            Some(null) if field == null => Value::Null,
            _ => Value::Text(field),
        })
        .collect()
}
