//! COPY text-format row encoding
//!
//! PostgreSQL's COPY ... FROM STDIN text protocol: tab-separated fields,
//! `\N` for NULL, backslash escapes for the characters that would otherwise
//! break the row framing.

use chrono::NaiveDate;

/// Builder for one COPY text-format row
#[derive(Debug, Default)]
pub struct CopyRow {
    line: String,
    fields: usize,
}

impl CopyRow {
    pub fn new() -> Self {
        Self::default()
    }

    fn separator(&mut self) {
        if self.fields > 0 {
            self.line.push('\t');
        }
        self.fields += 1;
    }

    pub fn null(mut self) -> Self {
        self.separator();
        self.line.push_str("\\N");
        self
    }

    pub fn text(mut self, value: &str) -> Self {
        self.separator();
        escape_into(&mut self.line, value);
        self
    }

    pub fn opt_text(self, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.text(value),
            None => self.null(),
        }
    }

    pub fn int(mut self, value: i64) -> Self {
        self.separator();
        self.line.push_str(&value.to_string());
        self
    }

    pub fn bool(mut self, value: bool) -> Self {
        self.separator();
        self.line.push(if value { 't' } else { 'f' });
        self
    }

    pub fn opt_date(mut self, value: Option<NaiveDate>) -> Self {
        match value {
            // NaiveDate displays as ISO 8601, which COPY accepts for DATE
            Some(date) => {
                self.separator();
                self.line.push_str(&date.to_string());
                self
            },
            None => self.null(),
        }
    }

    /// Terminate the row
    pub fn finish(mut self) -> String {
        self.line.push('\n');
        self.line
    }
}

/// Escape a value for the COPY text format
fn escape_into(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_row() {
        let row = CopyRow::new().int(42).text("hello").finish();
        assert_eq!(row, "42\thello\n");
    }

    #[test]
    fn test_null_fields() {
        let row = CopyRow::new().int(1).opt_text(None).opt_date(None).finish();
        assert_eq!(row, "1\t\\N\t\\N\n");
    }

    #[test]
    fn test_escaping() {
        let row = CopyRow::new().text("a\tb\nc\\d\re").finish();
        assert_eq!(row, "a\\tb\\nc\\\\d\\re\n");
    }

    #[test]
    fn test_date_and_bool() {
        let date = NaiveDate::from_ymd_opt(2022, 10, 15);
        let row = CopyRow::new().opt_date(date).bool(true).bool(false).finish();
        assert_eq!(row, "2022-10-15\tt\tf\n");
    }

    #[test]
    fn test_json_payload_round_trips_escaping() {
        // A JSON string containing a backslash and tab must survive COPY
        let payload = serde_json::json!({"text": "a\\b\tc"}).to_string();
        let row = CopyRow::new().int(7).text(&payload).finish();
        assert_eq!(row, "7\t{\"text\":\"a\\\\\\\\b\\\\tc\"}\n");
    }
}
