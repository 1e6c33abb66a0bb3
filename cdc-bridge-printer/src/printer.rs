use std::io::Write;

use serde_json::Value;

/// Writes records one per line, prefixed with the table they came from.
pub struct RecordPrinter<W: Write> {
    out: W,
    printed: u64,
}

impl<W: Write> RecordPrinter<W> {
    pub fn new(out: W) -> Self {
        RecordPrinter { out, printed: 0 }
    }

    pub fn print(&mut self, record: &Value) -> anyhow::Result<()> {
        let metadata = &record["metadata"];
        writeln!(
            self.out,
            "{}.{}: before: {}, after: {}",
            metadata["database"].as_str().unwrap_or("?"),
            metadata["table"].as_str().unwrap_or("?"),
            fields(&record["before"]),
            fields(&record["after"]),
        )?;
        self.printed += 1;
        Ok(())
    }

    pub fn printed(&self) -> u64 {
        self.printed
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn fields(image: &Value) -> String {
    match image.get("fields") {
        Some(fields) => fields.to_string(),
        None => "null".to_string(),
    }
}
