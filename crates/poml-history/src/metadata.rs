use chrono::{DateTime, Utc};
use poml_core::ConversionRecord;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const PREVIEW_CHARS: usize = 60;

/// Summary of a conversion for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSummary {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub input_preview: String,
    pub document_chars: usize,
}

impl From<&ConversionRecord> for RecordSummary {
    fn from(record: &ConversionRecord) -> Self {
        Self {
            id: record.id,
            created_at: record.created_at,
            input_preview: preview(&record.input_text),
            document_chars: record.output_document.chars().count(),
        }
    }
}

fn preview(text: &str) -> String {
    let single_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= PREVIEW_CHARS {
        return single_line;
    }
    let cut: String = single_line.chars().take(PREVIEW_CHARS).collect();
    format!("{cut}...")
}
