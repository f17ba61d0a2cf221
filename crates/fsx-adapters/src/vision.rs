use anyhow::Context;
use async_trait::async_trait;

use crate::chat::{ChatClient, ChatMessage};
use crate::{AdapterError, ExtractionSource, PageInput, SourceKind};

pub const TRANSCRIPTION_PROMPT: &str = r#"You are transcribing one page of a financial statement from an image.
This is a transcription task, not a summary: return every visible table row, including
section headings, sub-headings, line items, subtotals and totals. Never merge rows.

Row labels:
- Use the label exactly as printed as the JSON key. Do not add tags such as [TOTAL].
- Headings are normal rows with an empty string for every year.
- "Experian Value" is a short English business translation of the label. If the label is
  already English, copy it. When unsure, give the best translation and lower the
  confidence_score.

Numbers:
- Keep formatting exactly as printed, e.g. 1.389.189 or (122.158).
- Do not remove thousand separators or rewrite negatives.
- A missing value is "".

Notes: "nota" is the note reference printed next to the row, or "" when absent. Never 0.

Return only JSON of this shape:
{
  "page_title": "<string>",
  "years": ["2024", "2023"],
  "rows": {
    "<row label>": {
      "Experian Value": "<english translation>",
      "2024": "<string>",
      "2023": "<string>",
      "nota": "<string>",
      "confidence_score": <number between 0 and 1>
    }
  }
}"#;

/// Image-driven extractor: sends the rendered page to a vision-capable chat model.
/// Without a configured client every call fails with [`AdapterError::Disabled`], which the
/// page loop turns into an empty table.
#[derive(Debug, Clone)]
pub struct VisionExtractor {
    source_id: String,
    client: Option<ChatClient>,
}

impl VisionExtractor {
    pub fn new(source_id: impl Into<String>, client: Option<ChatClient>) -> Self {
        Self {
            source_id: source_id.into(),
            client,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }
}

#[async_trait]
impl ExtractionSource for VisionExtractor {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Vision
    }

    fn is_available(&self) -> bool {
        self.is_configured()
    }

    async fn produce(&self, page: &PageInput) -> Result<String, AdapterError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| AdapterError::Disabled(self.source_id.clone()))?;
        let png = tokio::fs::read(&page.png_path)
            .await
            .with_context(|| format!("reading page image {}", page.png_path.display()))?;
        client
            .complete_json(vec![ChatMessage::user_with_image(TRANSCRIPTION_PROMPT, &png)])
            .await
    }
}
