use std::path::Path;
use std::sync::Arc;

use fsx_adapters::{ChatClient, ChatSettings, CoverReader, NotesExtractor, OcrPage, PageInput};
use fsx_core::{JobMeta, NoteValue};
use fsx_storage::{BackoffPolicy, HttpClientConfig, JsonHttpClient};
use httpmock::prelude::*;
use serde_json::json;

fn chat_client(server: &MockServer) -> ChatClient {
    let http = JsonHttpClient::new(HttpClientConfig {
        backoff: BackoffPolicy {
            retries: 0,
            ..BackoffPolicy::default()
        },
        ..HttpClientConfig::default()
    })
    .unwrap();
    ChatClient::new(
        Arc::new(http),
        ChatSettings {
            base_url: server.base_url(),
            api_key: "test-key".into(),
            model: "vision-test".into(),
        },
    )
}

fn reply(content: &str) -> serde_json::Value {
    json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
}

fn page_image(dir: &Path) -> std::path::PathBuf {
    let png = dir.join("page_001.png");
    std::fs::write(&png, b"\x89PNG").unwrap();
    png
}

#[tokio::test]
async fn cover_fields_come_from_the_model() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(reply(
                r#"{"company_name": "ACME P/F", "publication_year": "2024", "publication_date": "31. desember 2024"}"#,
            ));
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let reader = CoverReader::new(Some(chat_client(&server)));
    let fields = reader.read(&page_image(dir.path())).await.unwrap();
    mock.assert_async().await;

    let mut meta = JobMeta {
        company_name: Some("ACME".into()),
        pdf_idnumber: Some("1234".into()),
        ..JobMeta::default()
    };
    fields.apply_to(&mut meta);
    assert_eq!(meta.company_name.as_deref(), Some("ACME P/F"));
    assert_eq!(meta.publication_year.as_deref(), Some("2024"));
    assert_eq!(meta.publication_date.as_deref(), Some("20241231"));
    assert_eq!(meta.pdf_idnumber.as_deref(), Some("1234"));
}

#[tokio::test]
async fn notes_are_read_by_the_model() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(reply(
                r#"{"page_title": "Notur", "sections": [{"title": "3. Skattur", "tables": [{"columns": ["2024"], "rows": [{"name": "Skattur", "values": {"2024": "-1.200"}}]}]}]}"#,
            ));
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let page = PageInput {
        page_number: 12,
        png_path: page_image(dir.path()),
        ocr: None,
    };
    let extraction = NotesExtractor::new(Some(chat_client(&server))).extract(&page).await;
    assert!(extraction.raw.is_some());
    assert_eq!(extraction.notes.sections[0].title, "3. Skattur");
    let table = extraction.notes.tables().next().unwrap();
    assert_eq!(table.rows[0].values["2024"], NoteValue::Number(-1200.0));
}

#[tokio::test]
async fn failed_model_call_falls_back_to_ocr_notes() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(401).body("bad key");
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let page = PageInput {
        page_number: 12,
        png_path: page_image(dir.path()),
        ocr: Some(OcrPage {
            text: "Notur\nNota 2024 2023\nSkattur (1.200) 900\n".into(),
            ..OcrPage::default()
        }),
    };
    let extraction = NotesExtractor::new(Some(chat_client(&server))).extract(&page).await;
    assert!(extraction.raw.is_none());
    assert_eq!(extraction.notes.page_title, "Notur");
    let table = extraction.notes.tables().next().unwrap();
    assert_eq!(table.columns, vec!["2024", "2023"]);
    assert_eq!(table.rows[0].values["2024"], NoteValue::Number(-1200.0));
    assert_eq!(table.rows[0].values["2023"], NoteValue::Number(900.0));
}
