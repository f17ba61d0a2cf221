use std::path::PathBuf;

use fsx_adapters::{
    extract_page, load_ocr_page, parse_notes_page, parse_row_table, read_json_file,
    OcrLayoutExtractor, PageInput,
};
use fsx_core::{NotesPage, RowTable};

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

#[test]
fn vision_payload_matches_snapshot() {
    let raw = std::fs::read_to_string(fixtures_root().join("vision/page_005.raw.txt")).unwrap();
    let table = parse_row_table(&raw).unwrap();
    let expected: RowTable = read_json_file(fixtures_root().join("vision/page_005.expected.json")).unwrap();
    assert_eq!(table, expected);
    assert_eq!(
        table.rows.keys().collect::<Vec<_>>(),
        expected.rows.keys().collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn ocr_words_match_snapshot() {
    let ocr = load_ocr_page(fixtures_root().join("ocr/page_005.words.json"))
        .await
        .unwrap();
    assert_eq!(ocr.lines.len(), 5);
    assert!(ocr.text.starts_with("Rakstrarroknskapur\nNota 2024 2023"));

    let page = PageInput {
        page_number: 5,
        png_path: fixtures_root().join("ocr/page_005.png"),
        ocr: Some(ocr),
    };
    let source = OcrLayoutExtractor::new("ocr_layout");
    let extraction = extract_page(&source, &page).await;
    let expected: RowTable = read_json_file(fixtures_root().join("ocr/page_005.expected.json")).unwrap();
    assert_eq!(extraction.table, expected);
    assert!(extraction.raw.is_some());
}

#[test]
fn notes_payload_matches_snapshot() {
    let raw = std::fs::read_to_string(fixtures_root().join("notes/page_012.raw.txt")).unwrap();
    let notes = parse_notes_page(&raw).unwrap();
    let expected: NotesPage = read_json_file(fixtures_root().join("notes/page_012.expected.json")).unwrap();
    assert_eq!(notes, expected);
    assert_eq!(notes.tables().count(), 1);
}
