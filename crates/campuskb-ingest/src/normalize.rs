//! Per-source-type normalization into plain paragraph text.
//!
//! Every normalizer produces text where paragraphs are separated by a blank
//! line and lines within a paragraph by a single newline, which is what the
//! chunker expects. Malformed input is a `DocumentFormat` error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use campuskb_core::{Error, Result};
use campuskb_store::SourceType;

use crate::extract;

static EXCESS_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static INLINE_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{a0}]+").unwrap());

static MD_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").unwrap());
static MD_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\([^)]*\)").unwrap());
static MD_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]{0,3}#{1,6}[ \t]*").unwrap());
static MD_EMPHASIS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\*\*|__|\*|_|~~)([^*_~\n]+)(\*\*|__|\*|_|~~)").unwrap());
static MD_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]*)`").unwrap());
static MD_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]*```.*$").unwrap());
static MD_RULE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]*([-*_][ \t]*){3,}$").unwrap());
static MD_QUOTE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]*>[ \t]?").unwrap());
static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").unwrap());

static PDF_HYPHEN_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\w)-\n(\w)").unwrap());

/// Normalize a raw payload. `label` names the document in errors.
///
/// PDF payloads may be the file itself or text already extracted from it;
/// Word payloads must be the .docx file.
pub fn normalize(source_type: SourceType, label: &str, payload: &[u8]) -> Result<String> {
    let raw = match source_type {
        SourceType::Pdf if extract::is_pdf(payload) => extract::pdf_text(label, payload)?,
        SourceType::Docx => extract::docx_text(label, payload)?,
        _ => std::str::from_utf8(payload)
            .map_err(|e| Error::document_format(label, format!("invalid UTF-8: {}", e)))?
            .to_string(),
    };
    let raw = raw.replace("\r\n", "\n").replace('\r', "\n");

    let text = match source_type {
        SourceType::Text | SourceType::Docx => raw,
        SourceType::Markdown => markdown(&raw),
        SourceType::StructuredPage => structured_page(label, &raw)?,
        SourceType::Pdf => pdf(&raw),
        SourceType::Tabular => tabular(label, &raw)?,
    };

    let text = tidy(&text);
    if text.is_empty() {
        return Err(Error::document_format(label, "document has no text content"));
    }
    Ok(text)
}

/// Collapse runs of inline whitespace, trim lines, cap blank lines at one.
fn tidy(text: &str) -> String {
    let lines: Vec<String> = text
        .lines()
        .map(|line| INLINE_SPACE.replace_all(line.trim(), " ").into_owned())
        .collect();
    let joined = lines.join("\n");
    EXCESS_BLANK_LINES
        .replace_all(&joined, "\n\n")
        .trim()
        .to_string()
}

fn markdown(raw: &str) -> String {
    let text = MD_FENCE.replace_all(raw, "");
    let text = MD_RULE.replace_all(&text, "");
    let text = MD_IMAGE.replace_all(&text, "$1");
    let text = MD_LINK.replace_all(&text, "$1");
    let text = MD_HEADING.replace_all(&text, "");
    let text = MD_QUOTE.replace_all(&text, "");
    let text = MD_CODE.replace_all(&text, "$1");
    let text = MD_EMPHASIS.replace_all(&text, "$2");
    HTML_TAG.replace_all(&text, "").into_owned()
}

/// Form feeds separate pages; single line breaks inside a paragraph are
/// layout, not structure.
fn pdf(raw: &str) -> String {
    let pages: Vec<String> = raw
        .split('\u{c}')
        .map(|page| {
            let page = PDF_HYPHEN_BREAK.replace_all(page, "$1$2");
            page.split("\n\n")
                .map(|para| para.split('\n').map(str::trim).collect::<Vec<_>>().join(" "))
                .filter(|para| !para.trim().is_empty())
                .collect::<Vec<_>>()
                .join("\n\n")
        })
        .filter(|page| !page.is_empty())
        .collect();
    pages.join("\n\n")
}

// ---------------------------------------------------------------
// Structured knowledge-base pages
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StructuredPayload {
    Wrapped { entries: Vec<KbEntry> },
    Many(Vec<KbEntry>),
    One(KbEntry),
}

#[derive(Debug, Deserialize)]
struct KbEntry {
    #[serde(default)]
    question: String,
    #[serde(default)]
    answer: String,
    #[serde(default)]
    links: Vec<KbLink>,
    #[serde(default)]
    table: Option<KbTable>,
    #[serde(default)]
    statistics: Vec<KbStatistic>,
    #[serde(default)]
    dates: Vec<KbDate>,
    #[serde(default)]
    steps: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct KbLink {
    #[serde(default)]
    text: String,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct KbTable {
    #[serde(default)]
    headers: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct KbStatistic {
    #[serde(default)]
    metric: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct KbDate {
    #[serde(default)]
    round: String,
    #[serde(default)]
    deadline: String,
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn structured_page(label: &str, raw: &str) -> Result<String> {
    let payload: StructuredPayload = serde_json::from_str(raw)
        .map_err(|e| Error::document_format(label, format!("invalid knowledge-base JSON: {}", e)))?;
    let entries = match payload {
        StructuredPayload::Wrapped { entries } | StructuredPayload::Many(entries) => entries,
        StructuredPayload::One(entry) => vec![entry],
    };
    if entries.is_empty() {
        return Err(Error::document_format(label, "knowledge-base page has no entries"));
    }

    let mut paragraphs = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        paragraphs.push(render_entry(entry).ok_or_else(|| {
            Error::document_format(label, format!("entry {} has no question or no content", i))
        })?);
    }
    Ok(paragraphs.join("\n\n"))
}

/// One entry becomes one paragraph: the question, the answer, then the
/// type-specific details as separate lines.
fn render_entry(entry: &KbEntry) -> Option<String> {
    let question = entry.question.trim();
    if question.is_empty() {
        return None;
    }
    let mut lines = vec![question.to_string()];
    if !entry.answer.trim().is_empty() {
        lines.push(entry.answer.trim().to_string());
    }

    if !entry.links.is_empty() {
        let links: Vec<String> = entry
            .links
            .iter()
            .map(|l| match (l.text.trim(), l.url.trim()) {
                ("", url) => url.to_string(),
                (text, "") => text.to_string(),
                (text, url) => format!("{} ({})", text, url),
            })
            .collect();
        lines.push(format!("Relevant links: {}.", links.join(", ")));
    }

    if let Some(table) = &entry.table {
        for row in &table.rows {
            let cells: Vec<String> = row
                .iter()
                .enumerate()
                .map(|(i, cell)| match table.headers.get(i) {
                    Some(header) => format!("{}: {}", header, scalar(cell)),
                    None => scalar(cell),
                })
                .collect();
            lines.push(format!("{}.", cells.join("; ")));
        }
    }

    for stat in &entry.statistics {
        lines.push(format!("{}: {}.", stat.metric, scalar(&stat.value)));
    }

    let mut dates: Vec<&KbDate> = entry.dates.iter().collect();
    dates.sort_by(|a, b| a.deadline.cmp(&b.deadline));
    for date in dates {
        lines.push(format!("{}: {}.", date.round, date.deadline));
    }

    for (i, step) in entry.steps.iter().enumerate() {
        lines.push(format!("Step {}: {}", i + 1, step.trim()));
    }

    if lines.len() == 1 {
        // A bare question with nothing answering it carries no knowledge.
        return None;
    }
    Some(lines.join("\n"))
}

// ---------------------------------------------------------------
// Tabular (CSV)
// ---------------------------------------------------------------

fn tabular(label: &str, raw: &str) -> Result<String> {
    let mut records = parse_csv(raw).map_err(|reason| Error::document_format(label, reason))?;
    records.retain(|r| !(r.len() == 1 && r[0].trim().is_empty()));
    if records.is_empty() {
        return Err(Error::document_format(label, "CSV has no header row"));
    }

    let header: Vec<String> = records.remove(0).into_iter().map(|h| h.trim().to_string()).collect();
    if header.iter().all(|h| h.is_empty()) {
        return Err(Error::document_format(label, "CSV header is empty"));
    }

    let mut paragraphs = Vec::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        if record.len() != header.len() {
            return Err(Error::document_format(
                label,
                format!(
                    "row {} has {} fields, header has {}",
                    i + 2,
                    record.len(),
                    header.len()
                ),
            ));
        }
        let lines: Vec<String> = header
            .iter()
            .zip(record)
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(h, value)| format!("{}: {}", h, value.trim()))
            .collect();
        if !lines.is_empty() {
            paragraphs.push(lines.join("\n"));
        }
    }
    Ok(paragraphs.join("\n\n"))
}

/// Minimal RFC 4180 reader: quoted fields, doubled quotes, embedded newlines.
fn parse_csv(raw: &str) -> std::result::Result<Vec<Vec<String>>, String> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_tidied() {
        let text = normalize(SourceType::Text, "t", b"  Hello   world \r\n\r\n\r\n\r\nBye").unwrap();
        assert_eq!(text, "Hello world\n\nBye");
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let err = normalize(SourceType::Text, "bad", &[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, Error::DocumentFormat { .. }));
    }

    #[test]
    fn test_empty_rejected() {
        assert!(normalize(SourceType::Markdown, "empty", b"  \n\n ").is_err());
    }

    #[test]
    fn test_markdown_stripped() {
        let md = "# Library\n\nThe **library** is open [24/7](https://lib.example).\n\n---\n\n> Bring your `ID`.";
        let text = normalize(SourceType::Markdown, "md", md.as_bytes()).unwrap();
        assert_eq!(text, "Library\n\nThe library is open 24/7.\n\nBring your ID.");
    }

    #[test]
    fn test_structured_page_rendered() {
        let json = r#"[
            {"question": "When do labs start?", "answer": "Labs start in week one.",
             "type": "date_response",
             "dates": [{"round": "Second lab", "deadline": "2024-09-10"},
                       {"round": "First lab", "deadline": "2024-09-03"}]},
            {"question": "How do I apply?", "answer": "",
             "type": "procedural_response", "steps": ["Create an account", "Submit documents"]},
            {"question": "Acceptance rate?", "answer": "Competitive.",
             "statistics": [{"metric": "Acceptance rate", "value": 12}]}
        ]"#;
        let text = normalize(SourceType::StructuredPage, "faq", json.as_bytes()).unwrap();
        let paragraphs: Vec<&str> = text.split("\n\n").collect();
        assert_eq!(paragraphs.len(), 3);
        assert_eq!(
            paragraphs[0],
            "When do labs start?\nLabs start in week one.\nFirst lab: 2024-09-03.\nSecond lab: 2024-09-10."
        );
        assert!(paragraphs[1].ends_with("Step 2: Submit documents"));
        assert!(paragraphs[2].contains("Acceptance rate: 12."));
    }

    #[test]
    fn test_structured_page_rejects_bad_entries() {
        assert!(normalize(SourceType::StructuredPage, "x", b"{not json").is_err());
        assert!(normalize(SourceType::StructuredPage, "x", br#"{"entries": []}"#).is_err());
        assert!(normalize(SourceType::StructuredPage, "x", br#"[{"question": "Lonely?"}]"#).is_err());
    }

    #[test]
    fn test_pdf_joined() {
        let raw = "Registration opens in Sep-\ntember for all\nstudents.\n\u{c}Page two text.";
        let text = normalize(SourceType::Pdf, "pdf", raw.as_bytes()).unwrap();
        assert_eq!(
            text,
            "Registration opens in September for all students.\n\nPage two text."
        );
    }

    #[test]
    fn test_pdf_file_extracted() {
        let bytes = extract::tests::pdf_with_text("Labs start Tuesday.");
        let text = normalize(SourceType::Pdf, "calendar.pdf", &bytes).unwrap();
        assert!(text.contains("Labs start Tuesday."));
    }

    #[test]
    fn test_docx_file_extracted() {
        let bytes = extract::tests::docx_with_paragraphs(&["Library hours", "Open 24/7."]);
        let text = normalize(SourceType::Docx, "library.docx", &bytes).unwrap();
        assert_eq!(text, "Library hours\n\nOpen 24/7.");
        assert!(normalize(SourceType::Docx, "x", b"Open 24/7.").is_err());
    }

    #[test]
    fn test_csv_rendered() {
        let csv = "Course,Room,Time\nBiology 101,\"Hall A, 2nd floor\",Mon 9am\nChemistry,Lab 3,\n";
        let text = normalize(SourceType::Tabular, "timetable", csv.as_bytes()).unwrap();
        assert_eq!(
            text,
            "Course: Biology 101\nRoom: Hall A, 2nd floor\nTime: Mon 9am\n\nCourse: Chemistry\nRoom: Lab 3"
        );
    }

    #[test]
    fn test_csv_ragged_row_rejected() {
        let err = normalize(SourceType::Tabular, "t", b"a,b\n1,2,3\n").unwrap_err();
        assert!(err.to_string().contains("row 2"));
        assert!(normalize(SourceType::Tabular, "t", b"a,\"open\n").is_err());
    }
}
