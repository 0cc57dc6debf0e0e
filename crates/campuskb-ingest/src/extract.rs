//! Text extraction from binary uploads (PDF, Word).

use std::io::Read;

use quick_xml::events::Event;
use quick_xml::Reader;

use campuskb_core::{Error, Result};

/// Every PDF file starts with this marker.
const PDF_MAGIC: &[u8] = b"%PDF-";
/// Every zip archive (and so every .docx) starts with this marker.
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

const MAX_XML_ENTRY_BYTES: u64 = 32 * 1024 * 1024;

pub fn is_pdf(payload: &[u8]) -> bool {
    payload.starts_with(PDF_MAGIC)
}

/// Text of a PDF held in memory. Pages are separated by form feeds.
///
/// The extractor panics on some malformed files; that is reported as a
/// format error like any other unreadable PDF.
pub fn pdf_text(label: &str, payload: &[u8]) -> Result<String> {
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(payload)) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(Error::document_format(label, format!("unreadable PDF: {}", e))),
        Err(_) => Err(Error::document_format(label, "unreadable PDF")),
    }
}

/// Text of a .docx held in memory, one paragraph per `w:p`.
pub fn docx_text(label: &str, payload: &[u8]) -> Result<String> {
    if !payload.starts_with(ZIP_MAGIC) {
        return Err(Error::document_format(label, "not a .docx archive"));
    }
    let bad = |e: String| Error::document_format(label, format!("unreadable .docx: {}", e));

    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(payload)).map_err(|e| bad(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|e| bad(e.to_string()))?;
    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| bad(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(bad("word/document.xml exceeds size limit".into()));
    }
    word_paragraphs(&xml).map_err(bad)
}

fn word_paragraphs(xml: &[u8]) -> std::result::Result<String, String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push_str("\n\n"),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| e.to_string())?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    /// One-page PDF with a single line of Courier text.
    pub(crate) fn pdf_with_text(text: &str) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    pub(crate) fn docx_with_paragraphs(paragraphs: &[&str]) -> Vec<u8> {
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
            .collect();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
            body
        );
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_pdf_text_extracted() {
        let bytes = pdf_with_text("Registration closes Friday");
        assert!(is_pdf(&bytes));
        let text = pdf_text("handbook", &bytes).unwrap();
        assert!(text.contains("Registration closes Friday"), "got {:?}", text);
    }

    #[test]
    fn test_corrupt_pdf_is_format_error() {
        let err = pdf_text("bad", b"%PDF-1.4\nnot really").unwrap_err();
        assert!(matches!(err, Error::DocumentFormat { .. }));
    }

    #[test]
    fn test_docx_paragraphs() {
        let bytes = docx_with_paragraphs(&["Fees are due in August.", "Late fees apply &amp; accrue."]);
        let text = docx_text("fees", &bytes).unwrap();
        assert_eq!(text, "Fees are due in August.\n\nLate fees apply & accrue.\n\n");
    }

    #[test]
    fn test_non_zip_docx_rejected() {
        assert!(docx_text("x", b"plain words").is_err());
    }
}
