//! Text extraction for knowledge documents.
//!
//! The extractor is chosen by file extension ([`DocumentKind::from_path`]).
//! Plain-text formats are read as lossy UTF-8; PDFs go through
//! `pdf-extract`; Word and Excel files are read straight from their OOXML
//! parts with `zip` + `quick-xml`. Tables keep their row structure with
//! cells joined by ` | ` so parameter tables survive chunking as lines.
//!
//! Extraction never panics on malformed input; callers log the error and
//! skip the file.

use std::io::Read;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use thiserror::Error;

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Header line written before each Word table.
pub const DOCX_TABLE_HEADER: &str = "[Table]";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported document type: {0}")]
    UnsupportedType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// How a file's text is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    PlainText,
    Pdf,
    Docx,
    Xlsx,
    /// Recognized but not extractable (no OCR).
    Image,
}

impl DocumentKind {
    /// Classify by extension, case-insensitively. `None` means the file is
    /// not a knowledge document at all.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "txt" | "md" | "csv" | "json" => Some(Self::PlainText),
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "xlsx" => Some(Self::Xlsx),
            "jpg" | "jpeg" | "png" | "bmp" | "gif" => Some(Self::Image),
            _ => None,
        }
    }
}

/// Read and extract a file from disk.
pub fn extract_file(path: &Path, kind: DocumentKind) -> Result<String, ExtractError> {
    let bytes = std::fs::read(path)?;
    extract_text(&bytes, kind)
}

/// Extract plain text from in-memory document bytes.
pub fn extract_text(bytes: &[u8], kind: DocumentKind) -> Result<String, ExtractError> {
    match kind {
        DocumentKind::PlainText => Ok(String::from_utf8_lossy(bytes).into_owned()),
        DocumentKind::Pdf => extract_pdf(bytes),
        DocumentKind::Docx => extract_docx(bytes),
        DocumentKind::Xlsx => extract_xlsx(bytes),
        DocumentKind::Image => Err(ExtractError::UnsupportedType("image".to_string())),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

/// Read one entry, or `Ok(None)` when the archive does not contain it.
fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Option<Vec<u8>>, ExtractError> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
    };
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(Some(out))
}

fn require_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    read_zip_entry_bounded(archive, name, MAX_XML_ENTRY_BYTES)?
        .ok_or_else(|| ExtractError::Ooxml(format!("{} not found", name)))
}

fn text_of(event: &quick_xml::events::BytesText<'_>) -> Result<String, ExtractError> {
    event
        .unescape()
        .map(|t| t.into_owned())
        .map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

// ---- Word ----

#[derive(Default)]
struct DocxBody {
    paragraphs: Vec<String>,
    tables: Vec<Vec<Vec<String>>>,
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = require_entry(&mut archive, "word/document.xml")?;
    let body = parse_docx_body(&xml)?;

    let mut out = String::new();
    for para in &body.paragraphs {
        out.push_str(para);
        out.push('\n');
    }
    for table in &body.tables {
        out.push('\n');
        out.push_str(DOCX_TABLE_HEADER);
        out.push('\n');
        for row in table {
            out.push_str(&row.join(" | "));
            out.push('\n');
        }
    }
    Ok(out)
}

/// Paragraphs outside tables go to `paragraphs`; paragraphs inside a cell
/// are joined into that cell's text. Nested tables flatten into the
/// enclosing cell.
fn parse_docx_body(xml: &[u8]) -> Result<DocxBody, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut body = DocxBody::default();

    let mut in_t = false;
    let mut para = String::new();
    let mut table_depth = 0usize;
    let mut table: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_t = true,
                b"p" => para.clear(),
                b"tbl" => {
                    table_depth += 1;
                    if table_depth == 1 {
                        table.clear();
                    }
                }
                b"tr" if table_depth == 1 => row.clear(),
                b"tc" if table_depth == 1 => cell.clear(),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => para.push('\t'),
                b"br" | b"cr" => para.push(' '),
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => para.push_str(&text_of(&te)?),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => {
                    let text = para.trim();
                    if table_depth == 0 {
                        if !text.is_empty() {
                            body.paragraphs.push(text.to_string());
                        }
                    } else if !text.is_empty() {
                        if !cell.is_empty() {
                            cell.push(' ');
                        }
                        cell.push_str(text);
                    }
                    para.clear();
                }
                b"tc" if table_depth == 1 => {
                    row.push(cell.replace(['\r', '\n'], " "));
                    cell.clear();
                }
                b"tr" if table_depth == 1 => table.push(std::mem::take(&mut row)),
                b"tbl" => {
                    if table_depth == 1 && !table.is_empty() {
                        body.tables.push(std::mem::take(&mut table));
                    }
                    table_depth = table_depth.saturating_sub(1);
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(body)
}

// ---- Excel ----

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings =
        match read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)? {
            Some(xml) => parse_shared_strings(&xml)?,
            None => Vec::new(),
        };
    let sheet_titles = match read_zip_entry_bounded(&mut archive, "xl/workbook.xml", MAX_XML_ENTRY_BYTES)? {
        Some(xml) => parse_sheet_titles(&xml)?,
        None => Vec::new(),
    };

    let mut out = String::new();
    for (idx, part) in list_worksheet_parts(&archive)
        .into_iter()
        .take(XLSX_MAX_SHEETS)
        .enumerate()
    {
        let xml = require_entry(&mut archive, &part)?;
        let title = sheet_titles
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("Sheet{}", idx + 1));
        out.push_str(&format!("\n[Sheet: {}]\n", title));
        for row in parse_sheet_rows(&xml, &shared_strings)? {
            out.push_str(&row.join(" | "));
            out.push('\n');
        }
    }
    Ok(out)
}

/// Each `<si>` may hold several rich-text runs; they concatenate.
fn parse_shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => current.push_str(&text_of(&te)?),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn parse_sheet_titles(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut titles = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                titles.push(attr(&e, b"name").unwrap_or_default());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(titles)
}

fn list_worksheet_parts(archive: &Archive<'_>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Zero-based column index from a cell reference such as `"C7"`.
fn column_index(cell_ref: &str) -> Option<usize> {
    let letters: String = cell_ref.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    if letters.is_empty() {
        return None;
    }
    let mut index = 0usize;
    for c in letters.chars() {
        index = index * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    Some(index - 1)
}

#[derive(Clone, Copy, PartialEq)]
enum CellKind {
    Shared,
    Bool,
    Other,
}

/// Rows of cell text. Gaps before a referenced column are filled with empty
/// cells; rows whose cells are all blank are dropped.
fn parse_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<Vec<String>>, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell_col: Option<usize> = None;
    let mut cell_kind = CellKind::Other;
    let mut cell_text = String::new();
    let mut in_value = false;
    let mut cell_count = 0usize;

    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell_col = attr(&e, b"r").and_then(|r| column_index(&r));
                    cell_kind = match attr(&e, b"t").as_deref() {
                        Some("s") => CellKind::Shared,
                        Some("b") => CellKind::Bool,
                        _ => CellKind::Other,
                    };
                    cell_text.clear();
                }
                // <v> holds values; <t> holds inline strings inside <is>
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => cell_text.push_str(&text_of(&te)?),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let raw = cell_text.trim();
                    let value = match cell_kind {
                        CellKind::Shared => raw
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned())
                            .unwrap_or_default(),
                        CellKind::Bool => match raw {
                            "1" => "TRUE".to_string(),
                            "0" => "FALSE".to_string(),
                            other => other.to_string(),
                        },
                        CellKind::Other => raw.to_string(),
                    };
                    if let Some(col) = cell_col {
                        while row.len() < col {
                            row.push(String::new());
                        }
                    }
                    row.push(value.replace(['\r', '\n'], " "));
                    cell_count += 1;
                }
                b"row" => {
                    if row.iter().any(|c| !c.trim().is_empty()) {
                        rows.push(std::mem::take(&mut row));
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}
