//! Statement text extraction
//!
//! Reads statement files from disk into [`ExtractedText`] units. Files must
//! be named `<label>_<YYYY>-<MM>.<txt|csv|pdf>` with a lowercase
//! `[a-z0-9-]` label; anything else fails the whole extraction, naming the
//! offending file. Text and PDF files yield one unit each. CSV files are
//! split into record batches of [`CSV_ROWS_PER_UNIT`], each carrying the
//! header row.

use crate::error::OrchestrationError;
use crate::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CSV_ROWS_PER_UNIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Text,
    Csv,
    Pdf,
}

/// Metadata carried by a conforming statement filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementFileName {
    pub label: String,
    pub period: NaiveDate,
    pub kind: FileKind,
}

impl StatementFileName {
    pub fn parse(file_name: &str) -> Result<Self> {
        let bad = |reason: &str| {
            OrchestrationError::ExtractionError(format!(
                "bad filename '{}': {} (expected <label>_<YYYY>-<MM>.txt, .csv or .pdf)",
                file_name, reason
            ))
        };

        let (stem, ext) = file_name.rsplit_once('.').ok_or_else(|| bad("missing extension"))?;
        let kind = match ext {
            "txt" => FileKind::Text,
            "csv" => FileKind::Csv,
            "pdf" => FileKind::Pdf,
            _ => return Err(bad("unsupported extension")),
        };

        let (label, period) = stem.rsplit_once('_').ok_or_else(|| bad("missing period"))?;
        if label.is_empty()
            || !label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(bad("label must be lowercase letters, digits or '-'"));
        }

        let (year, month) = period.split_once('-').ok_or_else(|| bad("period is not YYYY-MM"))?;
        if year.len() != 4 || month.len() != 2 {
            return Err(bad("period is not YYYY-MM"));
        }
        let year: i32 = year.parse().map_err(|_| bad("year is not a number"))?;
        let month: u32 = month.parse().map_err(|_| bad("month is not a number"))?;
        let period = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| bad("month out of range"))?;

        Ok(Self {
            label: label.to_string(),
            period,
            kind,
        })
    }
}

/// One unit of extracted statement text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedText {
    pub file_name: String,
    pub label: String,
    /// First day of the statement month
    pub period: NaiveDate,
    /// 1-based part number (CSV row batches)
    pub part: usize,
    pub text: String,
}

/// Extract every statement under `path` (a folder or a single file).
pub async fn extract_path(path: &Path) -> Result<Vec<ExtractedText>> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| {
        OrchestrationError::ExtractionError(format!("cannot read '{}': {}", path.display(), e))
    })?;

    if metadata.is_file() {
        return extract_file(path).await;
    }

    let mut files: Vec<PathBuf> = Vec::new();
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(OrchestrationError::ExtractionError(format!(
            "no statement files found in '{}'",
            path.display()
        )));
    }

    let mut units = Vec::new();
    for file in &files {
        units.extend(extract_file(file).await?);
    }

    info!(folder = %path.display(), files = files.len(), units = units.len(), "Extracted statements");
    Ok(units)
}

/// Extract one statement file.
pub async fn extract_file(path: &Path) -> Result<Vec<ExtractedText>> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let meta = StatementFileName::parse(&file_name)?;

    let text = match meta.kind {
        FileKind::Pdf => read_pdf(path, &file_name).await?,
        FileKind::Text | FileKind::Csv => tokio::fs::read_to_string(path).await.map_err(|e| {
            OrchestrationError::ExtractionError(format!("cannot read '{}': {}", file_name, e))
        })?,
    };
    if text.trim().is_empty() {
        return Err(OrchestrationError::ExtractionError(format!(
            "'{}' is empty",
            file_name
        )));
    }

    let parts = match meta.kind {
        FileKind::Text | FileKind::Pdf => vec![text],
        FileKind::Csv => split_csv(&text, CSV_ROWS_PER_UNIT).map_err(|reason| {
            OrchestrationError::ExtractionError(format!("'{}': {}", file_name, reason))
        })?,
    };

    debug!(file = %file_name, parts = parts.len(), "Extracted file");

    Ok(parts
        .into_iter()
        .enumerate()
        .map(|(i, text)| ExtractedText {
            file_name: file_name.clone(),
            label: meta.label.clone(),
            period: meta.period,
            part: i + 1,
            text,
        })
        .collect())
}

/// Text of every page, pages separated by form feeds.
async fn read_pdf(path: &Path, file_name: &str) -> Result<String> {
    let owned = path.to_path_buf();
    // pdf-extract is synchronous and may panic on malformed input
    let extracted = tokio::task::spawn_blocking(move || pdf_extract::extract_text(&owned))
        .await
        .map_err(|e| {
            OrchestrationError::ExtractionError(format!("'{}' is not a readable PDF: {}", file_name, e))
        })?;

    extracted.map_err(|e| {
        OrchestrationError::ExtractionError(format!("'{}' is not a readable PDF: {}", file_name, e))
    })
}

/// Split CSV text into records. Newlines inside double-quoted fields stay
/// part of their record; blank records are dropped.
fn csv_records(text: &str) -> Vec<&str> {
    let mut records = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (i, b) in text.bytes().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b'\n' if !in_quotes => {
                records.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    records.push(&text[start..]);

    records
        .into_iter()
        .map(|r| r.strip_suffix('\r').unwrap_or(r))
        .filter(|r| !r.trim().is_empty())
        .collect()
}

/// Split CSV text into batches of `rows_per_unit` data records, repeating
/// the header record at the top of each batch.
pub fn split_csv(text: &str, rows_per_unit: usize) -> std::result::Result<Vec<String>, String> {
    let mut records = csv_records(text).into_iter();
    let header = records.next().ok_or("CSV has no header row")?;
    let rows: Vec<&str> = records.collect();
    if rows.is_empty() {
        return Err("CSV has no data rows".to_string());
    }

    Ok(rows
        .chunks(rows_per_unit.max(1))
        .map(|chunk| {
            let mut unit = String::with_capacity(header.len() + chunk.len() * 48);
            unit.push_str(header);
            for row in chunk {
                unit.push('\n');
                unit.push_str(row);
            }
            unit
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_convention() {
        let meta = StatementFileName::parse("acme-bank_2025-04.txt").unwrap();
        assert_eq!(meta.label, "acme-bank");
        assert_eq!(meta.period, NaiveDate::from_ymd_opt(2025, 4, 1).unwrap());
        assert_eq!(meta.kind, FileKind::Text);
        assert_eq!(StatementFileName::parse("card_2024-12.csv").unwrap().kind, FileKind::Csv);
        assert_eq!(StatementFileName::parse("card_2024-12.pdf").unwrap().kind, FileKind::Pdf);

        for bad in [
            "statement.txt",
            "Acme_2025-04.txt",
            "acme_2025-13.txt",
            "acme_2025-4.txt",
            "acme_2025-04.xlsx",
            "_2025-04.txt",
            "acme_2025-04",
        ] {
            let err = StatementFileName::parse(bad).unwrap_err();
            assert!(err.to_string().contains(bad), "{}", err);
        }
    }

    #[test]
    fn test_split_csv_repeats_header() {
        let mut csv = String::from("date,details,amount\n");
        for i in 0..5 {
            csv.push_str(&format!("2025-04-0{},item {},{}\n", i + 1, i, i));
        }
        let units = split_csv(&csv, 2).unwrap();
        assert_eq!(units.len(), 3);
        assert!(units.iter().all(|u| u.starts_with("date,details,amount\n")));
        assert_eq!(units[2].lines().count(), 2);
        assert!(split_csv("date,details,amount\n", 2).is_err());
    }

    #[test]
    fn test_split_csv_keeps_quoted_newlines() {
        let csv = "date,details,amount\r\n2025-04-01,\"Tango Energy\nref 991\",45\r\n2025-04-02,Uber Eats,34\r\n";
        let units = split_csv(csv, 1).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], "date,details,amount\n2025-04-01,\"Tango Energy\nref 991\",45");
        assert_eq!(units[1], "date,details,amount\n2025-04-02,Uber Eats,34");
    }

    /// Single-page PDF with one line of Helvetica text and a valid xref table.
    fn one_page_pdf(text: &str) -> Vec<u8> {
        let content = format!("BT /F1 12 Tf 72 720 Td ({}) Tj ET", text);
        let objects = [
            "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
             /Resources << /Font << /F1 4 0 R >> >> /Contents 5 0 R >>"
                .to_string(),
            "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>".to_string(),
            format!("<< /Length {} >>\nstream\n{}\nendstream", content.len(), content),
        ];

        let mut pdf = b"%PDF-1.4\n".to_vec();
        let mut offsets = Vec::new();
        for (i, body) in objects.iter().enumerate() {
            offsets.push(pdf.len());
            pdf.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
        }
        let xref_at = pdf.len();
        pdf.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1).as_bytes());
        for offset in offsets {
            pdf.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
        }
        pdf.extend_from_slice(
            format!(
                "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
                objects.len() + 1,
                xref_at
            )
            .as_bytes(),
        );
        pdf
    }

    #[tokio::test]
    async fn test_extract_pdf_statement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme_2025-04.pdf");
        tokio::fs::write(&path, one_page_pdf("Opening balance 2000")).await.unwrap();

        let units = extract_file(&path).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].label, "acme");
        assert!(units[0].text.contains("Opening"), "{:?}", units[0].text);
        assert!(units[0].text.contains("2000"), "{:?}", units[0].text);
    }

    #[tokio::test]
    async fn test_unreadable_pdf_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme_2025-04.pdf");
        tokio::fs::write(&path, "definitely not a pdf").await.unwrap();

        let err = extract_file(&path).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ExtractionError(_)));
        assert!(err.to_string().contains("acme_2025-04.pdf"));
    }

    #[tokio::test]
    async fn test_extract_folder_sorted_and_strict() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("zeta_2025-05.txt"), "statement two").await.unwrap();
        tokio::fs::write(dir.path().join("acme_2025-04.txt"), "statement one").await.unwrap();
        tokio::fs::write(dir.path().join(".DS_Store"), "ignored").await.unwrap();

        let units = extract_path(dir.path()).await.unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].file_name, "acme_2025-04.txt");
        assert_eq!(units[1].text, "statement two");

        tokio::fs::write(dir.path().join("notes.txt"), "oops").await.unwrap();
        let err = extract_path(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("notes.txt"));
    }

    #[tokio::test]
    async fn test_empty_folder_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(extract_path(dir.path()).await.is_err());
        assert!(extract_path(&dir.path().join("missing")).await.is_err());
    }
}
