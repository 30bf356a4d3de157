//! Verification summary and report output.
//!
//! The report is plain CSV, one line per verification record, with the same
//! column layout the operators already know: original → encrypted →
//! decrypted → match → error, per field. Original values are always masked;
//! decrypted values are masked only when requested, since seeing them in
//! clear is the point of a full verification run in a test environment.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::verify::VerificationRecord;

/// Aggregated counters over a verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifySummary {
    pub total: usize,
    pub pan_matches: usize,
    pub cvv_matches: usize,
    pub perfect_matches: usize,
    /// Records with at least one error string set.
    pub errors: usize,
}

/// Compute the per-field and perfect-match counters.
pub fn summarize(records: &[VerificationRecord]) -> VerifySummary {
    let mut summary = VerifySummary {
        total: records.len(),
        pan_matches: 0,
        cvv_matches: 0,
        perfect_matches: 0,
        errors: 0,
    };
    for record in records {
        if record.pan_match && record.pan_error.is_empty() {
            summary.pan_matches += 1;
        }
        if record.cvv_match && record.cvv_error.is_empty() {
            summary.cvv_matches += 1;
        }
        if record.is_perfect() {
            summary.perfect_matches += 1;
        }
        if !record.pan_error.is_empty() || !record.cvv_error.is_empty() {
            summary.errors += 1;
        }
    }
    summary
}

/// Mask a PAN for logging: keep the last four digits, star the rest.
pub fn mask_pan(pan: &str) -> String {
    if pan.len() <= 4 {
        return "****".into();
    }
    let visible = &pan[pan.len() - 4..];
    format!("{}{visible}", "*".repeat(pan.len() - 4))
}

/// Mask a CVV: never show any of it.
pub fn mask_cvv(cvv: &str) -> String {
    if cvv.is_empty() {
        String::new()
    } else {
        "***".into()
    }
}

const HEADER: &str = "source_id,original_pan,encrypted_pan,decrypted_pan,pan_match,pan_error,\
                      original_cvv,encrypted_cvv,decrypted_cvv,cvv_match,cvv_error,other_data";

/// Write the verification records as CSV.
///
/// `mask_decrypted` masks the decrypted values as well; original values are
/// always masked.
pub fn write_csv(records: &[VerificationRecord], path: &Path, mask_decrypted: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create report directory {}", parent.display()))?;
        }
    }

    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create report file {}", path.display()))?;
    let mut out = std::io::BufWriter::new(file);

    writeln!(out, "{HEADER}")?;
    for record in records {
        let decrypted_pan = if mask_decrypted {
            mask_pan(&record.decrypted_pan)
        } else {
            record.decrypted_pan.clone()
        };
        let decrypted_cvv = if mask_decrypted {
            mask_cvv(&record.decrypted_cvv)
        } else {
            record.decrypted_cvv.clone()
        };

        let fields = [
            record.source_id.to_string(),
            mask_pan(&record.original_pan),
            record.encrypted_pan.clone(),
            decrypted_pan,
            yes_no(record.pan_match),
            record.pan_error.clone(),
            mask_cvv(&record.original_cvv),
            record.encrypted_cvv.clone(),
            decrypted_cvv,
            yes_no(record.cvv_match),
            record.cvv_error.clone(),
            record.other_data.clone(),
        ];
        let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        writeln!(out, "{}", line.join(","))?;
    }

    out.flush().context("failed to flush report file")?;
    Ok(())
}

fn yes_no(value: bool) -> String {
    if value { "yes" } else { "no" }.into()
}

/// Quote a field when it contains a separator, quote, or newline.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perfect(id: i64) -> VerificationRecord {
        VerificationRecord {
            source_id: id,
            original_pan: "4111111111111111".into(),
            original_cvv: "123".into(),
            decrypted_pan: "4111111111111111".into(),
            decrypted_cvv: "123".into(),
            pan_match: true,
            cvv_match: true,
            ..VerificationRecord::default()
        }
    }

    #[test]
    fn mask_pan_keeps_last_four() {
        assert_eq!(mask_pan("4111111111111111"), "************1111");
        assert_eq!(mask_pan("123"), "****");
        assert_eq!(mask_pan(""), "****");
    }

    #[test]
    fn mask_cvv_hides_everything() {
        assert_eq!(mask_cvv("123"), "***");
        assert_eq!(mask_cvv(""), "");
    }

    #[test]
    fn summary_counts_matches_and_errors() {
        let mut mismatch = perfect(2);
        mismatch.cvv_match = false;
        let mut failed = perfect(3);
        failed.pan_error = "decrypt error: authentication failed".into();
        failed.pan_match = false;

        let records = vec![perfect(1), mismatch, failed];
        let summary = summarize(&records);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.pan_matches, 2);
        assert_eq!(summary.cvv_matches, 2);
        assert_eq!(summary.perfect_matches, 1);
        assert_eq!(summary.errors, 1);
    }

    #[test]
    fn csv_field_quotes_only_when_needed() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn report_masks_originals_and_optionally_decrypted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        write_csv(&[perfect(1)], &path, false).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().starts_with("source_id,"));
        let row = lines.next().unwrap();
        // Original masked, decrypted in clear.
        assert!(row.contains("************1111"));
        assert!(row.contains("4111111111111111"));

        write_csv(&[perfect(1)], &path, true).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.lines().nth(1).unwrap().contains("4111111111111111"));
    }

    #[test]
    fn report_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/report.csv");
        write_csv(&[], &path, true).unwrap();
        assert!(path.exists());
    }
}
