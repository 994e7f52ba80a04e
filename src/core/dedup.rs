use crate::core::extraction::CandidateExtractor;
use crate::domain::formula::{Composition, Formula};
use crate::domain::ports::{Pipeline, StageReport, Storage};
use crate::utils::error::Result;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct RawLine {
    pub line: usize,
    pub text: String,
}

/// 錯誤報表的一列：line,formula,error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedLine {
    pub line: usize,
    pub formula: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupReport {
    pub kept: Vec<String>,
    pub duplicates: usize,
    pub rejected: Vec<RejectedLine>,
}

impl StageReport for DedupReport {
    fn kept(&self) -> usize {
        self.kept.len()
    }

    fn rejected(&self) -> usize {
        self.rejected.len()
    }
}

/// 略過空行與 `#` 註解
pub fn read_lines(text: &str) -> Vec<RawLine> {
    text.lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                None
            } else {
                Some(RawLine {
                    line: index + 1,
                    text: trimmed.to_string(),
                })
            }
        })
        .collect()
}

/// 第一次出現的化學式保留，之後與其組成 `range_match` 的都視為重複；
/// 只有元素集合相同才可能相符，所以依元素集合分桶比較
pub fn deduplicate(lines: Vec<RawLine>, tolerance: f64, extractor: &CandidateExtractor) -> DedupReport {
    let mut report = DedupReport::default();
    let mut buckets: BTreeMap<Vec<String>, Vec<Composition>> = BTreeMap::new();

    for raw in lines {
        let cleaned = extractor.clean(&raw.text);
        let formula = match Formula::parse(&cleaned) {
            Ok(formula) => formula,
            Err(e) => {
                tracing::debug!("Line {}: rejected '{}': {}", raw.line, raw.text, e);
                report.rejected.push(RejectedLine {
                    line: raw.line,
                    formula: raw.text,
                    error: e.to_string(),
                });
                continue;
            }
        };

        let key: Vec<String> = formula.composition().elements().map(str::to_string).collect();
        let bucket = buckets.entry(key).or_default();
        if bucket
            .iter()
            .any(|kept| kept.range_match(formula.composition(), tolerance))
        {
            report.duplicates += 1;
            continue;
        }

        bucket.push(formula.composition().clone());
        report.kept.push(cleaned);
    }

    report
}

/// 第五階段：候選清單去重
pub struct DedupPipeline<S: Storage> {
    storage: S,
    input_file: String,
    output_file: String,
    tolerance: f64,
    errors_file: Option<String>,
    extractor: CandidateExtractor,
}

impl<S: Storage> DedupPipeline<S> {
    pub fn new(storage: S, input_file: impl Into<String>, output_file: impl Into<String>) -> Self {
        Self {
            storage,
            input_file: input_file.into(),
            output_file: output_file.into(),
            tolerance: 0.0,
            errors_file: None,
            extractor: CandidateExtractor::new(),
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_errors_file(mut self, errors_file: Option<String>) -> Self {
        self.errors_file = errors_file;
        self
    }
}

#[async_trait::async_trait]
impl<S: Storage> Pipeline for DedupPipeline<S> {
    type Item = RawLine;
    type Report = DedupReport;

    async fn extract(&self) -> Result<Vec<RawLine>> {
        tracing::debug!("Reading candidates from {}", self.storage.location(&self.input_file));
        let data = self.storage.read_file(&self.input_file).await?;
        Ok(read_lines(&String::from_utf8_lossy(&data)))
    }

    async fn transform(&self, data: Vec<RawLine>) -> Result<DedupReport> {
        let report = deduplicate(data, self.tolerance, &self.extractor);
        if report.duplicates > 0 {
            tracing::info!("🧹 Dropped {} duplicate formulas", report.duplicates);
        }
        if !report.rejected.is_empty() {
            tracing::warn!("⚠️ {} lines are not valid formulas", report.rejected.len());
        }
        Ok(report)
    }

    async fn load(&self, report: DedupReport) -> Result<String> {
        let mut output = report.kept.join("\n");
        if !output.is_empty() {
            output.push('\n');
        }
        self.storage
            .write_file(&self.output_file, output.as_bytes())
            .await?;

        if let Some(errors_file) = &self.errors_file {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(Vec::new());
            writer.write_record(["line", "formula", "error"])?;
            for rejected in &report.rejected {
                writer.serialize(rejected)?;
            }
            let data = writer
                .into_inner()
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            self.storage.write_file(errors_file, &data).await?;
            tracing::info!(
                "📝 Wrote {} rejected lines to {}",
                report.rejected.len(),
                self.storage.location(errors_file)
            );
        }

        Ok(self.storage.location(&self.output_file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(texts: &[&str]) -> Vec<RawLine> {
        read_lines(&texts.join("\n"))
    }

    #[test]
    fn test_read_lines_skips_comments_and_blanks() {
        let parsed = read_lines("# candidates\n\nLiFePO4\n  LiCoO2  \n");
        assert_eq!(
            parsed,
            vec![
                RawLine {
                    line: 3,
                    text: "LiFePO4".to_string()
                },
                RawLine {
                    line: 4,
                    text: "LiCoO2".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_exact_duplicates_keep_first_occurrence() {
        let extractor = CandidateExtractor::new();
        let report = deduplicate(
            lines(&["LiFePO4", "LiCoO2", "Li2Fe2P2O8", "$LiFePO_4$"]),
            0.0,
            &extractor,
        );
        assert_eq!(report.kept, vec!["LiFePO4", "LiCoO2"]);
        assert_eq!(report.duplicates, 2);
        assert!(report.rejected.is_empty());
    }

    #[test]
    fn test_tolerance_merges_close_compositions() {
        let extractor = CandidateExtractor::new();
        let input = lines(&["LiFe0.50Mn0.50PO4", "LiFe0.52Mn0.48PO4"]);

        let strict = deduplicate(input.clone(), 0.0, &extractor);
        assert_eq!(strict.kept.len(), 2);

        let loose = deduplicate(input, 0.01, &extractor);
        assert_eq!(loose.kept, vec!["LiFe0.50Mn0.50PO4"]);
    }

    #[test]
    fn test_invalid_lines_are_reported() {
        let extractor = CandidateExtractor::new();
        let report = deduplicate(lines(&["LiFePO4", "Li(Fe", "Xx2O"]), 0.0, &extractor);
        assert_eq!(report.kept, vec!["LiFePO4"]);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].line, 2);
        assert_eq!(report.rejected[1].formula, "Xx2O");
    }
}
