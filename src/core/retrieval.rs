use crate::core::capacity::theoretical_capacity;
use crate::core::search::RetrievalRow;
use crate::domain::formula::Formula;
use crate::domain::model::BatteryTask;
use crate::domain::ports::{Pipeline, StageReport, Storage};
use crate::utils::error::{BatteryError, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;

/// ICSD 等匯出檔常見的化學式欄位名稱，依序比對
pub const FORMULA_COLUMN_CANDIDATES: &[&str] = &[
    "formula",
    "Formula",
    "chemical_formula",
    "Chemical formula",
    "chemical formula",
    "composition",
    "Composition",
    "compound",
    "Compound",
    "reduced_formula",
    "pretty_formula",
];

pub fn infer_formula_column<'a, I>(headers: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let headers: Vec<&str> = headers.into_iter().collect();
    FORMULA_COLUMN_CANDIDATES
        .iter()
        .find(|candidate| headers.contains(*candidate))
        .map(|candidate| candidate.to_string())
}

/// 依副檔名讀取：.csv / .tsv 取化學式欄位，其他視為每行一個化學式
pub fn read_formulas(input_file: &str, data: &[u8], formula_column: Option<&str>) -> Result<Vec<String>> {
    let extension = Path::new(input_file)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    let delimiter = match extension.as_deref() {
        Some("csv") => b',',
        Some("tsv") => b'\t',
        _ => {
            return Ok(String::from_utf8_lossy(data)
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect());
        }
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(data);
    let headers = reader.headers()?.clone();

    let column = match formula_column {
        Some(column) => Some(column.to_string()),
        None => infer_formula_column(headers.iter()),
    };
    let index = column
        .as_deref()
        .and_then(|column| headers.iter().position(|h| h == column))
        .ok_or_else(|| BatteryError::ValidationError {
            message: format!(
                "Could not infer formula column from {:?}. Pass --formula_column explicitly.",
                headers.iter().collect::<Vec<_>>()
            ),
        })?;

    tracing::debug!("Reading formulas from column {} of {}", index, input_file);
    let mut formulas = Vec::new();
    for record in reader.records() {
        let record = record?;
        formulas.push(record.get(index).unwrap_or_default().to_string());
    }
    Ok(formulas)
}

/// 錯誤報表的一列：formula,stage,error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildError {
    pub formula: String,
    pub stage: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    pub rows: Vec<RetrievalRow>,
    pub errors: Vec<BuildError>,
    pub other_carrier: usize,
    pub duplicates: usize,
}

impl StageReport for BuildReport {
    fn kept(&self) -> usize {
        self.rows.len()
    }

    fn rejected(&self) -> usize {
        self.errors.len()
    }
}

/// 只保留含載流子元素的化學式並計算理論容量
pub fn build_rows(formulas: Vec<String>, task: BatteryTask, deduplicate_exact: bool) -> BuildReport {
    let mut report = BuildReport::default();
    let mut seen = HashSet::new();

    for raw in formulas {
        let formula: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        if formula.is_empty() {
            continue;
        }

        let parsed = match Formula::parse(&formula) {
            Ok(parsed) => parsed,
            Err(e) => {
                report.errors.push(BuildError {
                    formula,
                    stage: "parse_formula".to_string(),
                    error: e.to_string(),
                });
                continue;
            }
        };

        if parsed.composition().amount(task.carrier_element()) <= 0.0 {
            report.other_carrier += 1;
            continue;
        }

        let capacity = theoretical_capacity(parsed.composition(), task);
        if !capacity.is_finite() || capacity <= 0.0 {
            report.errors.push(BuildError {
                formula,
                stage: "capacity".to_string(),
                error: format!("invalid theoretical capacity {}", capacity),
            });
            continue;
        }

        if deduplicate_exact && !seen.insert(formula.clone()) {
            report.duplicates += 1;
            continue;
        }

        report.rows.push(RetrievalRow { formula, capacity });
    }

    report
}

/// 由 ICSD 匯出檔建立 `formula,capacity` 檢索資料庫
pub struct RetrievalBuildPipeline<S: Storage> {
    storage: S,
    input_file: String,
    output_file: String,
    task: BatteryTask,
    formula_column: Option<String>,
    deduplicate_exact: bool,
    errors_file: Option<String>,
}

impl<S: Storage> RetrievalBuildPipeline<S> {
    pub fn new(storage: S, input_file: impl Into<String>, task: BatteryTask) -> Self {
        Self {
            storage,
            input_file: input_file.into(),
            output_file: task.default_db_path().to_string(),
            task,
            formula_column: None,
            deduplicate_exact: false,
            errors_file: None,
        }
    }

    pub fn with_output_file(mut self, output_file: Option<String>) -> Self {
        if let Some(output_file) = output_file {
            self.output_file = output_file;
        }
        self
    }

    pub fn with_formula_column(mut self, formula_column: Option<String>) -> Self {
        self.formula_column = formula_column;
        self
    }

    pub fn with_exact_dedup(mut self, deduplicate_exact: bool) -> Self {
        self.deduplicate_exact = deduplicate_exact;
        self
    }

    pub fn with_errors_file(mut self, errors_file: Option<String>) -> Self {
        self.errors_file = errors_file;
        self
    }
}

#[async_trait::async_trait]
impl<S: Storage> Pipeline for RetrievalBuildPipeline<S> {
    type Item = String;
    type Report = BuildReport;

    async fn extract(&self) -> Result<Vec<String>> {
        let data = self.storage.read_file(&self.input_file).await?;
        read_formulas(&self.input_file, &data, self.formula_column.as_deref())
    }

    async fn transform(&self, data: Vec<String>) -> Result<BuildReport> {
        let report = build_rows(data, self.task, self.deduplicate_exact);
        tracing::info!(
            "🔋 {} formulas contain {}, {} without it",
            report.rows.len() + report.duplicates,
            self.task.carrier_element(),
            report.other_carrier
        );
        if !report.errors.is_empty() {
            tracing::warn!("⚠️ Skipped {} rows with errors", report.errors.len());
        }
        Ok(report)
    }

    async fn load(&self, report: BuildReport) -> Result<String> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.write_record(["formula", "capacity"])?;
        for row in &report.rows {
            writer.serialize(row)?;
        }
        let data = writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        self.storage.write_file(&self.output_file, &data).await?;

        if let Some(errors_file) = &self.errors_file {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(Vec::new());
            writer.write_record(["formula", "stage", "error"])?;
            for error in &report.errors {
                writer.serialize(error)?;
            }
            let data = writer
                .into_inner()
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            self.storage.write_file(errors_file, &data).await?;
            tracing::info!("📝 Wrote errors to {}", self.storage.location(errors_file));
        }

        Ok(self.storage.location(&self.output_file))
    }
}
