use crate::domain::formula::{Composition, Formula};
use crate::domain::model::Novelty;
use crate::domain::ports::MaterialsDatabase;
use crate::utils::error::Result;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

/// 檢索資料庫的 CSV 欄位：formula,capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRow {
    pub formula: String,
    pub capacity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbEntry {
    pub formula: String,
    pub composition: Composition,
    pub capacity: f64,
}

/// 由 ICSD 匯出資料建立的本地檢索資料庫
#[derive(Debug, Clone, Default)]
pub struct RetrievalDb {
    entries: Vec<DbEntry>,
}

impl RetrievalDb {
    pub fn from_entries(entries: Vec<DbEntry>) -> Self {
        Self { entries }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let db = Self::from_reader(file)?;
        tracing::info!(
            "📚 Loaded {} retrieval entries from {}",
            db.len(),
            path.as_ref().display()
        );
        Ok(db)
    }

    /// 檔案不存在時回傳空資料庫，ICSD 檢查即視為全部新穎
    pub fn load_or_empty<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            tracing::warn!(
                "⚠️ Retrieval DB {} not found, ICSD novelty checks will pass every candidate",
                path.as_ref().display()
            );
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let mut entries = Vec::new();

        for (index, row) in csv_reader.deserialize::<RetrievalRow>().enumerate() {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    tracing::warn!("Skipping retrieval row {}: {}", index + 1, e);
                    continue;
                }
            };
            match Formula::parse(&row.formula) {
                Ok(formula) => entries.push(DbEntry {
                    formula: row.formula,
                    composition: formula.composition().clone(),
                    capacity: row.capacity,
                }),
                Err(e) => tracing::warn!("Skipping retrieval row {}: {}", index + 1, e),
            }
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DbEntry] {
        &self.entries
    }

    pub fn find_match(&self, composition: &Composition, tolerance: f64) -> Option<&DbEntry> {
        self.entries
            .iter()
            .find(|entry| entry.composition.range_match(composition, tolerance))
    }
}

pub fn icsd_search<'a>(formula: &Formula, db: &'a RetrievalDb, tolerance: f64) -> Option<&'a DbEntry> {
    db.find_match(formula.composition(), tolerance)
}

pub fn icsd_novelty(formula: &Formula, db: &RetrievalDb, tolerance: f64) -> Novelty {
    match icsd_search(formula, db, tolerance) {
        Some(entry) => Novelty::Known {
            matched: entry.formula.clone(),
        },
        None => Novelty::Novel,
    }
}

/// 服務錯誤不會中斷流程，只回報為 Unavailable
pub async fn mp_search(formula: &str, materials: &dyn MaterialsDatabase) -> Novelty {
    match materials.lookup(formula).await {
        Ok(Some(material_id)) => Novelty::Known {
            matched: material_id,
        },
        Ok(None) => Novelty::Novel,
        Err(e) => {
            tracing::warn!("⚠️ Materials Project lookup for {} failed: {}", formula, e);
            Novelty::Unavailable {
                reason: e.to_string(),
            }
        }
    }
}
