use crate::domain::formula::{Composition, Formula};
use crate::domain::model::BatteryTask;
use crate::utils::error::Result;
use serde::Serialize;

/// 法拉第常數 (C/mol)
pub const FARADAY: f64 = 96485.33212;

/// 理論比容量 (mAh/g) = n·F / (3.6·M)，n 為載流子 (Li/Na) 原子數
pub fn theoretical_capacity(composition: &Composition, task: BatteryTask) -> f64 {
    let molar_mass = composition.molar_mass();
    if molar_mass <= 0.0 {
        return 0.0;
    }
    composition.amount(task.carrier_element()) * FARADAY / (3.6 * molar_mass)
}

pub fn capacity_of(formula: &str, task: BatteryTask) -> Result<f64> {
    let parsed = Formula::parse(formula)?;
    Ok(theoretical_capacity(parsed.composition(), task))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    pub input_capacity: f64,
    /// 無法解析的候選為 None
    pub output_capacity: Option<f64>,
    pub improved: bool,
}

/// 候選化學式格式錯誤時不中斷流程，只標記為未改善
pub fn decide_against(input_capacity: f64, output_formula: &str, task: BatteryTask) -> Decision {
    match capacity_of(output_formula, task) {
        Ok(output_capacity) => Decision {
            input_capacity,
            output_capacity: Some(output_capacity),
            improved: output_capacity > input_capacity,
        },
        Err(e) => {
            tracing::debug!("Candidate '{}' is not a valid formula: {}", output_formula, e);
            Decision {
                input_capacity,
                output_capacity: None,
                improved: false,
            }
        }
    }
}

pub fn decide_one_pair(input_formula: &str, output_formula: &str, task: BatteryTask) -> Result<Decision> {
    let input_capacity = capacity_of(input_formula, task)?;
    Ok(decide_against(input_capacity, output_formula, task))
}

pub fn decide_pairs(
    input_formula: &str,
    output_formulas: &[String],
    task: BatteryTask,
) -> Result<Vec<(String, Decision)>> {
    let input_capacity = capacity_of(input_formula, task)?;
    Ok(output_formulas
        .iter()
        .map(|formula| (formula.clone(), decide_against(input_capacity, formula, task)))
        .collect())
}
