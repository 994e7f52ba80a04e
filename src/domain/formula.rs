use crate::domain::elements;
use crate::utils::error::{BatteryError, Result};
use std::collections::BTreeMap;
use std::fmt;

/// 比較原子分率時的絕對誤差
const FRACTION_EPSILON: f64 = 1e-9;

/// 元素 -> 原子數，元素順序不影響相等性
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Composition {
    amounts: BTreeMap<String, f64>,
}

impl Composition {
    /// 解析化學式，支援括號、方括號、小數/分數下標及結晶水 (`·` 或 `*`)
    pub fn parse(text: &str) -> Result<Self> {
        FormulaParser::new(text).parse()
    }

    pub fn amount(&self, symbol: &str) -> f64 {
        self.amounts.get(symbol).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.amount(symbol) > 0.0
    }

    pub fn elements(&self) -> impl Iterator<Item = &str> {
        self.amounts.keys().map(String::as_str)
    }

    pub fn element_count(&self) -> usize {
        self.amounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.amounts.is_empty()
    }

    pub fn total_atoms(&self) -> f64 {
        self.amounts.values().sum()
    }

    /// 莫耳質量 (g/mol)
    pub fn molar_mass(&self) -> f64 {
        self.amounts
            .iter()
            .map(|(symbol, amount)| elements::atomic_mass(symbol).unwrap_or(0.0) * amount)
            .sum()
    }

    /// 原子分率，總和為 1
    pub fn fractions(&self) -> BTreeMap<String, f64> {
        let total = self.total_atoms();
        self.amounts
            .iter()
            .map(|(symbol, amount)| (symbol.clone(), amount / total))
            .collect()
    }

    /// 元素集合相同且每個原子分率差不超過 `tolerance` 即視為同一材料。
    /// `tolerance = 0` 時只有整體倍數關係的化學式相符 (LiFePO4 / Li2Fe2P2O8)。
    pub fn range_match(&self, other: &Composition, tolerance: f64) -> bool {
        if self.amounts.len() != other.amounts.len()
            || !self.amounts.keys().all(|symbol| other.amounts.contains_key(symbol))
        {
            return false;
        }

        let limit = tolerance.max(0.0) + FRACTION_EPSILON;
        let ours = self.fractions();
        let theirs = other.fractions();
        ours.iter()
            .all(|(symbol, fraction)| (fraction - theirs[symbol]).abs() <= limit)
    }

    fn add(&mut self, symbol: &str, amount: f64) {
        *self.amounts.entry(symbol.to_string()).or_insert(0.0) += amount;
    }

    fn merge_scaled(&mut self, other: &Composition, factor: f64) {
        for (symbol, amount) in &other.amounts {
            self.add(symbol, amount * factor);
        }
    }
}

impl fmt::Display for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (symbol, amount) in &self.amounts {
            if (amount - 1.0).abs() < FRACTION_EPSILON {
                write!(f, "{}", symbol)?;
            } else {
                write!(f, "{}{}", symbol, amount)?;
            }
        }
        Ok(())
    }
}

/// 清理後的化學式字串與其組成
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    text: String,
    composition: Composition,
}

impl Formula {
    pub fn parse(text: &str) -> Result<Self> {
        let compact: String = text.split_whitespace().collect();
        let composition = Composition::parse(&compact)?;
        Ok(Self {
            text: compact,
            composition,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn composition(&self) -> &Composition {
        &self.composition
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

struct FormulaParser<'a> {
    text: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl<'a> FormulaParser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            chars: text.char_indices().collect(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<Composition> {
        if self.chars.is_empty() {
            return Err(self.error_at(0, "empty formula"));
        }

        let mut total = Composition::default();
        loop {
            let part = self.parse_part()?;
            total.merge_scaled(&part, 1.0);

            match self.peek() {
                None => break,
                Some('·') | Some('*') => {
                    self.pos += 1;
                    if self.peek().is_none() {
                        return Err(self.error_here("dangling hydrate separator"));
                    }
                }
                Some(c) => {
                    return Err(self.error_here(&format!("unexpected character '{}'", c)));
                }
            }
        }

        Ok(total)
    }

    fn parse_part(&mut self) -> Result<Composition> {
        let coefficient = if self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.parse_amount()?
        } else {
            1.0
        };

        let start = self.offset();
        let groups = self.parse_groups()?;
        if groups.is_empty() {
            return Err(self.error_at(start, "expected an element symbol"));
        }

        let mut part = Composition::default();
        part.merge_scaled(&groups, coefficient);
        Ok(part)
    }

    fn parse_groups(&mut self) -> Result<Composition> {
        let mut composition = Composition::default();

        loop {
            match self.peek() {
                Some(c) if c.is_ascii_uppercase() => {
                    let symbol = self.parse_symbol()?;
                    let amount = self.parse_optional_amount()?;
                    composition.add(&symbol, amount);
                }
                Some(open @ ('(' | '[')) => {
                    let start = self.offset();
                    let close = if open == '(' { ')' } else { ']' };
                    self.pos += 1;

                    let inner = self.parse_groups()?;
                    if inner.is_empty() {
                        return Err(self.error_at(start, "empty group"));
                    }
                    if self.peek() != Some(close) {
                        return Err(self.error_at(start, &format!("unbalanced '{}'", open)));
                    }
                    self.pos += 1;

                    let amount = self.parse_optional_amount()?;
                    composition.merge_scaled(&inner, amount);
                }
                _ => break,
            }
        }

        Ok(composition)
    }

    fn parse_symbol(&mut self) -> Result<String> {
        let start = self.offset();
        let mut symbol = String::new();
        if let Some(c) = self.peek() {
            symbol.push(c);
            self.pos += 1;
        }
        if let Some(c) = self.peek().filter(|c| c.is_ascii_lowercase()) {
            symbol.push(c);
            self.pos += 1;
        }

        if !elements::is_element(&symbol) {
            return Err(self.error_at(start, &format!("unknown element '{}'", symbol)));
        }
        Ok(symbol)
    }

    fn parse_optional_amount(&mut self) -> Result<f64> {
        if self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.parse_amount()
        } else {
            Ok(1.0)
        }
    }

    fn parse_amount(&mut self) -> Result<f64> {
        let start = self.offset();
        let numerator = self.parse_decimal()?;
        let value = if self.peek() == Some('/') {
            self.pos += 1;
            let denominator = self.parse_decimal()?;
            if denominator == 0.0 {
                return Err(self.error_at(start, "division by zero in amount"));
            }
            numerator / denominator
        } else {
            numerator
        };

        if !value.is_finite() || value <= 0.0 {
            return Err(self.error_at(start, "amount must be positive"));
        }
        Ok(value)
    }

    fn parse_decimal(&mut self) -> Result<f64> {
        let start = self.offset();
        let mut digits = String::new();

        while let Some(c) = self.peek().filter(|c| c.is_ascii_digit()) {
            digits.push(c);
            self.pos += 1;
        }
        if digits.is_empty() {
            return Err(self.error_at(start, "expected a number"));
        }

        if self.peek() == Some('.') {
            digits.push('.');
            self.pos += 1;
            let before = digits.len();
            while let Some(c) = self.peek().filter(|c| c.is_ascii_digit()) {
                digits.push(c);
                self.pos += 1;
            }
            if digits.len() == before {
                return Err(self.error_at(start, "malformed number"));
            }
        }

        digits
            .parse::<f64>()
            .map_err(|_| self.error_at(start, "malformed number"))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.text.len())
    }

    fn error_here(&self, reason: &str) -> BatteryError {
        self.error_at(self.offset(), reason)
    }

    fn error_at(&self, position: usize, reason: &str) -> BatteryError {
        BatteryError::InvalidFormula {
            formula: self.text.to_string(),
            position,
            reason: reason.to_string(),
        }
    }
}
