use regex::Regex;

/// 從 LLM 回覆中擷取候選化學式，處理 markdown / LaTeX 格式
#[derive(Debug, Clone)]
pub struct CandidateExtractor {
    math_span: Regex,
    latex_command: Regex,
    braced_subscript: Regex,
    bare_subscript: Regex,
    whitespace: Regex,
    disallowed: Regex,
    reasoning: Regex,
    element_token: Regex,
}

impl Default for CandidateExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateExtractor {
    pub fn new() -> Self {
        Self {
            math_span: Regex::new(r"\$([^$]+)\$").unwrap(),
            latex_command: Regex::new(r"\\[a-zA-Z]+").unwrap(),
            braced_subscript: Regex::new(r"_\{([^}]+)\}").unwrap(),
            bare_subscript: Regex::new(r"_([0-9]+(?:\.[0-9]+)?)").unwrap(),
            whitespace: Regex::new(r"\s+").unwrap(),
            disallowed: Regex::new(r"[^A-Za-z0-9\.\(\)\[\]/·]").unwrap(),
            reasoning: Regex::new(r"(?i)\breasoning\b").unwrap(),
            element_token: Regex::new(r"[A-Z][a-z]?").unwrap(),
        }
    }

    /// 將 LLM 常見格式轉為純文字化學式：
    /// `$Li_{1.02}Fe_{0.70}PO_4$` -> `Li1.02Fe0.70PO4`，`**LiFePO_4**` -> `LiFePO4`
    pub fn clean(&self, text: &str) -> String {
        let text = text.trim();
        if text.is_empty() {
            return String::new();
        }

        let text = text.replace("**", "").replace("__", "");
        let mut text = text.trim_matches('`').trim().to_string();

        if text.contains('$') {
            let longest = self
                .math_spans(&text)
                .into_iter()
                .fold(None::<&str>, |best, chunk| match best {
                    // 以字元數比較，`·` 等多位元組字元只算一個
                    Some(current) if current.chars().count() >= chunk.chars().count() => {
                        Some(current)
                    }
                    _ => Some(chunk),
                })
                .map(str::to_string);
            text = match longest {
                Some(chunk) => chunk,
                None => text.replace('$', ""),
            };
        }

        let text = text.replace(r"\cdot", "·");
        let text = self.latex_command.replace_all(&text, "");
        let text = self.braced_subscript.replace_all(&text, "${1}");
        let text = self.bare_subscript.replace_all(&text, "${1}");
        let text = text.replace(['{', '}'], "");
        let text = self.whitespace.replace_all(&text, "");
        self.disallowed.replace_all(&text, "").into_owned()
    }

    /// 每個 `*` 條列項目清理後的完整內容，保留附帶的說明文字
    pub fn bullet_texts(&self, raw_text: &str) -> Vec<String> {
        raw_text
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                let line = line.strip_prefix("Assistant:").map(str::trim).unwrap_or(line);
                let body = line.strip_prefix('*')?.trim_start_matches('*');
                let cleaned = self.clean(body);
                (!cleaned.is_empty()).then_some(cleaned)
            })
            .collect()
    }

    /// 只讀取以 `*` 開頭的條列行，略過 reasoning 條目與 `history` 中已討論過的材料
    pub fn parse_candidates(&self, raw_text: &str, history: &[String]) -> Vec<String> {
        let mut record: Vec<String> = Vec::new();

        for line in raw_text.trim().lines() {
            let mut line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("Assistant:") {
                line = rest.trim();
            }
            if !line.starts_with('*') || self.reasoning.is_match(line) {
                continue;
            }

            let body = line.trim_start_matches('*').trim();
            if body.is_empty() {
                continue;
            }

            let mut segments = self.math_spans(body);
            if segments.is_empty() {
                segments.push(body);
            }

            for segment in segments {
                let candidate = self.clean(segment);
                if candidate.is_empty() {
                    continue;
                }
                // 單獨的陰離子片段 (如 PO4) 不算候選
                if !candidate.contains("Li") && !candidate.contains("Na") {
                    continue;
                }
                if self.element_token.find_iter(&candidate).count() < 2 {
                    continue;
                }
                if history.contains(&candidate) || record.contains(&candidate) {
                    continue;
                }
                record.push(candidate);
            }
        }

        record
    }

    fn math_spans<'t>(&self, text: &'t str) -> Vec<&'t str> {
        self.math_span
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_latex_subscripts() {
        let extractor = CandidateExtractor::new();
        assert_eq!(
            extractor.clean("$Li_{1.02}Fe_{0.70}Mn_{0.25}Mg_{0.05}PO_4$"),
            "Li1.02Fe0.70Mn0.25Mg0.05PO4"
        );
    }

    #[test]
    fn test_clean_markdown_emphasis() {
        let extractor = CandidateExtractor::new();
        assert_eq!(extractor.clean("**LiFePO_4**"), "LiFePO4");
        assert_eq!(extractor.clean("`LiMn2O4`"), "LiMn2O4");
        assert_eq!(extractor.clean("   "), "");
    }

    #[test]
    fn test_clean_prefers_longest_math_span() {
        let extractor = CandidateExtractor::new();
        assert_eq!(
            extractor.clean("replace $Fe$ in $LiFe_{0.5}Mn_{0.5}PO_4$"),
            "LiFe0.5Mn0.5PO4"
        );
    }

    #[test]
    fn test_clean_longest_span_counts_characters() {
        let extractor = CandidateExtractor::new();
        // 兩段同為 5 位元組，但 `Li·O` 只有 4 個字元
        assert_eq!(extractor.clean("$Li·O$ or $LiCoO$"), "LiCoO");
        assert_eq!(extractor.clean("$LiCoO$ or $NaCoO$"), "LiCoO");
    }

    #[test]
    fn test_bullet_texts_keep_commentary() {
        let extractor = CandidateExtractor::new();
        let raw = "Ranking:\n* LiCoPO4 - highest voltage\nAssistant: * **LiNiPO4**: good\n* \n";
        assert_eq!(
            extractor.bullet_texts(raw),
            vec!["LiCoPO4highestvoltage", "LiNiPO4good"]
        );
    }

    #[test]
    fn test_clean_hydrate_dot_and_commands() {
        let extractor = CandidateExtractor::new();
        assert_eq!(extractor.clean(r"$LiFePO_4 \cdot H_2O$"), "LiFePO4·H2O");
        assert_eq!(extractor.clean(r"$\mathrm{LiCoO_2}$"), "LiCoO2");
    }

    #[test]
    fn test_parse_candidates_reads_only_bullets() {
        let extractor = CandidateExtractor::new();
        let raw = "Here are my suggestions:\n\
                   * $LiFe_{0.9}Mn_{0.1}PO_4$\n\
                   * Reasoning: replacing $PO_4$ groups with Li^+ sites\n\
                   LiCoO2 is a classic option\n\
                   * **LiNi0.5Mn1.5O4**\n";
        let candidates = extractor.parse_candidates(raw, &[]);
        assert_eq!(candidates, vec!["LiFe0.9Mn0.1PO4", "LiNi0.5Mn1.5O4"]);
    }

    #[test]
    fn test_parse_candidates_strips_assistant_prefix() {
        let extractor = CandidateExtractor::new();
        let candidates = extractor.parse_candidates("Assistant: * NaFePO4", &[]);
        assert_eq!(candidates, vec!["NaFePO4"]);
    }

    #[test]
    fn test_parse_candidates_filters_fragments_history_and_repeats() {
        let extractor = CandidateExtractor::new();
        let raw = "* $PO_4$\n* Li\n* LiMnPO4\n* LiMnPO4\n* LiCoPO4";
        let history = vec!["LiCoPO4".to_string()];
        let candidates = extractor.parse_candidates(raw, &history);
        assert_eq!(candidates, vec!["LiMnPO4"]);
    }
}
