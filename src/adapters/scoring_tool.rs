use crate::core::capacity::capacity_of;
use crate::domain::model::{BatteryTask, Candidate};
use crate::domain::ports::Scorer;
use crate::utils::error::{BatteryError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// 外部評分程式：stdin 每行一個化學式，stdout 回傳 `formula<空白|,>score`
pub struct CommandScorer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandScorer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl Scorer for CommandScorer {
    async fn score(&self, candidates: &[Candidate]) -> Result<Vec<Candidate>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| BatteryError::ScoringError {
            message: format!("failed to start '{}': {}", self.program, e),
        })?;

        let input: String = candidates
            .iter()
            .map(|candidate| format!("{}\n", candidate.formula))
            .collect();

        // 評分程式可能不讀完 stdin 就結束，BrokenPipe 不算錯誤
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        tracing::warn!("Failed to write to scoring tool stdin: {}", e);
                    }
                }
            });
        }

        tracing::debug!(
            "Scoring {} candidates with {} {:?}",
            candidates.len(),
            self.program,
            self.args
        );

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| BatteryError::ScoringError {
                message: format!(
                    "'{}' did not finish within {}s",
                    self.program,
                    self.timeout.as_secs()
                ),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BatteryError::ScoringError {
                message: format!("'{}' exited with {}: {}", self.program, output.status, stderr.trim()),
            });
        }

        parse_score_lines(&String::from_utf8_lossy(&output.stdout))
    }

    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// 分數取最後一個分隔符之後的欄位，化學式本身不含空白與逗號
pub fn parse_score_lines(text: &str) -> Result<Vec<Candidate>> {
    let mut scored = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // 分隔符可能是多位元組空白 (如 NBSP)，以字元邊界切割
        let (split_at, separator) = line
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace() || *c == ',')
            .ok_or_else(|| BatteryError::ScoringError {
                message: format!("line {}: expected 'formula score', got '{}'", index + 1, line),
            })?;
        let formula = line[..split_at].trim_end_matches(|c: char| c.is_whitespace() || c == ',');
        let score_text = line[split_at + separator.len_utf8()..].trim();

        let score: f64 = score_text.parse().map_err(|_| BatteryError::ScoringError {
            message: format!("line {}: invalid score '{}'", index + 1, score_text),
        })?;
        if formula.is_empty() {
            return Err(BatteryError::ScoringError {
                message: format!("line {}: missing formula", index + 1),
            });
        }

        scored.push(Candidate::scored(formula, score));
    }

    Ok(scored)
}

/// 內建評分：理論比容量
pub struct CapacityScorer {
    task: BatteryTask,
}

impl CapacityScorer {
    pub fn new(task: BatteryTask) -> Self {
        Self { task }
    }
}

#[async_trait]
impl Scorer for CapacityScorer {
    async fn score(&self, candidates: &[Candidate]) -> Result<Vec<Candidate>> {
        Ok(candidates
            .iter()
            .map(|candidate| match capacity_of(&candidate.formula, self.task) {
                Ok(capacity) => Candidate::scored(candidate.formula.clone(), capacity),
                Err(e) => {
                    tracing::debug!("No capacity for '{}': {}", candidate.formula, e);
                    Candidate::new(candidate.formula.clone())
                }
            })
            .collect())
    }

    fn describe(&self) -> String {
        format!("theoretical capacity ({})", self.task)
    }
}
