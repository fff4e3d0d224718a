use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A natural-language feature description submitted against a factory.
/// Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRequest {
    pub id: Uuid,
    pub factory_id: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl FeatureRequest {
    pub fn new(factory_id: i64, description: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            factory_id,
            description: description.trim().to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Structured output of the planning step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplementationPlan {
    #[serde(default)]
    pub summary: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ImplementationPlan {
    /// Parse a plan from collaborator text. Leading/trailing prose and
    /// markdown fences around the JSON object are tolerated.
    pub fn parse(text: &str) -> Result<Self, String> {
        let cleaned = match (text.find('{'), text.rfind('}')) {
            (Some(start), Some(end)) if end > start => &text[start..=end],
            _ => text,
        };
        let plan: Self = serde_json::from_str(cleaned)
            .map_err(|e| format!("plan is not valid JSON: {}", e))?;
        plan.check()?;
        Ok(plan)
    }

    /// Reject plans the synthesizer cannot act on.
    pub fn check(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("plan has no steps".to_string());
        }
        if let Some(idx) = self
            .steps
            .iter()
            .position(|s| s.description.trim().is_empty())
        {
            return Err(format!("plan step {} has an empty description", idx + 1));
        }
        Ok(())
    }

    /// Every file path the plan mentions, in first-seen order.
    pub fn all_files(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        for f in self
            .target_files
            .iter()
            .chain(self.steps.iter().flat_map(|s| s.files.iter()))
        {
            if !files.contains(f) {
                files.push(f.clone());
            }
        }
        files
    }
}

/// One finding from a static check or test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    pub message: String,
    #[serde(default)]
    pub rule: String,
}

impl Diagnostic {
    pub fn new(file: Option<&str>, line: Option<u32>, message: &str, rule: &str) -> Self {
        Self {
            file: file.map(str::to_string),
            line,
            message: message.to_string(),
            rule: rule.to_string(),
        }
    }

    /// A diagnostic produced by the factory itself rather than a checker.
    pub fn synthetic(rule: &str, message: &str) -> Self {
        Self::new(None, None, message, rule)
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{}:{}: ", file, line)?,
            (Some(file), None) => write!(f, "{}: ", file)?,
            _ => {}
        }
        if self.rule.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} [{}]", self.message, self.rule)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            diagnostics: Vec::new(),
        }
    }

    pub fn fail(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            passed: false,
            diagnostics,
        }
    }

    pub fn timed_out(step: &str, secs: u64) -> Self {
        Self::fail(vec![Diagnostic::synthetic(
            "timeout",
            &format!("{} did not finish within {}s", step, secs),
        )])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailingCase {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: bool,
    #[serde(default)]
    pub failing_cases: Vec<FailingCase>,
    #[serde(default)]
    pub coverage_pct: Option<f64>,
}

impl TestResult {
    pub fn pass(coverage_pct: Option<f64>) -> Self {
        Self {
            passed: true,
            failing_cases: Vec::new(),
            coverage_pct,
        }
    }

    pub fn fail(failing_cases: Vec<FailingCase>) -> Self {
        Self {
            passed: false,
            failing_cases,
            coverage_pct: None,
        }
    }

    pub fn timed_out(secs: u64) -> Self {
        Self::fail(vec![FailingCase {
            name: "timeout".to_string(),
            message: format!("test suite did not finish within {}s", secs),
            stack: None,
        }])
    }

    /// Failing cases rendered as diagnostics for the next synthesis call.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.failing_cases
            .iter()
            .map(|case| Diagnostic {
                file: None,
                line: None,
                message: match &case.stack {
                    Some(stack) if !stack.is_empty() => {
                        format!("{}: {}\n{}", case.name, case.message, stack)
                    }
                    _ => format!("{}: {}", case.name, case.message),
                },
                rule: "test".to_string(),
            })
            .collect()
    }
}
