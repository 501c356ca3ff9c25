use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::fixes::SuggestedFix;

// ── Job status ────────────────────────────────────────────────────────

/// Lifecycle of a bug-testing job.
///
/// The happy path is strictly ordered; `Failed` may be entered from any
/// non-terminal status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Analyzing,
    SettingUp,
    Testing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Analyzing,
        JobStatus::SettingUp,
        JobStatus::Testing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Analyzing => "ANALYZING",
            Self::SettingUp => "SETTING_UP",
            Self::Testing => "TESTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Active jobs should be re-polled by clients.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// The only status a job may be in immediately before entering `self`.
    /// `None` for `Pending` (initial) and `Failed` (reachable from any
    /// active status).
    pub fn predecessor(&self) -> Option<JobStatus> {
        match self {
            Self::Pending | Self::Failed => None,
            Self::Analyzing => Some(Self::Pending),
            Self::SettingUp => Some(Self::Analyzing),
            Self::Testing => Some(Self::SettingUp),
            Self::Completed => Some(Self::Testing),
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed => true,
            other => other.predecessor() == Some(*self),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "ANALYZING" => Ok(Self::Analyzing),
            "SETTING_UP" => Ok(Self::SettingUp),
            "TESTING" => Ok(Self::Testing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

// ── Test / bug enums ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PASS" => Ok(Self::Pass),
            "FAIL" => Ok(Self::Fail),
            "ERROR" => Ok(Self::Error),
            _ => Err(format!("Invalid test status: {} (expected PASS, FAIL or ERROR)", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    Low,
    #[default]
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

impl FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            _ => Err(format!("Invalid confidence: {} (expected LOW, MEDIUM or HIGH)", s)),
        }
    }
}

// ── Discovered facts ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub method: String,
    pub path: String,
    pub file: String,
}

/// What the agent learned about the target application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<Endpoint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_vars_needed: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_used: Option<bool>,
}

impl DiscoveryInfo {
    /// Merge-patch `patch` into `self`. Absent or empty fields never erase a
    /// known value. Returns the names of the fields that changed.
    pub fn merge(&mut self, patch: DiscoveryInfo) -> Vec<&'static str> {
        let mut changed = Vec::new();
        merge_text(&mut self.entry_point, patch.entry_point, "entryPoint", &mut changed);
        merge_text(&mut self.framework, patch.framework, "framework", &mut changed);
        merge_text(&mut self.module_type, patch.module_type, "moduleType", &mut changed);
        merge_list(&mut self.endpoints, patch.endpoints, "endpoints", &mut changed);
        merge_list(
            &mut self.env_vars_needed,
            patch.env_vars_needed,
            "envVarsNeeded",
            &mut changed,
        );
        merge_value(&mut self.database_used, patch.database_used, "databaseUsed", &mut changed);
        changed
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// How the target application was started inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_running: Option<bool>,
}

impl ServerInfo {
    pub fn merge(&mut self, patch: ServerInfo) -> Vec<&'static str> {
        let mut changed = Vec::new();
        merge_value(&mut self.port, patch.port.filter(|p| *p > 0), "port", &mut changed);
        merge_text(&mut self.sandbox_url, patch.sandbox_url, "sandboxUrl", &mut changed);
        merge_text(&mut self.start_command, patch.start_command, "startCommand", &mut changed);
        merge_value(&mut self.is_running, patch.is_running, "isRunning", &mut changed);
        changed
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn merge_text(
    slot: &mut Option<String>,
    value: Option<String>,
    name: &'static str,
    changed: &mut Vec<&'static str>,
) {
    if let Some(v) = value.filter(|v| !v.trim().is_empty())
        && slot.as_ref() != Some(&v)
    {
        *slot = Some(v);
        changed.push(name);
    }
}

fn merge_list<T: PartialEq>(
    slot: &mut Option<Vec<T>>,
    value: Option<Vec<T>>,
    name: &'static str,
    changed: &mut Vec<&'static str>,
) {
    if let Some(v) = value.filter(|v| !v.is_empty())
        && slot.as_ref() != Some(&v)
    {
        *slot = Some(v);
        changed.push(name);
    }
}

fn merge_value<T: PartialEq>(
    slot: &mut Option<T>,
    value: Option<T>,
    name: &'static str,
    changed: &mut Vec<&'static str>,
) {
    if let Some(v) = value
        && slot.as_ref() != Some(&v)
    {
        *slot = Some(v);
        changed.push(name);
    }
}

// ── Records ───────────────────────────────────────────────────────────

/// One executed test file's outcome. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_file: String,
    pub test_name: String,
    #[serde(default)]
    pub file_content: String,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub executed_at: String,
}

/// One confirmed defect. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedError {
    pub test_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_fixes: Vec<SuggestedFix>,
}

impl DetectedError {
    /// Identity used to line up the same bug across two runs.
    pub fn comparison_key(&self) -> String {
        format!(
            "{}::{}",
            self.source_file.as_deref().unwrap_or("unknown"),
            self.message
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub external_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: i64,
    pub user_id: i64,
    pub repo_owner: String,
    pub repo_name: String,
    pub repo_url: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: i64,
    pub user_id: i64,
    pub repository_id: i64,
    pub status: JobStatus,
    pub bug_description: String,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub sandbox_id: Option<String>,
    pub discovery_info: Option<DiscoveryInfo>,
    pub server_info: Option<ServerInfo>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Terminal payload of a run, assembled from durable rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub status: JobStatus,
    pub summary: String,
    pub discovery_info: DiscoveryInfo,
    pub server_info: ServerInfo,
    pub test_results: Vec<TestResult>,
    pub detected_errors: Vec<DetectedError>,
}

/// Split a GitHub URL (`https://github.com/owner/repo(.git)`, `git@github.com:owner/repo`,
/// or bare `owner/repo`) into its owner and repository name.
pub fn parse_github_url(url: &str) -> Option<(String, String)> {
    let trimmed = url.trim().trim_end_matches('/').trim_end_matches(".git");
    let path = if let Some(rest) = trimmed.strip_prefix("git@github.com:") {
        rest
    } else if let Some(idx) = trimmed.find("github.com/") {
        &trimmed[idx + "github.com/".len()..]
    } else if !trimmed.contains("://") {
        trimmed
    } else {
        return None;
    };
    let mut parts = path.split('/');
    let owner = parts.next()?.trim();
    let name = parts.next()?.trim();
    if owner.is_empty() || name.is_empty() || parts.next().is_some() {
        return None;
    }
    Some((owner.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Analyzing,
            JobStatus::SettingUp,
            JobStatus::Testing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::from_str("RUNNING").is_err());
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Analyzing));
        assert!(JobStatus::Analyzing.can_transition_to(JobStatus::SettingUp));
        assert!(JobStatus::SettingUp.can_transition_to(JobStatus::Testing));
        assert!(JobStatus::Testing.can_transition_to(JobStatus::Completed));

        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Testing));
        assert!(!JobStatus::Testing.can_transition_to(JobStatus::Analyzing));
        assert!(!JobStatus::Analyzing.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_failed_reachable_from_any_active_status() {
        for status in JobStatus::ACTIVE {
            assert!(status.can_transition_to(JobStatus::Failed), "{status}");
        }
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        let json = serde_json::to_string(&JobStatus::SettingUp).unwrap();
        assert_eq!(json, "\"SETTING_UP\"");
    }

    #[test]
    fn test_discovery_merge_keeps_known_facts() {
        let mut info = DiscoveryInfo {
            framework: Some("express".into()),
            database_used: Some(true),
            ..Default::default()
        };
        let changed = info.merge(DiscoveryInfo {
            framework: Some("  ".into()),
            entry_point: Some("src/index.js".into()),
            endpoints: Some(vec![]),
            ..Default::default()
        });
        assert_eq!(changed, vec!["entryPoint"]);
        assert_eq!(info.framework.as_deref(), Some("express"));
        assert_eq!(info.entry_point.as_deref(), Some("src/index.js"));
        assert_eq!(info.database_used, Some(true));
        assert!(info.endpoints.is_none());
    }

    #[test]
    fn test_discovery_merge_unchanged_value_not_reported() {
        let mut info = DiscoveryInfo {
            module_type: Some("esm".into()),
            ..Default::default()
        };
        let changed = info.merge(DiscoveryInfo {
            module_type: Some("esm".into()),
            ..Default::default()
        });
        assert!(changed.is_empty());
    }

    #[test]
    fn test_server_info_merge_ignores_zero_port() {
        let mut info = ServerInfo {
            port: Some(3000),
            ..Default::default()
        };
        let changed = info.merge(ServerInfo {
            port: Some(0),
            is_running: Some(true),
            ..Default::default()
        });
        assert_eq!(changed, vec!["isRunning"]);
        assert_eq!(info.port, Some(3000));
    }

    #[test]
    fn test_comparison_key_defaults_source_file() {
        let bug = DetectedError {
            test_file: "tests/a.test.js".into(),
            test_name: None,
            message: "weak password accepted".into(),
            source_file: None,
            root_cause: None,
            confidence: Confidence::High,
            suggested_fixes: vec![],
        };
        assert_eq!(bug.comparison_key(), "unknown::weak password accepted");
    }

    #[test]
    fn test_parse_github_url_variants() {
        let expected = Some(("acme".to_string(), "shop".to_string()));
        assert_eq!(parse_github_url("https://github.com/acme/shop"), expected);
        assert_eq!(parse_github_url("https://github.com/acme/shop.git"), expected);
        assert_eq!(parse_github_url("git@github.com:acme/shop.git"), expected);
        assert_eq!(parse_github_url("acme/shop/"), expected);
        assert_eq!(parse_github_url("https://gitlab.com/acme/shop"), None);
        assert_eq!(parse_github_url("acme"), None);
    }
}
