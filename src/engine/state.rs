use std::collections::BTreeMap;

use serde::Serialize;
use sentinel_common::{DetectedError, DiscoveryInfo, Job, ServerInfo, TestResult};

use crate::sandbox::repo_path;

/// In-memory mirror of one run's findings.
///
/// Tools write here after their durable write succeeds, and the agent loop
/// shows a snapshot of it to the model every turn. After a restart the
/// state is rebuilt from the job's rows with [`RunState::rehydrate`], so the
/// rows stay the source of truth.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub summary: String,
    /// Last content written per path, keyed by normalized sandbox path.
    pub test_files: BTreeMap<String, String>,
    pub discovery_info: DiscoveryInfo,
    pub server_info: ServerInfo,
    pub test_results: Vec<TestResult>,
    pub detected_errors: Vec<DetectedError>,
    /// Set once a provisioned database URI lives in `.env`; later `.env`
    /// writes merge instead of overwriting. Not persisted: after a restart
    /// `createEnv` recovers it from the job's provisioning marker.
    #[serde(skip)]
    pub env_merge: bool,
}

impl RunState {
    pub fn rehydrate(job: &Job, tests: Vec<TestResult>, bugs: Vec<DetectedError>) -> Self {
        let mut test_files = BTreeMap::new();
        for test in &tests {
            test_files.insert(file_key(&test.test_file), test.file_content.clone());
        }
        Self {
            summary: job.summary.clone().unwrap_or_default(),
            test_files,
            discovery_info: job.discovery_info.clone().unwrap_or_default(),
            server_info: job.server_info.clone().unwrap_or_default(),
            test_results: tests,
            detected_errors: bugs,
            env_merge: false,
        }
    }

    pub fn remember_file(&mut self, path: &str, content: &str) {
        self.test_files.insert(file_key(path), content.to_string());
    }

    pub fn file_content(&self, path: &str) -> Option<&str> {
        self.test_files.get(&file_key(path)).map(String::as_str)
    }

    /// Compact JSON view for the model. File bodies are left out; the model
    /// already wrote them and can read them back.
    pub fn snapshot(&self) -> String {
        let view = serde_json::json!({
            "discoveryInfo": self.discovery_info,
            "serverInfo": self.server_info,
            "filesWritten": self.test_files.keys().collect::<Vec<_>>(),
            "testResults": self.test_results.iter().map(|t| serde_json::json!({
                "testFile": t.test_file,
                "testName": t.test_name,
                "status": t.status,
                "exitCode": t.exit_code,
            })).collect::<Vec<_>>(),
            "detectedErrors": self.detected_errors.iter().map(|b| serde_json::json!({
                "testFile": b.test_file,
                "message": b.message,
                "sourceFile": b.source_file,
            })).collect::<Vec<_>>(),
        });
        view.to_string()
    }
}

fn file_key(path: &str) -> String {
    repo_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_common::{JobStatus, TestStatus};

    fn job() -> Job {
        Job {
            id: 1,
            user_id: 1,
            repository_id: 1,
            status: JobStatus::Testing,
            bug_description: "login 500s".into(),
            summary: None,
            error: None,
            sandbox_id: Some("sbx".into()),
            discovery_info: Some(DiscoveryInfo {
                framework: Some("express".into()),
                ..DiscoveryInfo::default()
            }),
            server_info: None,
            created_at: "2026-01-01 00:00:00".into(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_rehydrate_restores_rows() {
        let test = TestResult {
            test_file: "./tests/login.test.js".into(),
            test_name: "login".into(),
            file_content: "it('works')".into(),
            status: TestStatus::Fail,
            exit_code: Some(1),
            output: None,
            executed_at: "now".into(),
        };
        let state = RunState::rehydrate(&job(), vec![test], vec![]);
        assert_eq!(state.discovery_info.framework.as_deref(), Some("express"));
        assert_eq!(state.test_results.len(), 1);
        assert_eq!(state.file_content("tests/login.test.js"), Some("it('works')"));
        assert!(!state.env_merge);
    }

    #[test]
    fn test_file_paths_are_normalized() {
        let mut state = RunState::default();
        state.remember_file("./a.test.js", "v1");
        state.remember_file("a.test.js", "v2");
        assert_eq!(state.test_files.len(), 1);
        assert_eq!(state.file_content("/a.test.js"), Some("v2"));
    }

    #[test]
    fn test_snapshot_omits_file_bodies() {
        let mut state = RunState::default();
        state.remember_file("a.test.js", "SECRET BODY");
        let snap = state.snapshot();
        assert!(snap.contains("repo/a.test.js"));
        assert!(!snap.contains("SECRET BODY"));
    }
}
