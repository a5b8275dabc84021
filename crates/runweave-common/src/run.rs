use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Kind of background workflow a run executes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    ResolveIssue,
    CreatePullRequest,
    ReviewPullRequest,
    ApplyReview,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResolveIssue => "resolve_issue",
            Self::CreatePullRequest => "create_pull_request",
            Self::ReviewPullRequest => "review_pull_request",
            Self::ApplyReview => "apply_review",
        }
    }
}

impl FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resolve_issue" => Ok(Self::ResolveIssue),
            "create_pull_request" => Ok(Self::CreatePullRequest),
            "review_pull_request" => Ok(Self::ReviewPullRequest),
            "apply_review" => Ok(Self::ApplyReview),
            _ => Err(format!("Invalid workflow type: {}", s)),
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A GitHub issue a run was launched for (`BASED_ON_ISSUE`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueRef {
    /// `owner/name` slug of the repository.
    pub repo: String,
    pub number: i64,
}

impl IssueRef {
    pub fn new(repo: impl Into<String>, number: i64) -> Self {
        Self {
            repo: repo.into(),
            number,
        }
    }
}

impl fmt::Display for IssueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

/// Parses `owner/name#123`.
impl FromStr for IssueRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (repo, number) = s
            .rsplit_once('#')
            .ok_or_else(|| format!("Invalid issue reference '{}': expected owner/repo#N", s))?;
        let parts: Vec<&str> = repo.split('/').collect();
        if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
            return Err(format!("Invalid repository slug '{}'", repo));
        }
        let number = number
            .parse::<i64>()
            .map_err(|_| format!("Invalid issue number '{}'", number))?;
        if number <= 0 {
            return Err(format!("Invalid issue number '{}'", number));
        }
        Ok(Self::new(repo, number))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_to_github: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<IssueRef>,
}

/// State a producer declares through a `workflow_state` event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Running,
    Completed,
    Error,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid workflow state: {}", s)),
        }
    }
}

/// State reported to readers. `TimedOut` is never written; it is derived.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    Running,
    Completed,
    Error,
    TimedOut,
}

impl RunState {
    /// Effective state from the latest declared state.
    ///
    /// A run without any state event counts as running. A running run older
    /// than `timeout` is reported as timed out.
    pub fn derive(
        latest: Option<WorkflowState>,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        match latest.unwrap_or(WorkflowState::Running) {
            WorkflowState::Completed => Self::Completed,
            WorkflowState::Error => Self::Error,
            WorkflowState::Running if now - created_at > timeout => Self::TimedOut,
            WorkflowState::Running => Self::Running,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::TimedOut => "timedOut",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_type_round_trips_through_str() {
        for t in [
            WorkflowType::ResolveIssue,
            WorkflowType::CreatePullRequest,
            WorkflowType::ReviewPullRequest,
            WorkflowType::ApplyReview,
        ] {
            assert_eq!(t.as_str().parse::<WorkflowType>().unwrap(), t);
        }
        assert!("deploy".parse::<WorkflowType>().is_err());
    }

    #[test]
    fn issue_ref_parses_owner_repo_number() {
        let issue: IssueRef = "acme/widgets#42".parse().unwrap();
        assert_eq!(issue.repo, "acme/widgets");
        assert_eq!(issue.number, 42);
        assert_eq!(issue.to_string(), "acme/widgets#42");
    }

    #[test]
    fn issue_ref_rejects_malformed_input() {
        assert!("acme/widgets".parse::<IssueRef>().is_err());
        assert!("widgets#3".parse::<IssueRef>().is_err());
        assert!("acme/widgets#zero".parse::<IssueRef>().is_err());
        assert!("acme/widgets#0".parse::<IssueRef>().is_err());
        assert!("a/b/c#1".parse::<IssueRef>().is_err());
    }

    #[test]
    fn running_run_past_timeout_is_timed_out() {
        let now = Utc::now();
        let state = RunState::derive(
            Some(WorkflowState::Running),
            now - Duration::hours(2),
            now,
            Duration::hours(1),
        );
        assert_eq!(state, RunState::TimedOut);
        assert_eq!(state.as_str(), "timedOut");
    }

    #[test]
    fn terminal_states_ignore_timeout() {
        let now = Utc::now();
        let old = now - Duration::hours(5);
        assert_eq!(
            RunState::derive(Some(WorkflowState::Completed), old, now, Duration::hours(1)),
            RunState::Completed
        );
        assert_eq!(
            RunState::derive(Some(WorkflowState::Error), old, now, Duration::hours(1)),
            RunState::Error
        );
    }

    #[test]
    fn run_without_state_events_counts_as_running() {
        let now = Utc::now();
        let state = RunState::derive(None, now - Duration::minutes(5), now, Duration::hours(1));
        assert_eq!(state, RunState::Running);
        assert!(!state.is_terminal());
    }

    #[test]
    fn run_state_serializes_camel_case() {
        let json = serde_json::to_string(&RunState::TimedOut).unwrap();
        assert_eq!(json, "\"timedOut\"");
    }
}
