//! Security analysis: assigns a [`SecurityRisk`] to each action before it is
//! emitted, so confirmation mode can gate the risky ones.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use skiff_protocol::{Action, SecurityRisk, SessionId};
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait SecurityAnalyzer: Send + Sync {
    async fn analyze(&self, session_id: &SessionId, action: &Action) -> SecurityRisk;
}

/// Pattern rules. Command patterns match anywhere in a normalized command,
/// with `*` standing for any run of characters. Path patterns ending in `*`
/// match by prefix; other path patterns match the whole path or its tail
/// after a `/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskPolicy {
    pub command_rules: IndexMap<String, SecurityRisk>,
    pub path_rules: IndexMap<String, SecurityRisk>,
    /// Python calls that reach the shell or delete files.
    pub code_rules: IndexMap<String, SecurityRisk>,
    pub browse_risk: SecurityRisk,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        let command_rules = [
            ("rm -rf /", SecurityRisk::High),
            ("rm -rf ~", SecurityRisk::High),
            ("rm -rf *", SecurityRisk::Medium),
            ("mkfs", SecurityRisk::High),
            ("dd if=* of=/dev/", SecurityRisk::High),
            ("> /dev/sd", SecurityRisk::High),
            (":(){", SecurityRisk::High),
            ("curl *| sh", SecurityRisk::High),
            ("curl *| bash", SecurityRisk::High),
            ("wget *| sh", SecurityRisk::High),
            ("wget *| bash", SecurityRisk::High),
            ("chmod -r 777 /", SecurityRisk::High),
            ("sudo ", SecurityRisk::Medium),
            ("chmod 777", SecurityRisk::Medium),
            ("git push --force", SecurityRisk::Medium),
            ("git push -f", SecurityRisk::Medium),
            ("kill -9", SecurityRisk::Medium),
            ("npm install -g", SecurityRisk::Medium),
        ];
        let path_rules = [
            ("/etc/*", SecurityRisk::High),
            ("/usr/*", SecurityRisk::High),
            (".ssh/*", SecurityRisk::High),
            (".git/*", SecurityRisk::Medium),
            (".env", SecurityRisk::Medium),
        ];
        let code_rules = [
            ("shutil.rmtree(", SecurityRisk::Medium),
            ("os.system(", SecurityRisk::Medium),
            ("subprocess.", SecurityRisk::Medium),
            ("os.remove(", SecurityRisk::Medium),
        ];
        Self {
            command_rules: to_map(&command_rules),
            path_rules: to_map(&path_rules),
            code_rules: to_map(&code_rules),
            browse_risk: SecurityRisk::Low,
        }
    }
}

fn to_map(rules: &[(&str, SecurityRisk)]) -> IndexMap<String, SecurityRisk> {
    rules
        .iter()
        .map(|(pattern, risk)| ((*pattern).to_owned(), *risk))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct PatternSecurityAnalyzer {
    policy: RiskPolicy,
}

impl PatternSecurityAnalyzer {
    pub fn from_policy(policy: &RiskPolicy) -> Self {
        Self {
            policy: policy.clone(),
        }
    }

    /// Risk of a shell script; unmatched scripts are low risk.
    pub fn command_risk(&self, command: &str) -> SecurityRisk {
        let normalized = normalize_command(command);
        self.policy
            .command_rules
            .iter()
            .filter(|(pattern, _)| wildcard_contains(pattern, &normalized))
            .map(|(_, risk)| *risk)
            .max()
            .unwrap_or(SecurityRisk::Low)
    }

    pub fn path_risk(&self, path: &str) -> SecurityRisk {
        self.policy
            .path_rules
            .iter()
            .filter(|(pattern, _)| path_matches(pattern, path))
            .map(|(_, risk)| *risk)
            .max()
            .unwrap_or(SecurityRisk::Low)
    }

    /// Shell escapes in the cell are rated like commands; the rest of the
    /// cell is checked against the code rules.
    pub fn code_risk(&self, code: &str) -> SecurityRisk {
        let shell = code
            .lines()
            .filter_map(|line| line.trim_start().strip_prefix('!'))
            .map(|command| self.command_risk(command))
            .max()
            .unwrap_or(SecurityRisk::Low);
        let calls = self
            .policy
            .code_rules
            .iter()
            .filter(|(pattern, _)| code.contains(pattern.as_str()))
            .map(|(_, risk)| *risk)
            .max()
            .unwrap_or(SecurityRisk::Low);
        shell.max(calls)
    }

    pub fn assess(&self, action: &Action) -> SecurityRisk {
        match action {
            Action::CmdRun(a) => self.command_risk(&a.command),
            Action::CmdKill(_) => SecurityRisk::Low,
            Action::IPythonRunCell(a) => self.code_risk(&a.code),
            Action::FileRead(_) => SecurityRisk::Low,
            Action::FileWrite(a) => self.path_risk(&a.path),
            Action::BrowseUrl(_) | Action::BrowseInteractive(_) => self.policy.browse_risk,
            _ => SecurityRisk::Unknown,
        }
    }
}

#[async_trait]
impl SecurityAnalyzer for PatternSecurityAnalyzer {
    async fn analyze(&self, session_id: &SessionId, action: &Action) -> SecurityRisk {
        let risk = self.assess(action);
        debug!(session_id = %session_id, action = action.tag(), ?risk, "action assessed");
        risk
    }
}

/// Per-session policy overrides on top of a default policy.
#[derive(Debug, Clone)]
pub struct SessionSecurityAnalyzer {
    default: PatternSecurityAnalyzer,
    overrides: Arc<RwLock<HashMap<SessionId, PatternSecurityAnalyzer>>>,
}

impl SessionSecurityAnalyzer {
    pub fn new(default_policy: RiskPolicy) -> Self {
        Self {
            default: PatternSecurityAnalyzer::from_policy(&default_policy),
            overrides: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn set_policy(&self, session_id: &SessionId, policy: &RiskPolicy) {
        self.overrides.write().await.insert(
            session_id.clone(),
            PatternSecurityAnalyzer::from_policy(policy),
        );
    }

    pub async fn clear_policy(&self, session_id: &SessionId) {
        self.overrides.write().await.remove(session_id);
    }
}

#[async_trait]
impl SecurityAnalyzer for SessionSecurityAnalyzer {
    async fn analyze(&self, session_id: &SessionId, action: &Action) -> SecurityRisk {
        let analyzer = self.overrides.read().await.get(session_id).cloned();
        match analyzer {
            Some(analyzer) => analyzer.analyze(session_id, action).await,
            None => self.default.analyze(session_id, action).await,
        }
    }
}

fn normalize_command(command: &str) -> String {
    command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// True when the `*`-separated parts of `pattern` occur in `text` in order.
fn wildcard_contains(pattern: &str, text: &str) -> bool {
    let mut rest = text;
    for part in pattern.split('*').filter(|part| !part.is_empty()) {
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }
    true
}

fn path_matches(pattern: &str, path: &str) -> bool {
    let mut candidates = std::iter::once(path).chain(
        path.match_indices('/')
            .map(|(index, _)| &path[index + 1..]),
    );
    if let Some(prefix) = pattern.strip_suffix('*') {
        candidates.any(|candidate| prefix.is_empty() || candidate.starts_with(prefix))
    } else {
        candidates.any(|candidate| candidate == pattern)
    }
}
