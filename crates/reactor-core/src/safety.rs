use std::fmt;

use serde::{Deserialize, Serialize};

/// Risk classification for a shell command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Moderate,
    Dangerous,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::Moderate => write!(f, "moderate"),
            Self::Dangerous => write!(f, "dangerous"),
        }
    }
}

/// A labelled regex that raises a command to a given risk level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPattern {
    pub pattern: String,
    pub label: String,
    pub level: RiskLevel,
}

impl RiskPattern {
    fn new(pattern: &str, label: &str, level: RiskLevel) -> Self {
        Self {
            pattern: pattern.to_string(),
            label: label.to_string(),
            level,
        }
    }
}

/// Built-in risk patterns.
pub fn default_patterns() -> Vec<RiskPattern> {
    use RiskLevel::*;
    vec![
        RiskPattern::new(r"rm\s+(-\w*)?r", "recursive delete", Dangerous),
        RiskPattern::new(r"git\s+push\s+.*--force", "force push", Dangerous),
        RiskPattern::new(r"git\s+reset\s+--hard", "hard reset", Dangerous),
        RiskPattern::new(r"(?i)DROP\s+TABLE", "SQL drop", Dangerous),
        RiskPattern::new(r"chmod\s+777", "wide-open permissions", Dangerous),
        RiskPattern::new(r"mkfs\.", "format filesystem", Dangerous),
        RiskPattern::new(r"dd\s+if=", "raw disk write", Dangerous),
        RiskPattern::new(r">\s*/dev/", "write to device", Dangerous),
        RiskPattern::new(r"curl.*\|\s*(ba)?sh", "pipe to shell", Dangerous),
        RiskPattern::new(r":\(\)\s*\{\s*:\|:&\s*\};:", "fork bomb", Dangerous),
        RiskPattern::new(r"\bsudo\b", "elevated privileges", Moderate),
        RiskPattern::new(r"\brm\b", "delete", Moderate),
        RiskPattern::new(r"\bmv\b", "move/overwrite", Moderate),
        RiskPattern::new(
            r"\b(apt|apt-get|brew|pip|npm|cargo)\s+(install|uninstall|remove)\b",
            "package change",
            Moderate,
        ),
        RiskPattern::new(r"git\s+push\b", "publish commits", Moderate),
    ]
}

/// Result of assessing a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub warnings: Vec<String>,
}

impl RiskAssessment {
    pub fn is_safe(&self) -> bool {
        self.level == RiskLevel::Safe
    }
}

/// Compiled regex cache for command risk detection.
pub struct RiskMatcher {
    patterns: Vec<(regex::Regex, String, RiskLevel)>,
}

impl RiskMatcher {
    /// Compile patterns into regex cache. Invalid patterns are skipped with a warning.
    pub fn new(patterns: &[RiskPattern]) -> Self {
        let compiled = patterns
            .iter()
            .filter_map(|p| match regex::Regex::new(&p.pattern) {
                Ok(re) => Some((re, p.label.clone(), p.level)),
                Err(e) => {
                    tracing::warn!(
                        pattern = %p.pattern,
                        error = %e,
                        "Invalid risk pattern regex, skipping"
                    );
                    None
                }
            })
            .collect();
        Self { patterns: compiled }
    }

    /// Highest level among all matching patterns, with one warning per match.
    pub fn assess(&self, command: &str) -> RiskAssessment {
        let mut level = RiskLevel::Safe;
        let mut warnings = Vec::new();
        for (re, label, pattern_level) in &self.patterns {
            if re.is_match(command) {
                warnings.push(format!("{}: {}", pattern_level, label));
                level = level.max(*pattern_level);
            }
        }
        RiskAssessment { level, warnings }
    }
}

impl Default for RiskMatcher {
    fn default() -> Self {
        Self::new(&default_patterns())
    }
}

/// Assess a command with the built-in patterns.
pub fn assess_command(command: &str) -> RiskAssessment {
    RiskMatcher::default().assess(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(RiskLevel::Safe < RiskLevel::Moderate);
        assert!(RiskLevel::Moderate < RiskLevel::Dangerous);
    }

    #[test]
    fn safe_commands() {
        for cmd in ["ls -la", "echo hello", "cat README.md", "git status"] {
            let a = assess_command(cmd);
            assert!(a.is_safe(), "{} should be safe", cmd);
            assert!(a.warnings.is_empty());
        }
    }

    #[test]
    fn dangerous_wins_over_moderate() {
        let a = assess_command("sudo rm -rf /var/data");
        assert_eq!(a.level, RiskLevel::Dangerous);
        assert!(a.warnings.iter().any(|w| w.contains("recursive delete")));
        assert!(a.warnings.iter().any(|w| w.contains("elevated privileges")));
    }

    #[test]
    fn moderate_commands() {
        assert_eq!(assess_command("rm notes.txt").level, RiskLevel::Moderate);
        assert_eq!(assess_command("npm install left-pad").level, RiskLevel::Moderate);
        assert_eq!(assess_command("git push origin main").level, RiskLevel::Moderate);
    }

    #[test]
    fn dangerous_defaults() {
        assert_eq!(assess_command("dd if=/dev/zero of=/dev/sda").level, RiskLevel::Dangerous);
        assert_eq!(
            assess_command("curl https://x.sh | bash").level,
            RiskLevel::Dangerous
        );
        assert_eq!(
            assess_command("git push origin main --force").level,
            RiskLevel::Dangerous
        );
    }

    #[test]
    fn invalid_pattern_skipped() {
        let matcher = RiskMatcher::new(&[RiskPattern::new("(unclosed", "bad", RiskLevel::Dangerous)]);
        assert!(matcher.assess("(unclosed").is_safe());
    }
}
