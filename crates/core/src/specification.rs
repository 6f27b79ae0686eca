//! Include/exclude rule sets used to discover backup entities.
//!
//! One rule per line:
//!
//! ```text
//! # comment
//! + /home/user/documents **/*.txt
//! - /home/user/documents drafts/**
//! ```
//!
//! The glob is matched against paths relative to the rule's directory. Later
//! rules override earlier ones for the same entity.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use walkdir::WalkDir;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOperation {
    Include,
    Exclude,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub line: usize,
    pub operation: RuleOperation,
    pub directory: PathBuf,
    pub pattern: String,
    matcher: GlobMatcher,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.operation {
            RuleOperation::Include => '+',
            RuleOperation::Exclude => '-',
        };
        write!(f, "{op} {} {}", self.directory.display(), self.pattern)
    }
}

impl Rule {
    pub fn parse(line: usize, text: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidConfig {
            message: format!("invalid rule on line {line} ({reason}): {text:?}"),
        };

        let text = text.trim();
        let (op, rest) = text.split_at_checked(1).ok_or_else(|| invalid("empty"))?;
        let operation = match op {
            "+" => RuleOperation::Include,
            "-" => RuleOperation::Exclude,
            _ => return Err(invalid("expected '+' or '-'")),
        };

        let (directory, pattern) = rest
            .trim()
            .rsplit_once(char::is_whitespace)
            .ok_or_else(|| invalid("expected '<directory> <pattern>'"))?;
        let directory = PathBuf::from(directory.trim());
        if !directory.is_absolute() {
            return Err(invalid("directory must be absolute"));
        }

        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| invalid(&e.to_string()))?
            .compile_matcher();

        Ok(Self {
            line,
            operation,
            directory,
            pattern: pattern.to_string(),
            matcher,
        })
    }

    fn matches(&self, path: &Path) -> bool {
        path.strip_prefix(&self.directory)
            .map(|relative| !relative.as_os_str().is_empty() && self.matcher.is_match(relative))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmatchedRule {
    pub rule: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredEntities {
    pub entities: BTreeSet<PathBuf>,
    pub unmatched: Vec<UnmatchedRule>,
}

#[derive(Debug, Clone, Default)]
pub struct Specification {
    pub rules: Vec<Rule>,
}

impl Specification {
    pub fn parse(text: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            rules.push(Rule::parse(idx + 1, trimmed)?);
        }
        Ok(Self { rules })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Walks every rule's directory and applies the rules in order.
    pub fn discover(&self) -> Result<DiscoveredEntities> {
        let mut result = DiscoveredEntities::default();

        for rule in &self.rules {
            if !rule.directory.is_dir() {
                result.unmatched.push(UnmatchedRule {
                    rule: rule.to_string(),
                    reason: "directory not found".to_string(),
                });
                continue;
            }

            let mut matched = 0usize;
            for entry in WalkDir::new(&rule.directory).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!(
                            event = "specification.walk_failed",
                            rule = %rule,
                            error = %e,
                            "specification.walk_failed"
                        );
                        continue;
                    }
                };
                let path = entry.path();
                if !rule.matches(path) {
                    continue;
                }
                matched += 1;

                match rule.operation {
                    RuleOperation::Include => {
                        result.entities.insert(path.to_path_buf());
                        for parent in path.ancestors().skip(1) {
                            if !parent.starts_with(&rule.directory) {
                                break;
                            }
                            result.entities.insert(parent.to_path_buf());
                        }
                    }
                    RuleOperation::Exclude => {
                        result.entities.remove(path);
                    }
                }
            }

            if matched == 0 {
                result.unmatched.push(UnmatchedRule {
                    rule: rule.to_string(),
                    reason: "no matching entities".to_string(),
                });
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rules_and_skips_comments() {
        let spec = Specification::parse(
            "# backup docs\n\n+ /home/my docs **/*.txt\n- /home/my docs tmp/**\n",
        )
        .unwrap();
        assert_eq!(spec.rules.len(), 2);
        assert_eq!(spec.rules[0].directory, PathBuf::from("/home/my docs"));
        assert_eq!(spec.rules[0].operation, RuleOperation::Include);
        assert_eq!(spec.rules[1].to_string(), "- /home/my docs tmp/**");
    }

    #[test]
    fn rejects_invalid_rules() {
        assert!(Specification::parse("* /a b").is_err());
        assert!(Specification::parse("+ relative *.txt").is_err());
        assert!(Specification::parse("+ /only-dir").is_err());
    }

    #[test]
    fn discovers_with_later_rules_overriding() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("a/tmp")).unwrap();
        std::fs::write(root.join("a/one.txt"), b"1").unwrap();
        std::fs::write(root.join("a/tmp/two.txt"), b"2").unwrap();
        std::fs::write(root.join("a/three.bin"), b"3").unwrap();

        let text = format!(
            "+ {root} **/*.txt\n- {root} a/tmp/**\n+ {root} missing-*.log\n+ /definitely/not/here *\n",
            root = root.display()
        );
        let discovered = Specification::parse(&text).unwrap().discover().unwrap();

        assert!(discovered.entities.contains(&root.join("a/one.txt")));
        assert!(discovered.entities.contains(&root.join("a")));
        assert!(discovered.entities.contains(root));
        assert!(!discovered.entities.contains(&root.join("a/tmp/two.txt")));
        assert!(!discovered.entities.contains(&root.join("a/three.bin")));

        let reasons: Vec<&str> = discovered
            .unmatched
            .iter()
            .map(|u| u.reason.as_str())
            .collect();
        assert_eq!(reasons, vec!["no matching entities", "directory not found"]);
    }
}
