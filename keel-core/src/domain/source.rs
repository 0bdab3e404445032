//! Source references

use serde::{Deserialize, Serialize};

/// Repository and branch an execution builds from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub repo_url: String,
    pub branch: String,
}

impl SourceRef {
    pub fn new(repo_url: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            branch: branch.into(),
        }
    }

    /// Application name derived from the repository URL.
    ///
    /// Takes the last path segment, strips a trailing `.git` and replaces
    /// anything outside `[A-Za-z0-9-_]` with `-`. Falls back to `app`.
    pub fn app_name(&self) -> String {
        let trimmed = self.repo_url.trim().trim_end_matches('/');
        let last = trimmed
            .rsplit(['/', ':'])
            .next()
            .unwrap_or_default();
        let last = last.strip_suffix(".git").unwrap_or(last);

        let name: String = last
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect();

        if name.is_empty() {
            "app".to_string()
        } else {
            name
        }
    }

    /// DNS-1123 label form of [`SourceRef::app_name`], usable for
    /// Kubernetes object and namespace names.
    pub fn dns_name(&self) -> String {
        let mut label = String::new();
        for c in self.app_name().chars() {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() {
                label.push(c);
            } else if !label.ends_with('-') {
                label.push('-');
            }
        }

        let mut label: String = label.trim_matches('-').chars().take(63).collect();
        while label.ends_with('-') {
            label.pop();
        }

        if label.is_empty() {
            "app".to_string()
        } else {
            label
        }
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.repo_url, self.branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_name_strips_git_suffix() {
        let source = SourceRef::new("https://github.com/acme/car-rental.git", "main");
        assert_eq!(source.app_name(), "car-rental");
    }

    #[test]
    fn app_name_handles_trailing_slash_and_ssh_urls() {
        assert_eq!(
            SourceRef::new("https://example.com/team/service/", "main").app_name(),
            "service"
        );
        assert_eq!(
            SourceRef::new("git@github.com:acme/api.git", "dev").app_name(),
            "api"
        );
    }

    #[test]
    fn app_name_falls_back_when_empty() {
        assert_eq!(SourceRef::new("", "main").app_name(), "app");
        assert_eq!(SourceRef::new("https://host/.git", "main").app_name(), "app");
    }

    #[test]
    fn dns_name_is_lowercase_label() {
        let source = SourceRef::new("https://github.com/acme/My_Service.v2.git", "main");
        assert_eq!(source.app_name(), "My_Service-v2");
        assert_eq!(source.dns_name(), "my-service-v2");
    }

    #[test]
    fn dns_name_is_bounded() {
        let long = format!("https://github.com/acme/{}.git", "x".repeat(100));
        let name = SourceRef::new(long, "main").dns_name();
        assert_eq!(name.len(), 63);
    }
}
