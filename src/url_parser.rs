//! Canonicalizes HTTPS Git URLs into `{provider, instance, namespace,
//! project_name, ...}`. Bespoke per-host segment rules (GitLab's nested
//! groups vs. GitHub's fixed two-segment layout), so this is hand-rolled
//! path logic on top of `url::Url`, not general URL semantics.

use url::Url;

use crate::error::{Error, Result};
use crate::types::Provider;

/// A canonicalized repository URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoUrl {
    pub provider: Provider,
    pub instance: String,
    /// May be multi-level for nested GitLab groups (e.g. `chat-labs/OpenSource`).
    pub namespace: String,
    pub project_name: String,
    pub full_name: String,
    pub clone_url: String,
    pub html_url: String,
    pub api_base_url: String,
    pub is_enterprise: bool,
}

/// Parses an arbitrary HTTPS Git URL into its canonical components.
pub fn parse_repository_url(input: &str) -> Result<RepoUrl> {
    let url = Url::parse(input)
        .map_err(|e| Error::Validation(format!("invalid repository URL {input:?}: {e}")))?;

    if url.scheme() != "https" {
        return Err(Error::Validation(format!(
            "only https:// repository URLs are accepted, got scheme {:?}",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| Error::Validation(format!("repository URL {input:?} has no host")))?
        .to_string();

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    if segments.is_empty() {
        return Err(Error::Validation(format!(
            "repository URL {input:?} has no path"
        )));
    }

    let provider = infer_provider(&host);

    let (namespace, project_name) = match provider {
        Provider::Github => {
            if segments.len() != 2 {
                return Err(Error::Validation(format!(
                    "GitHub repository URL {input:?} must have exactly owner/repo, got {} segments",
                    segments.len()
                )));
            }
            (segments[0].to_string(), strip_git_suffix(segments[1]))
        }
        Provider::Gitlab => {
            if segments.len() < 2 {
                return Err(Error::Validation(format!(
                    "GitLab repository URL {input:?} must have at least namespace/project"
                )));
            }
            let (ns, last) = segments.split_at(segments.len() - 1);
            (ns.join("/"), strip_git_suffix(last[0]))
        }
    };

    let full_name = format!("{namespace}/{project_name}");
    let is_enterprise = match provider {
        Provider::Github => host != "github.com",
        Provider::Gitlab => host != "gitlab.com",
    };

    Ok(build_repo_urls(&host, provider, &namespace, &project_name, &full_name, is_enterprise))
}

/// Reconstructs a [`RepoUrl`] from `{instance, full_name, provider}`, used to
/// prove the URL-parsing round-trip law: this must reproduce `clone_url`,
/// `html_url`, `api_base_url`, and `is_enterprise` identical to
/// [`parse_repository_url`] for the same logical repository.
pub fn build_repo_urls_from_parts(instance: &str, full_name: &str, provider: Provider) -> Result<RepoUrl> {
    let (namespace, project_name) = full_name
        .rsplit_once('/')
        .ok_or_else(|| Error::Validation(format!("full_name {full_name:?} must contain '/'")))?;
    let is_enterprise = match provider {
        Provider::Github => instance != "github.com",
        Provider::Gitlab => instance != "gitlab.com",
    };
    Ok(build_repo_urls(
        instance,
        provider,
        namespace,
        project_name,
        full_name,
        is_enterprise,
    ))
}

fn build_repo_urls(
    instance: &str,
    provider: Provider,
    namespace: &str,
    project_name: &str,
    full_name: &str,
    is_enterprise: bool,
) -> RepoUrl {
    let clone_url = format!("https://{instance}/{full_name}.git");
    let html_url = format!("https://{instance}/{full_name}");
    let api_base_url = match provider {
        Provider::Github if !is_enterprise => "https://api.github.com".to_string(),
        Provider::Github => format!("https://{instance}/api/v3"),
        Provider::Gitlab => format!("https://{instance}/api/v4"),
    };

    RepoUrl {
        provider,
        instance: instance.to_string(),
        namespace: namespace.to_string(),
        project_name: project_name.to_string(),
        full_name: full_name.to_string(),
        clone_url,
        html_url,
        api_base_url,
        is_enterprise,
    }
}

/// Unknown hosts default to `gitlab`; `github.com` maps to `github`,
/// `gitlab.com` (and anything else) to `gitlab`.
fn infer_provider(host: &str) -> Provider {
    if host == "github.com" {
        Provider::Github
    } else {
        Provider::Gitlab
    }
}

fn strip_git_suffix(segment: &str) -> String {
    segment.strip_suffix(".git").unwrap_or(segment).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_https_schemes() {
        for input in [
            "ssh://git@github.com/example/repo.git",
            "http://github.com/example/repo",
            "git@github.com:example/repo.git",
        ] {
            let err = parse_repository_url(input);
            assert!(err.is_err(), "expected rejection for {input}");
        }
    }

    #[test]
    fn parses_github_url() {
        let parsed = parse_repository_url("https://github.com/example/repo").unwrap();
        assert_eq!(parsed.provider, Provider::Github);
        assert_eq!(parsed.instance, "github.com");
        assert_eq!(parsed.namespace, "example");
        assert_eq!(parsed.project_name, "repo");
        assert_eq!(parsed.full_name, "example/repo");
        assert!(!parsed.is_enterprise);
        assert_eq!(parsed.api_base_url, "https://api.github.com");
        assert_eq!(parsed.clone_url, "https://github.com/example/repo.git");
    }

    #[test]
    fn strips_dot_git_suffix() {
        let parsed = parse_repository_url("https://github.com/example/repo.git").unwrap();
        assert_eq!(parsed.project_name, "repo");
    }

    #[test]
    fn rejects_github_url_with_extra_segments() {
        let err = parse_repository_url("https://github.com/example/repo/extra").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn parses_nested_gitlab_enterprise_url() {
        let parsed =
            parse_repository_url("https://gitlab-master.nvidia.com/chat-labs/OpenSource/rag")
                .unwrap();
        assert_eq!(parsed.provider, Provider::Gitlab);
        assert_eq!(parsed.instance, "gitlab-master.nvidia.com");
        assert_eq!(parsed.namespace, "chat-labs/OpenSource");
        assert_eq!(parsed.project_name, "rag");
        assert!(parsed.is_enterprise);
        assert_eq!(
            parsed.api_base_url,
            "https://gitlab-master.nvidia.com/api/v4"
        );
    }

    #[test]
    fn round_trips_through_build_repo_urls() {
        for input in [
            "https://github.com/example/repo",
            "https://gitlab.com/group/subgroup/project",
            "https://gitlab-master.nvidia.com/chat-labs/OpenSource/rag",
        ] {
            let parsed = parse_repository_url(input).unwrap();
            let rebuilt =
                build_repo_urls_from_parts(&parsed.instance, &parsed.full_name, parsed.provider)
                    .unwrap();
            assert_eq!(parsed.clone_url, rebuilt.clone_url);
            assert_eq!(parsed.html_url, rebuilt.html_url);
            assert_eq!(parsed.api_base_url, rebuilt.api_base_url);
            assert_eq!(parsed.is_enterprise, rebuilt.is_enterprise);
        }
    }
}
