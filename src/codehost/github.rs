use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{CodeHost, CommitState, split_repo};
use crate::errors::CodeHostError;

const USER_AGENT: &str = "baton";
/// Error bodies are cut to this many characters in error messages.
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Deserialize)]
struct RepoInfo {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Debug, Deserialize)]
struct GitCommit {
    tree: GitObject,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    number: i64,
}

/// GitHub REST client authenticated with a token.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl GitHubClient {
    pub fn new(api_url: &str, token: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_url, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send(
        &self,
        action: &str,
        builder: RequestBuilder,
    ) -> Result<reqwest::Response, CodeHostError> {
        let resp = builder
            .send()
            .await
            .map_err(|source| CodeHostError::Transport {
                action: action.to_string(),
                source,
            })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(CodeHostError::Unauthorized {
                action: action.to_string(),
                status: status.as_u16(),
            });
        }
        let body = resp.text().await.unwrap_or_default();
        Err(CodeHostError::Api {
            action: action.to_string(),
            status: status.as_u16(),
            message: body.chars().take(MAX_ERROR_BODY).collect(),
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        action: &str,
        builder: RequestBuilder,
    ) -> Result<T, CodeHostError> {
        self.send(action, builder)
            .await?
            .json::<T>()
            .await
            .map_err(|source| CodeHostError::Transport {
                action: action.to_string(),
                source,
            })
    }

    async fn find_open_pull(&self, repo: &str, head: &str) -> Result<Option<i64>, CodeHostError> {
        let (owner, _) = split_repo(repo)?;
        let pulls: Vec<PullRequest> = self
            .send_json(
                "list pull requests",
                self.request(Method::GET, &format!("/repos/{}/pulls", repo))
                    .query(&[("head", format!("{}:{}", owner, head)), ("state", "open".into())]),
            )
            .await?;
        Ok(pulls.first().map(|p| p.number))
    }
}

#[async_trait]
impl CodeHost for GitHubClient {
    async fn default_branch(&self, repo: &str) -> Result<String, CodeHostError> {
        split_repo(repo)?;
        let info: RepoInfo = self
            .send_json(
                "read repository",
                self.request(Method::GET, &format!("/repos/{}", repo)),
            )
            .await?;
        Ok(info.default_branch)
    }

    async fn head_sha(&self, repo: &str, branch: &str) -> Result<String, CodeHostError> {
        split_repo(repo)?;
        let reference: GitRef = self
            .send_json(
                "read branch head",
                self.request(
                    Method::GET,
                    &format!("/repos/{}/git/ref/heads/{}", repo, branch),
                ),
            )
            .await?;
        Ok(reference.object.sha)
    }

    async fn create_branch(
        &self,
        repo: &str,
        branch: &str,
        from_sha: &str,
    ) -> Result<(), CodeHostError> {
        split_repo(repo)?;
        let result = self
            .send(
                "create branch",
                self.request(Method::POST, &format!("/repos/{}/git/refs", repo))
                    .json(&json!({ "ref": format!("refs/heads/{}", branch), "sha": from_sha })),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(CodeHostError::Api { status: 422, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn commit_file(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<String, CodeHostError> {
        let parent = self.head_sha(repo, branch).await?;
        let commit: GitCommit = self
            .send_json(
                "read commit",
                self.request(
                    Method::GET,
                    &format!("/repos/{}/git/commits/{}", repo, parent),
                ),
            )
            .await?;
        let tree: GitObject = self
            .send_json(
                "create tree",
                self.request(Method::POST, &format!("/repos/{}/git/trees", repo))
                    .json(&json!({
                        "base_tree": commit.tree.sha,
                        "tree": [{
                            "path": path,
                            "mode": "100644",
                            "type": "blob",
                            "content": content,
                        }],
                    })),
            )
            .await?;
        let created: GitObject = self
            .send_json(
                "create commit",
                self.request(Method::POST, &format!("/repos/{}/git/commits", repo))
                    .json(&json!({
                        "message": message,
                        "tree": tree.sha,
                        "parents": [parent],
                    })),
            )
            .await?;
        self.send(
            "update branch",
            self.request(
                Method::PATCH,
                &format!("/repos/{}/git/refs/heads/{}", repo, branch),
            )
            .json(&json!({ "sha": created.sha, "force": false })),
        )
        .await?;
        Ok(created.sha)
    }

    async fn open_pull_request(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<i64, CodeHostError> {
        split_repo(repo)?;
        let result: Result<PullRequest, _> = self
            .send_json(
                "open pull request",
                self.request(Method::POST, &format!("/repos/{}/pulls", repo))
                    .json(&json!({ "title": title, "head": head, "base": base, "body": body })),
            )
            .await;
        match result {
            Ok(pr) => Ok(pr.number),
            Err(CodeHostError::Api { status: 422, .. }) => {
                match self.find_open_pull(repo, head).await? {
                    Some(number) => Ok(number),
                    None => Err(CodeHostError::Api {
                        action: "open pull request".into(),
                        status: 422,
                        message: format!("no pull request could be opened for {}", head),
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn set_commit_status(
        &self,
        repo: &str,
        sha: &str,
        state: CommitState,
        context: &str,
        description: &str,
    ) -> Result<(), CodeHostError> {
        split_repo(repo)?;
        self.send(
            "set commit status",
            self.request(Method::POST, &format!("/repos/{}/statuses/{}", repo, sha))
                .json(&json!({
                    "state": state.as_str(),
                    "context": context,
                    "description": description.chars().take(140).collect::<String>(),
                })),
        )
        .await?;
        Ok(())
    }

    async fn comment(&self, repo: &str, pr_number: i64, body: &str) -> Result<(), CodeHostError> {
        split_repo(repo)?;
        self.send(
            "comment on pull request",
            self.request(
                Method::POST,
                &format!("/repos/{}/issues/{}/comments", repo, pr_number),
            )
            .json(&json!({ "body": body })),
        )
        .await?;
        Ok(())
    }
}
