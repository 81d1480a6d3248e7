use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use orchestrator_core::{JobHandler, JobMessage};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 参数为空时使用默认值
fn parse_params<T: DeserializeOwned + Default>(params: &Value, class: &str) -> anyhow::Result<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params.clone()).with_context(|| format!("解析{class} worker参数失败"))
}

/// 回显作业负载
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoParams {
    pub prefix: Option<String>,
}

pub struct EchoWorker {
    params: EchoParams,
}

impl EchoWorker {
    pub fn new(params: EchoParams) -> Self {
        Self { params }
    }

    pub fn build(params: &Value) -> anyhow::Result<Arc<dyn JobHandler>> {
        Ok(Arc::new(Self::new(parse_params(params, "echo")?)))
    }
}

#[async_trait]
impl JobHandler for EchoWorker {
    async fn run(&self, job: &JobMessage) -> anyhow::Result<Value> {
        debug!("echo: id={}, job_type={}", job.id, job.job_type);
        Ok(json!({
            "prefix": self.params.prefix,
            "job_id": job.id,
            "job_type": job.job_type,
            "payload": job.payload,
        }))
    }
}

/// Shell命令参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    pub timeout_seconds: Option<u64>,
}

/// 执行固定命令，负载中的 `args` 数组追加到命令参数之后
pub struct ShellWorker {
    params: ShellParams,
}

impl ShellWorker {
    pub fn new(params: ShellParams) -> Self {
        Self { params }
    }

    pub fn build(params: &Value) -> anyhow::Result<Arc<dyn JobHandler>> {
        let params: ShellParams =
            serde_json::from_value(params.clone()).context("解析shell worker参数失败")?;
        if params.command.trim().is_empty() {
            return Err(anyhow!("shell worker的command不能为空"));
        }
        Ok(Arc::new(Self::new(params)))
    }

    fn job_args(job: &JobMessage) -> Vec<String> {
        job.payload
            .get("args")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobHandler for ShellWorker {
    async fn run(&self, job: &JobMessage) -> anyhow::Result<Value> {
        let start_time = Instant::now();
        let mut args = self.params.args.clone();
        args.extend(Self::job_args(job));

        info!("执行Shell作业: id={}, command={}, args={:?}", job.id, self.params.command, args);

        let mut cmd = Command::new(&self.params.command);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.params.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.params.env_vars {
            cmd.env(key, value);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("启动Shell命令失败: {}", self.params.command))?;
        let output = match self.params.timeout_seconds {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), child.wait_with_output())
                .await
                .map_err(|_| anyhow!("Shell命令执行超时 ({secs}s)"))?,
            None => child.wait_with_output().await,
        }
        .context("等待进程结束失败")?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let exit_code = output.status.code();

        info!(
            "Shell作业完成: id={}, exit_code={:?}, duration={}ms",
            job.id,
            exit_code,
            start_time.elapsed().as_millis()
        );

        if !output.status.success() {
            return Err(anyhow!("命令执行失败，退出码: {exit_code:?}, stderr: {stderr}"));
        }
        Ok(json!({
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

/// HTTP调用参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpParams {
    pub url: String,
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub timeout_seconds: Option<u64>,
}

/// 将作业负载作为JSON请求体转发到固定地址
pub struct HttpWorker {
    client: reqwest::Client,
    params: HttpParams,
}

impl HttpWorker {
    pub fn new(params: HttpParams) -> Self {
        Self {
            client: reqwest::Client::new(),
            params,
        }
    }

    pub fn build(params: &Value) -> anyhow::Result<Arc<dyn JobHandler>> {
        let params: HttpParams =
            serde_json::from_value(params.clone()).context("解析http worker参数失败")?;
        reqwest::Url::parse(&params.url).with_context(|| format!("无效的URL: {}", params.url))?;
        Ok(Arc::new(Self::new(params)))
    }
}

#[async_trait]
impl JobHandler for HttpWorker {
    async fn run(&self, job: &JobMessage) -> anyhow::Result<Value> {
        let method = self
            .params
            .method
            .clone()
            .unwrap_or_else(|| "POST".to_string())
            .to_uppercase();
        let url = &self.params.url;

        let mut request_builder = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url).json(job),
            "PUT" => self.client.put(url).json(job),
            "PATCH" => self.client.patch(url).json(job),
            "DELETE" => self.client.delete(url),
            _ => return Err(anyhow!("不支持的HTTP方法: {method}")),
        };
        request_builder =
            request_builder.timeout(Duration::from_secs(self.params.timeout_seconds.unwrap_or(30)));
        for (key, value) in &self.params.headers {
            request_builder = request_builder.header(key, value);
        }

        info!("执行HTTP作业: id={}, method={}, url={}", job.id, method, url);
        let response = request_builder
            .send()
            .await
            .with_context(|| format!("HTTP请求失败: {url}"))?;
        let status_code = response.status().as_u16();
        let success = response.status().is_success();
        let body = response.text().await.context("读取响应体失败")?;

        if !success {
            warn!("HTTP作业返回错误状态: id={}, status={}", job.id, status_code);
            return Err(anyhow!("HTTP请求返回状态码 {status_code}: {body}"));
        }
        Ok(json!({
            "status_code": status_code,
            "body": body,
        }))
    }
}

/// 故障注入参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailingParams {
    pub message: String,
    /// 仅前N次尝试失败；为空时始终失败
    pub fail_times: Option<u32>,
}

impl Default for FailingParams {
    fn default() -> Self {
        Self {
            message: "injected failure".to_string(),
            fail_times: None,
        }
    }
}

/// 按重试次数决定是否失败，用于验证重试与死信流程
pub struct FailingWorker {
    params: FailingParams,
}

impl FailingWorker {
    pub fn new(params: FailingParams) -> Self {
        Self { params }
    }

    pub fn build(params: &Value) -> anyhow::Result<Arc<dyn JobHandler>> {
        Ok(Arc::new(Self::new(parse_params(params, "failing")?)))
    }
}

#[async_trait]
impl JobHandler for FailingWorker {
    async fn run(&self, job: &JobMessage) -> anyhow::Result<Value> {
        let should_fail = match self.params.fail_times {
            Some(times) => job.retry_count < times,
            None => true,
        };
        if should_fail {
            return Err(anyhow!("{}", self.params.message));
        }
        Ok(json!({ "attempt": job.retry_count.saturating_add(1) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_returns_payload() {
        let worker = EchoWorker::build(&json!({"prefix": "p"})).unwrap();
        let job = JobMessage::new("echo", json!({"text": "hi"}), 0);
        let result = worker.run(&job).await.unwrap();
        assert_eq!(result["payload"]["text"], "hi");
        assert_eq!(result["prefix"], "p");
    }

    #[tokio::test]
    async fn test_failing_worker_recovers_after_fail_times() {
        let worker = FailingWorker::build(&json!({"message": "boom", "fail_times": 1})).unwrap();
        let mut job = JobMessage::new("flaky", json!({}), 3);
        let err = worker.run(&job).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");

        job.increment_retry();
        assert!(worker.run(&job).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_worker_appends_job_args() {
        let worker = ShellWorker::build(&json!({"command": "echo", "args": ["hello"]})).unwrap();
        let job = JobMessage::new("shell", json!({"args": ["world"]}), 0);
        let result = worker.run(&job).await.unwrap();
        assert_eq!(result["stdout"], "hello world");
        assert_eq!(result["exit_code"], 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_worker_nonzero_exit_is_error() {
        let worker = ShellWorker::build(&json!({"command": "false"})).unwrap();
        let job = JobMessage::new("shell", json!({}), 0);
        assert!(worker.run(&job).await.is_err());
    }

    #[test]
    fn test_http_worker_requires_valid_url() {
        assert!(HttpWorker::build(&json!({"url": "not a url"})).is_err());
        assert!(HttpWorker::build(&json!({"url": "http://127.0.0.1:9/hook"})).is_ok());
    }
}
