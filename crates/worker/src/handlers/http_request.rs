use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use serde::Deserialize;

use crate::handler::{AttemptContext, HandlerDescriptor, TaskHandler, TaskOutput};

#[derive(Debug, Deserialize)]
struct HttpRequestParams {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    headers: std::collections::HashMap<String, String>,
    #[serde(default = "default_expected_status")]
    expected_status: u16,
    #[serde(default = "default_timeout_seconds")]
    timeout_seconds: u64,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_expected_status() -> u16 {
    200
}

fn default_timeout_seconds() -> u64 {
    30
}

/// 调用外部 HTTP 接口并校验返回状态码
pub struct HttpRequestHandler;

#[async_trait]
impl TaskHandler for HttpRequestHandler {
    fn key(&self) -> &'static str {
        "http_request"
    }

    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor {
            version: 1,
            name_en: "HTTP request".to_string(),
            name_ar: "طلب HTTP".to_string(),
            description: Some("Calls an HTTP endpoint and checks the response status".to_string()),
        }
    }

    async fn run(&self, attempt: &AttemptContext<'_>) -> anyhow::Result<TaskOutput> {
        let params: HttpRequestParams = serde_json::from_value(attempt.parameters.clone())
            .context("解析HTTP任务参数失败")?;

        let client = attempt
            .scope
            .http_client("http-request", Duration::from_secs(params.timeout_seconds))?;

        let mut request = match params.method.to_uppercase().as_str() {
            "GET" => client.get(&params.url),
            "POST" => client.post(&params.url),
            "PUT" => client.put(&params.url),
            "DELETE" => client.delete(&params.url),
            "PATCH" => client.patch(&params.url),
            "HEAD" => client.head(&params.url),
            other => return Err(anyhow!("不支持的HTTP方法: {other}")),
        };
        for (key, value) in &params.headers {
            request = request.header(key, value);
        }
        if let Some(body) = params.body {
            request = request.body(body);
        }
        request = request.header("X-Correlation-Id", attempt.context.correlation_id());

        let response = request
            .send()
            .await
            .with_context(|| format!("请求失败: {}", params.url))?;
        let status = response.status().as_u16();
        if status != params.expected_status {
            bail!(
                "unexpected status {status} from {}, expected {}",
                params.url,
                params.expected_status
            );
        }

        Ok(TaskOutput::new(format!(
            "{} {} -> {status}",
            params.method.to_uppercase(),
            params.url
        )))
    }
}
