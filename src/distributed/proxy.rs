//! Redis-over-HTTP transport
//!
//! For runtimes that cannot open raw TCP sockets. Each command is POSTed as
//! a JSON array (`["SET", "key", "value", "EX", "300"]`) to the proxy URL;
//! batches go to `<url>/pipeline` as an array of commands. Responses are
//! `{"result": ...}` or `{"error": "..."}`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::Transport;
use crate::CacheError;
use crate::store::CacheProvider;

const SCAN_COUNT: u32 = 200;

#[derive(Debug, Deserialize)]
struct ProxyReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl ProxyReply {
    fn into_result(self) -> Result<Value, CacheError> {
        match self.error {
            Some(error) => Err(CacheError::Remote(error)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Sends Redis commands to an HTTP proxy with bearer-token auth
pub struct HttpTransport {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, CacheError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            token,
            client,
        })
    }

    fn post(&self, client: &reqwest::Client, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let request = client.post(url).json(body);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn command(&self, client: &reqwest::Client, args: Value) -> Result<Value, CacheError> {
        let response = self.post(client, &self.base_url, &args).send().await?;
        let status = response.status();
        let reply: ProxyReply = response.json().await?;
        if reply.error.is_none() && !status.is_success() {
            return Err(CacheError::Remote(format!("proxy answered {}", status)));
        }
        reply.into_result()
    }

    async fn pipeline(
        &self,
        client: &reqwest::Client,
        commands: Vec<Value>,
    ) -> Result<Vec<Value>, CacheError> {
        let url = format!("{}/pipeline", self.base_url);
        let response = self
            .post(client, &url, &Value::Array(commands))
            .send()
            .await?
            .error_for_status()?;
        let replies: Vec<ProxyReply> = response.json().await?;
        replies.into_iter().map(ProxyReply::into_result).collect()
    }
}

fn utf8(value: Vec<u8>) -> Result<String, CacheError> {
    String::from_utf8(value)
        .map_err(|_| CacheError::Codec("HTTP proxy transport requires UTF-8 payloads".into()))
}

fn bytes_of(value: Value) -> Result<Option<Vec<u8>>, CacheError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.into_bytes())),
        other => Err(CacheError::Remote(format!(
            "unexpected value type in reply: {}",
            other
        ))),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    type Connection = reqwest::Client;

    fn provider(&self) -> CacheProvider {
        CacheProvider::Http
    }

    async fn connect(&self) -> Result<reqwest::Client, CacheError> {
        let client = self.client.clone();
        self.command(&client, json!(["PING"])).await?;
        Ok(client)
    }

    async fn get(&self, conn: &reqwest::Client, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        bytes_of(self.command(conn, json!(["GET", key])).await?)
    }

    async fn set_ex(
        &self,
        conn: &reqwest::Client,
        key: &str,
        value: Vec<u8>,
        ttl_secs: u64,
    ) -> Result<(), CacheError> {
        let value = utf8(value)?;
        self.command(conn, json!(["SET", key, value, "EX", ttl_secs.to_string()]))
            .await?;
        Ok(())
    }

    async fn del(&self, conn: &reqwest::Client, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut args = vec![json!("DEL")];
        args.extend(keys.iter().map(|key| json!(key)));
        self.command(conn, Value::Array(args)).await?;
        Ok(())
    }

    async fn mget(
        &self,
        conn: &reqwest::Client,
        keys: &[String],
    ) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let mut args = vec![json!("MGET")];
        args.extend(keys.iter().map(|key| json!(key)));
        match self.command(conn, Value::Array(args)).await? {
            Value::Array(values) => values.into_iter().map(bytes_of).collect(),
            other => Err(CacheError::Remote(format!("MGET returned {}", other))),
        }
    }

    async fn mset_ex(
        &self,
        conn: &reqwest::Client,
        entries: Vec<(String, Vec<u8>)>,
        ttl_secs: u64,
    ) -> Result<(), CacheError> {
        let ttl = ttl_secs.to_string();
        let commands = entries
            .into_iter()
            .map(|(key, value)| Ok(json!(["SET", key, utf8(value)?, "EX", ttl])))
            .collect::<Result<Vec<_>, CacheError>>()?;
        self.pipeline(conn, commands).await?;
        Ok(())
    }

    async fn clear_prefix(&self, conn: &reqwest::Client, prefix: &str) -> Result<u64, CacheError> {
        let pattern = format!("{}*", prefix);
        let mut cursor = "0".to_owned();
        let mut removed = 0u64;
        loop {
            let reply = self
                .command(
                    conn,
                    json!(["SCAN", cursor, "MATCH", pattern, "COUNT", SCAN_COUNT.to_string()]),
                )
                .await?;
            let (next, keys) = parse_scan_reply(reply)?;
            if !keys.is_empty() {
                self.del(conn, &keys).await?;
                removed += keys.len() as u64;
            }
            if next == "0" {
                return Ok(removed);
            }
            cursor = next;
        }
    }

    async fn ping(&self, conn: &reqwest::Client) -> Result<(), CacheError> {
        self.command(conn, json!(["PING"])).await?;
        Ok(())
    }
}

/// `SCAN` replies are `[cursor, [key, ...]]`; the cursor may be a string or number.
fn parse_scan_reply(reply: Value) -> Result<(String, Vec<String>), CacheError> {
    let malformed = || CacheError::Remote("malformed SCAN reply".into());
    let Value::Array(mut parts) = reply else {
        return Err(malformed());
    };
    if parts.len() != 2 {
        return Err(malformed());
    }
    let keys = match parts.pop() {
        Some(Value::Array(keys)) => keys
            .into_iter()
            .map(|key| match key {
                Value::String(s) => Ok(s),
                _ => Err(malformed()),
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(malformed()),
    };
    let cursor = match parts.pop() {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(malformed()),
    };
    Ok((cursor, keys))
}
