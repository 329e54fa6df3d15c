//! Engine backed by a local inference server process
//!
//! Each initialized model gets its own server child bound to an ephemeral
//! loopback port. Readiness is detected from the server's stderr; requests go
//! over its OpenAI-compatible HTTP surface.

use super::{
    ChatMessage, Completion, CompletionOptions, EngineFactory, EngineVariant, FunctionCall,
    InferenceEngine, Timings, TokenCallback,
};
use crate::artifacts::{Artifact, ArtifactKind, local};
use crate::error::{OrchestratorError, OrchestratorResult};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Grace period between SIGTERM and SIGKILL on destroy
const STOP_GRACE: Duration = Duration::from_secs(5);

/// How to launch one engine variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineCommand {
    pub binary: String,
    /// Appended after the model path, host and port arguments
    pub args: Vec<String>,
    /// Stderr substrings that mark the server as ready
    pub ready_markers: Vec<String>,
}

impl Default for EngineCommand {
    fn default() -> Self {
        Self {
            binary: "llama-server".to_string(),
            args: vec!["--embeddings".to_string()],
            ready_markers: vec![
                "server is listening".to_string(),
                "HTTP server listening".to_string(),
            ],
        }
    }
}

impl EngineCommand {
    /// CPU-only variant of the default command
    pub fn cpu_fallback() -> Self {
        let mut command = Self::default();
        command
            .args
            .extend(["--n-gpu-layers".to_string(), "0".to_string()]);
        command
    }
}

/// Spawns one inference server per initialized model
pub struct ServerEngineFactory {
    primary: EngineCommand,
    fallback: EngineCommand,
    start_timeout: Duration,
    client: reqwest::Client,
}

impl ServerEngineFactory {
    pub fn new(primary: EngineCommand, fallback: EngineCommand, start_timeout: Duration) -> Self {
        Self {
            primary,
            fallback,
            start_timeout,
            client: reqwest::Client::new(),
        }
    }

    fn command_for(&self, variant: EngineVariant) -> &EngineCommand {
        match variant {
            EngineVariant::Primary => &self.primary,
            EngineVariant::Fallback => &self.fallback,
        }
    }

    fn spawn(&self, command: &EngineCommand, model_path: &Path, port: u16) -> std::io::Result<Child> {
        let mut cmd = Command::new(&command.binary);
        cmd.arg("--model")
            .arg(model_path)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .args(&command.args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.spawn()
    }
}

#[async_trait]
impl EngineFactory for ServerEngineFactory {
    async fn initialize(
        &self,
        variant: EngineVariant,
        artifact: &Artifact,
    ) -> OrchestratorResult<Arc<dyn InferenceEngine>> {
        let command = self.command_for(variant);
        let init_failure = |reason: String| OrchestratorError::EngineInitFailure {
            slug: artifact.slug.clone(),
            reason,
        };

        let model_path = model_file(artifact);
        let port = free_port().map_err(|e| init_failure(format!("no free port: {e}")))?;

        tracing::debug!(
            slug = %artifact.slug,
            binary = %command.binary,
            model_path = ?model_path,
            port = port,
            variant = %variant,
            "Spawning inference server"
        );

        let mut child = self
            .spawn(command, &model_path, port)
            .map_err(|e| init_failure(format!("failed to spawn {}: {e}", command.binary)))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| init_failure("failed to capture stderr".to_string()))?;
        let mut lines = BufReader::new(stderr).lines();

        let ready = timeout(
            self.start_timeout,
            monitor_output(&mut lines, &command.ready_markers, &artifact.slug),
        )
        .await;

        let outcome = match ready {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(format!(
                "timeout after {}s waiting for server to start",
                self.start_timeout.as_secs()
            )),
        };

        if let Err(reason) = outcome {
            let _ = child.kill().await;
            return Err(init_failure(reason));
        }

        // Keep draining stderr so the pipe never fills up
        let slug = artifact.slug.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::trace!(slug = %slug, line = %line, "Inference server output");
            }
        });

        tracing::info!(
            slug = %artifact.slug,
            variant = %variant,
            port = port,
            pid = ?child.id(),
            "Inference server ready"
        );

        Ok(Arc::new(ServerEngine {
            slug: artifact.slug.clone(),
            base_url: format!("http://127.0.0.1:{port}"),
            client: self.client.clone(),
            child: Mutex::new(Some(child)),
        }))
    }
}

/// Weight file to pass to the server: the file itself, or the first weight
/// file inside a folder
fn model_file(artifact: &Artifact) -> PathBuf {
    match artifact.kind {
        ArtifactKind::SingleFile => artifact.path.clone(),
        ArtifactKind::WeightFolder => local::first_weight_file(&artifact.path)
            .unwrap_or_else(|| artifact.path.clone()),
    }
}

fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Wait for a ready marker or an error indicator on the server's stderr
async fn monitor_output(
    reader: &mut Lines<BufReader<ChildStderr>>,
    ready_markers: &[String],
    slug: &str,
) -> Result<(), String> {
    while let Ok(Some(line)) = reader.next_line().await {
        tracing::trace!(slug = %slug, line = %line, "Inference server output");

        if ready_markers.iter().any(|m| line.contains(m.as_str())) {
            return Ok(());
        }

        if line.contains("out of memory") || line.contains("failed to allocate") {
            return Err(format!("out of memory: {line}"));
        }

        if line.contains("failed to load model") || line.contains("error loading model") {
            let mut error_lines = vec![line];
            for _ in 0..3 {
                match reader.next_line().await {
                    Ok(Some(next)) => error_lines.push(next),
                    _ => break,
                }
            }
            return Err(error_lines.join("\n"));
        }
    }

    Err("inference server exited before becoming ready".to_string())
}

/// A running inference server for one model
pub struct ServerEngine {
    slug: String,
    base_url: String,
    client: reqwest::Client,
    child: Mutex<Option<Child>>,
}

impl ServerEngine {
    fn request_body(messages: &[ChatMessage], options: &CompletionOptions, stream: bool) -> Value {
        let mut body = json!({
            "messages": messages,
            "temperature": options.temperature,
            "top_p": options.top_p,
            "top_k": options.top_k,
            "max_tokens": options.max_tokens,
            "stream": stream,
        });
        if !options.tools.is_empty() {
            body["tools"] = Value::Array(options.tools.clone());
        }
        body
    }

    async fn post(&self, path: &str, body: &Value) -> OrchestratorResult<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(OrchestratorError::engine)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::engine(format!(
                "{} returned {status}: {text}",
                self.slug
            )));
        }
        Ok(response)
    }

    /// Consume a server-sent event stream, forwarding content deltas.
    ///
    /// Lines that are not `data:` events or do not parse as JSON are skipped.
    async fn read_stream<S, B, E>(
        stream: S,
        on_token: &mut TokenCallback,
    ) -> OrchestratorResult<Completion>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        let mut completion = Completion::default();
        let mut buffer = String::new();
        let mut stream = std::pin::pin!(stream);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(OrchestratorError::engine)?;
            buffer.push_str(&String::from_utf8_lossy(chunk.as_ref()));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let Some(data) = line.trim().strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    return Ok(completion);
                }
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    tracing::debug!(data = %data, "Skipping malformed stream event");
                    continue;
                };
                if let Some(token) = event["choices"][0]["delta"]["content"].as_str() {
                    on_token(token);
                    completion.text.push_str(token);
                }
                if let Some(timings) = parse_timings(&event["timings"]) {
                    completion.timings = timings;
                }
            }
        }

        Ok(completion)
    }
}

fn parse_timings(value: &Value) -> Option<Timings> {
    let obj = value.as_object()?;
    let get = |key: &str| obj.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    let prompt_ms = get("prompt_ms");
    let predicted_ms = get("predicted_ms");
    Some(Timings {
        time_to_first_token_ms: prompt_ms,
        total_time_ms: prompt_ms + predicted_ms,
        tokens_per_second: get("predicted_per_second"),
        prefill_tokens: get("prompt_n") as u64,
        decode_tokens: get("predicted_n") as u64,
    })
}

fn parse_completion(body: &Value) -> Completion {
    let message = &body["choices"][0]["message"];
    let function_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = &call["function"];
                    let name = function["name"].as_str()?.to_string();
                    let arguments = match &function["arguments"] {
                        Value::String(raw) => {
                            serde_json::from_str(raw).unwrap_or(Value::String(raw.clone()))
                        }
                        other => other.clone(),
                    };
                    Some(FunctionCall { name, arguments })
                })
                .collect()
        })
        .unwrap_or_default();

    Completion {
        text: message["content"].as_str().unwrap_or_default().to_string(),
        function_calls,
        timings: parse_timings(&body["timings"]).unwrap_or_default(),
    }
}

#[async_trait]
impl InferenceEngine for ServerEngine {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        on_token: Option<TokenCallback>,
    ) -> OrchestratorResult<Completion> {
        // Tool calls are only parsed from whole responses
        match on_token {
            Some(mut on_token) if options.tools.is_empty() => {
                let body = Self::request_body(messages, options, true);
                let response = self.post("/v1/chat/completions", &body).await?;
                Self::read_stream(response.bytes_stream(), &mut on_token).await
            }
            mut on_token => {
                let body = Self::request_body(messages, options, false);
                let response = self.post("/v1/chat/completions", &body).await?;
                let json: Value = response.json().await.map_err(OrchestratorError::engine)?;
                let completion = parse_completion(&json);
                if let Some(cb) = on_token.as_mut() {
                    cb(&completion.text);
                }
                Ok(completion)
            }
        }
    }

    async fn embed(&self, text: &str) -> OrchestratorResult<Vec<f32>> {
        let response = self
            .post("/v1/embeddings", &json!({ "input": text }))
            .await?;
        let json: Value = response.json().await.map_err(OrchestratorError::engine)?;
        json["data"][0]["embedding"]
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_f64)
                    .map(|v| v as f32)
                    .collect()
            })
            .ok_or_else(|| OrchestratorError::engine("embedding response missing data"))
    }

    async fn destroy(&self) -> OrchestratorResult<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(pid as i32);
            let _ = kill(pid, Signal::SIGTERM);

            tokio::select! {
                _ = child.wait() => {
                    tracing::info!(slug = %self.slug, "Inference server stopped gracefully");
                }
                _ = tokio::time::sleep(STOP_GRACE) => {
                    tracing::warn!(slug = %self.slug, "Graceful shutdown timeout, sending SIGKILL");
                    let _ = kill(pid, Signal::SIGKILL);
                    let _ = child.wait().await;
                }
            }
            return Ok(());
        }

        // No pid means the process has already been reaped
        if let Err(e) = child.kill().await {
            tracing::debug!(slug = %self.slug, error = %e, "Inference server already stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactOrigin;

    fn artifact(path: &str) -> Artifact {
        Artifact::new(
            "lfm2-350m",
            PathBuf::from(path),
            ArtifactKind::SingleFile,
            ArtifactOrigin::Local,
        )
    }

    #[test]
    fn test_engine_command_defaults() {
        let primary = EngineCommand::default();
        assert_eq!(primary.binary, "llama-server");
        assert!(!primary.ready_markers.is_empty());

        let fallback = EngineCommand::cpu_fallback();
        assert!(fallback.args.contains(&"--n-gpu-layers".to_string()));
    }

    #[test]
    fn test_engine_command_partial_toml() {
        let command: EngineCommand = toml::from_str(r#"binary = "/opt/bin/server""#).unwrap();
        assert_eq!(command.binary, "/opt/bin/server");
        assert_eq!(command.args, vec!["--embeddings".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_binary_is_init_failure() {
        let command = EngineCommand {
            binary: "/nonexistent/inference-server".to_string(),
            ..Default::default()
        };
        let factory =
            ServerEngineFactory::new(command.clone(), command, Duration::from_secs(1));

        let err = factory
            .initialize(EngineVariant::Primary, &artifact("/tmp/model.gguf"))
            .await
            .err()
            .unwrap();
        match err {
            OrchestratorError::EngineInitFailure { slug, reason } => {
                assert_eq!(slug, "lfm2-350m");
                assert!(reason.contains("failed to spawn"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_before_ready_is_init_failure() {
        // `true` ignores its arguments and exits without printing a marker
        let command = EngineCommand {
            binary: "true".to_string(),
            args: vec![],
            ..Default::default()
        };
        let factory =
            ServerEngineFactory::new(command.clone(), command, Duration::from_secs(5));

        let err = factory
            .initialize(EngineVariant::Fallback, &artifact("/tmp/model.gguf"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("exited before becoming ready"));
    }

    #[test]
    fn test_parse_completion_with_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "Turning on",
                    "tool_calls": [{
                        "function": {"name": "set_flashlight", "arguments": "{\"on\": true}"}
                    }]
                }
            }],
            "timings": {"prompt_ms": 10.0, "predicted_ms": 30.0, "predicted_per_second": 50.0, "prompt_n": 5, "predicted_n": 12}
        });
        let completion = parse_completion(&body);
        assert_eq!(completion.text, "Turning on");
        assert_eq!(completion.function_calls[0].name, "set_flashlight");
        assert_eq!(completion.function_calls[0].arguments["on"], json!(true));
        assert_eq!(completion.timings.total_time_ms, 40.0);
        assert_eq!(completion.timings.decode_tokens, 12);
    }

    fn collecting_callback() -> (TokenCallback, Arc<std::sync::Mutex<Vec<String>>>) {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: TokenCallback = Box::new(move |token: &str| {
            sink.lock().unwrap().push(token.to_string());
        });
        (callback, seen)
    }

    #[tokio::test]
    async fn test_read_stream_stops_at_done_and_skips_malformed_lines() {
        // Event split across chunks, a comment line, malformed JSON and a
        // token after [DONE] that must never be forwarded
        let chunks: Vec<Result<&[u8], std::io::Error>> = vec![
            Ok(b": keep-alive\ndata: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n".as_slice()),
            Ok(b"data: {\"choices\":[{\"delta\":{\"con".as_slice()),
            Ok(b"tent\":\"lo\"}}]}\n\ndata: {not json\n\n".as_slice()),
            Ok(b"data: {\"choices\":[{\"delta\":{}}],\"timings\":{\"prompt_ms\":4.0,\"predicted_ms\":6.0,\"predicted_n\":2}}\n\n".as_slice()),
            Ok(b"data: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n".as_slice()),
        ];
        let (mut callback, seen) = collecting_callback();

        let completion = ServerEngine::read_stream(futures::stream::iter(chunks), &mut callback)
            .await
            .unwrap();

        assert_eq!(completion.text, "Hello");
        assert_eq!(*seen.lock().unwrap(), vec!["Hel".to_string(), "lo".to_string()]);
        assert_eq!(completion.timings.total_time_ms, 10.0);
        assert_eq!(completion.timings.decode_tokens, 2);
    }

    #[tokio::test]
    async fn test_read_stream_transport_error() {
        let chunks: Vec<Result<&[u8], std::io::Error>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n".as_slice()),
            Err(std::io::Error::other("connection reset")),
        ];
        let (mut callback, _) = collecting_callback();

        let err = ServerEngine::read_stream(futures::stream::iter(chunks), &mut callback)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Engine { .. }));
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_read_stream_without_done_returns_collected_text() {
        let chunks: Vec<Result<&[u8], std::io::Error>> =
            vec![Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n".as_slice())];
        let (mut callback, _) = collecting_callback();

        let completion = ServerEngine::read_stream(futures::stream::iter(chunks), &mut callback)
            .await
            .unwrap();
        assert_eq!(completion.text, "partial");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_destroy_reaped_child_is_ok() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();
        assert!(child.id().is_none());

        let engine = ServerEngine {
            slug: "lfm2-350m".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            client: reqwest::Client::new(),
            child: Mutex::new(Some(child)),
        };
        engine.destroy().await.unwrap();
        // Second destroy finds no child at all
        engine.destroy().await.unwrap();
    }

    #[test]
    fn test_model_file_descends_into_weight_subfolder() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.json"), b"{}").unwrap();
        std::fs::create_dir(temp.path().join("weights")).unwrap();
        std::fs::write(temp.path().join("weights/model.bin"), b"w").unwrap();

        let artifact = Artifact::new(
            "lfm2-350m",
            temp.path().to_path_buf(),
            ArtifactKind::WeightFolder,
            ArtifactOrigin::Local,
        );
        assert_eq!(model_file(&artifact), temp.path().join("weights/model.bin"));
    }

    #[test]
    fn test_request_body_includes_tools_only_when_present() {
        let messages = [ChatMessage::user("hi")];
        let body = ServerEngine::request_body(&messages, &CompletionOptions::default(), false);
        assert!(body.get("tools").is_none());

        let options = CompletionOptions {
            tools: vec![json!({"type": "function"})],
            ..Default::default()
        };
        let body = ServerEngine::request_body(&messages, &options, true);
        assert_eq!(body["tools"].as_array().unwrap().len(), 1);
        assert_eq!(body["stream"], json!(true));
    }
}
