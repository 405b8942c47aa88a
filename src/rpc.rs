//! JSON-RPC subprocess collaborator: line-delimited JSON over a child
//! process's stdio. This crate does not speak any particular RPC dialect
//! beyond the envelope (`jsonrpc`/`id`/`method`/`params`/`result`/`error`);
//! what `method` means is between the caller and the subprocess.
//!
//! Not concurrency-safe: one in-flight `call` at a time per [`RpcHandle`].
//! Callers that need concurrent calls hold one handle per worker rather
//! than sharing one across tasks.

use crate::error::{Error, Result};
use log::{debug, warn};
use serde_json::Value;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// A spawned subprocess speaking line-delimited JSON-RPC over its stdio.
pub struct RpcHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl RpcHandle {
    /// Spawns `program` with `args`, wiring its stdin/stdout as pipes.
    /// Stderr is inherited so subprocess diagnostics still reach the
    /// caller's terminal without polluting the line-delimited JSON stream.
    pub async fn create(program: &str, args: &[String]) -> Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::internal("spawned process has no stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("spawned process has no stdout pipe"))?;

        debug!("spawned JSON-RPC subprocess '{program}' (pid {:?})", child.id());

        Ok(Self { child, stdin, stdout: BufReader::new(stdout), next_id: 1 })
    }

    /// Sends `{"jsonrpc":"2.0","id":...,"method":method,"params":params}\n`
    /// and reads lines from stdout until one whose `id` matches. Lines that
    /// fail to parse as JSON, or whose `id` doesn't match, are logged and
    /// skipped rather than failing the call — a subprocess may interleave
    /// unrelated notifications on the same stream.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        loop {
            let mut buf = String::new();
            let read = self.stdout.read_line(&mut buf).await?;
            if read == 0 {
                return Err(Error::internal(format!(
                    "JSON-RPC subprocess closed stdout before replying to '{method}'"
                )));
            }
            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            let response: Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(e) => {
                    warn!("malformed JSON-RPC line from subprocess, skipping: {e}");
                    continue;
                }
            };
            let response_id = response.get("id").and_then(Value::as_u64);
            if response_id != Some(id) {
                warn!("JSON-RPC response id {response_id:?} does not match request id {id}, skipping");
                continue;
            }
            if let Some(error) = response.get("error") {
                return Err(Error::bad_state(format!("JSON-RPC error from '{method}': {error}")));
            }
            return Ok(response.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    /// Closes the write half of the pipe and waits for the child to exit.
    /// Rust can't run async code in `Drop`, so this is an explicit call
    /// rather than an implicit one; `kill_on_drop` on the spawned
    /// [`Command`] still guarantees the child doesn't outlive an
    /// `RpcHandle` a caller simply drops without calling this.
    pub async fn shutdown(self) -> Result<std::process::ExitStatus> {
        let RpcHandle { mut child, stdin, .. } = self;
        drop(stdin);
        let status = child.wait().await?;
        debug!("JSON-RPC subprocess exited with {status}");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_round_trips_through_a_subprocess() {
        let mut handle = RpcHandle::create(
            "sh",
            &["-c".to_string(), r#"read line; echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'"#.to_string()],
        )
        .await
        .unwrap();

        let result = handle.call("ping", serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn skips_malformed_lines_before_a_valid_response() {
        let _ = env_logger::try_init();
        let mut handle = RpcHandle::create(
            "sh",
            &[
                "-c".to_string(),
                r#"read line; echo 'not json at all'; echo '{"jsonrpc":"2.0","id":1,"result":42}'"#.to_string(),
            ],
        )
        .await
        .unwrap();

        let result = handle.call("ping", serde_json::json!(null)).await.unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[tokio::test]
    async fn error_response_surfaces_as_bad_state() {
        let mut handle = RpcHandle::create(
            "sh",
            &["-c".to_string(), r#"read line; echo '{"jsonrpc":"2.0","id":1,"error":{"message":"boom"}}'"#.to_string()],
        )
        .await
        .unwrap();

        let err = handle.call("ping", serde_json::json!(null)).await.unwrap_err();
        assert!(matches!(err, Error::BadState(_)));
    }

    #[tokio::test]
    async fn mismatched_response_id_is_skipped() {
        let _ = env_logger::try_init();
        let mut handle = RpcHandle::create(
            "sh",
            &[
                "-c".to_string(),
                r#"read line; echo '{"jsonrpc":"2.0","id":999,"result":"stale"}'; echo '{"jsonrpc":"2.0","id":1,"result":"fresh"}'"#.to_string(),
            ],
        )
        .await
        .unwrap();

        let result = handle.call("ping", serde_json::json!(null)).await.unwrap();
        assert_eq!(result, serde_json::json!("fresh"));
    }
}
