//! Scripted MCP server for process-level tests.

use std::collections::HashMap;
use std::time::Duration;

use super::types::ServerConfig;

/// A `/bin/sh` MCP server. It prints a noise line on stdout, then answers
/// `initialize`, `tools/list` and `tools/call` for four tools:
/// `get_issue` (text content), `boom` (JSON-RPC error), `slow` (never
/// answers) and `crash` (exits the process).
const FAKE_SERVER: &str = r#"#!/bin/sh
echo "fake server booting" >&2
echo "not json, just a banner"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"1"}}}\n' "$id"
      ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"get_issue","description":"Fetch a Jira issue by key","inputSchema":{"type":"object"}},{"name":"boom","description":"Always fails"},{"name":"slow","description":"Never answers"},{"name":"crash","description":"Exits the server"}]}}\n' "$id"
      ;;
    *'"method":"tools/call"'*)
      case "$line" in
        *'"name":"get_issue"'*)
          printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"CMU-102: Add login audit"}]}}\n' "$id"
          ;;
        *'"name":"boom"'*)
          printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32603,"message":"boom failed"}}\n' "$id"
          ;;
        *'"name":"crash"'*)
          exit 1
          ;;
      esac
      ;;
  esac
done
"#;

/// Write the scripted server into `dir` and return a config that runs it.
pub(crate) fn fake_server_config(dir: &tempfile::TempDir) -> ServerConfig {
    let path = dir.path().join("fake_server.sh");
    std::fs::write(&path, FAKE_SERVER).unwrap();
    ServerConfig {
        command: "sh".into(),
        args: vec![path.to_string_lossy().into_owned()],
        env: HashMap::new(),
        cwd: None,
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within 5s");
}
