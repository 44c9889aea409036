// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use futures_util::StreamExt;

use super::*;

#[tokio::test]
async fn echo_generate_prefixes_prompt() -> anyhow::Result<()> {
    let model = EchoModel::new();
    let out = model.generate("hello").await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(out, "Echo: hello");
    Ok(())
}

#[tokio::test]
async fn echo_stream_reassembles_to_full_response() -> anyhow::Result<()> {
    let model = EchoModel::with_timing(4, std::time::Duration::ZERO);
    let mut stream = model.stream("hello world").await.map_err(|e| anyhow::anyhow!("{e}"))?;
    let mut assembled = String::new();
    let mut chunks = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| anyhow::anyhow!("{e}"))?;
        assembled.push_str(&chunk.text);
        chunks += 1;
    }
    assert_eq!(assembled, "Echo: hello world");
    assert!(chunks > 1, "expected multiple chunks, got {chunks}");
    Ok(())
}

#[test]
fn token_estimate_is_quarter_length() {
    let model = EchoModel::new();
    assert_eq!(model.estimate_tokens("abcdefgh"), 2);
    assert_eq!(model.estimate_tokens(""), 0);
}
