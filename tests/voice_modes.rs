//! Voice mode machine and audio-loop scenarios.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use async_trait::async_trait;
use scanner_agent::config::{BeepConfig, LlmConfig, TtsConfig, VoiceConfig};
use scanner_agent::process::ProcessTracker;
use scanner_agent::voice::matcher::{match_script, normalize};
use scanner_agent::voice::service::Heard;
use scanner_agent::voice::{
    ResponsesClient, ScriptEntry, SpeechSource, VoiceError, VoiceMachine, VoiceMode, VoiceOutput, VoiceService,
    VoiceServiceDeps, VoiceSettings,
};
use scanner_agent::{Dispatcher, HttpNmsClient, NmsApi, Result};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Silent;

#[async_trait]
impl SpeechSource for Silent {
    async fn next_utterance(&self, _mode: VoiceMode) -> Result<Option<String>> {
        Ok(None)
    }
}

fn settings(script: Vec<ScriptEntry>) -> VoiceSettings {
    VoiceSettings {
        wake_alias: "twin scout alpha".to_owned(),
        conversation_timeout: Duration::from_secs(20),
        llm_timeout: Duration::from_secs(30),
        script,
    }
}

fn three_entries() -> Vec<ScriptEntry> {
    vec![
        ScriptEntry::new("good morning", "Morning.", ""),
        ScriptEntry::new("battery level", "Battery is fine.", ""),
        ScriptEntry::new("let's talk", "", "enter.llm"),
    ]
}

fn service(dir: &Path, machine: VoiceMachine, llm_url: &str) -> VoiceService {
    std::fs::write(dir.join("tts.sh"), "echo \"$1\" >> said.txt\n").unwrap();
    std::fs::write(dir.join("key.txt"), "sk-test").unwrap();
    let tts = TtsConfig {
        shell: PathBuf::from("/bin/sh"),
        script: PathBuf::from("tts.sh"),
        timeout_sec: 5,
        ..TtsConfig::default()
    };
    let llm = LlmConfig {
        endpoint: llm_url.to_owned(),
        api_key_file: PathBuf::from("key.txt"),
        state_file: PathBuf::from("llm_state.json"),
        timeout_sec: 5,
        ..LlmConfig::default()
    };
    VoiceService::new(VoiceServiceDeps {
        machine,
        speech: Arc::new(Silent),
        llm: Arc::new(ResponsesClient::new(llm, dir).unwrap()),
        output: VoiceOutput::new(ProcessTracker::new(dir.join("run")).unwrap(), dir, tts, BeepConfig::default()),
        config: VoiceConfig::default(),
        llm_request_timeout: Duration::from_secs(5),
        record_path: dir.join("voice_config.json"),
        identity: "scanner01".to_owned(),
        bundles_dir: dir.join("bundles"),
    })
}

// ────────────────────────────────────────────────────────────────────────────
// External transitions
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_external_sequences_only_reach_light_modes() {
    for a in VoiceMode::ALL {
        for b in VoiceMode::ALL {
            for c in VoiceMode::ALL {
                let machine = VoiceMachine::new(VoiceMode::Deaf, settings(Vec::new())).unwrap();
                for target in [a, b, c] {
                    let _ = machine.request_external(target);
                    let mode = machine.mode().unwrap();
                    assert!(
                        matches!(mode, VoiceMode::Deaf | VoiceMode::NameListen),
                        "{a} {b} {c} reached {mode}"
                    );
                }
            }
        }
    }
}

#[test]
fn test_heavy_targets_rejected_and_state_unchanged() {
    let machine = VoiceMachine::new(VoiceMode::NameListen, settings(three_entries())).unwrap();
    let before = machine.snapshot().unwrap();
    for target in [VoiceMode::Conversation, VoiceMode::Llm] {
        assert_eq!(
            machine.request_external(target).unwrap_err(),
            VoiceError::ExternalTargetRefused(target)
        );
    }
    assert_eq!(machine.snapshot().unwrap(), before);
}

#[test]
fn test_external_deaf_mid_conversation_is_refused() {
    let machine = VoiceMachine::new(VoiceMode::NameListen, settings(Vec::new())).unwrap();
    machine.wake_detected(Instant::now()).unwrap();
    let before = machine.snapshot().unwrap();
    assert!(matches!(
        machine.request_external(VoiceMode::Deaf),
        Err(VoiceError::IllegalTransition { .. })
    ));
    assert_eq!(machine.snapshot().unwrap(), before);
}

// ────────────────────────────────────────────────────────────────────────────
// Audio loop scenarios
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_wake_then_silence_returns_to_name_listen() {
    let dir = tempfile::tempdir().unwrap();
    let machine = VoiceMachine::new(VoiceMode::NameListen, settings(three_entries())).unwrap();
    let svc = service(dir.path(), machine.clone(), "http://127.0.0.1:9/v1/responses");

    assert_eq!(svc.handle_utterance("twin scout alfa").await, Heard::Woke);
    assert_eq!(machine.mode().unwrap(), VoiceMode::Conversation);

    // Nothing heard: just short of the deadline nothing happens, past it the
    // session ends.
    let woke_at = Instant::now();
    svc.expire(woke_at + Duration::from_secs(10)).await;
    assert_eq!(machine.mode().unwrap(), VoiceMode::Conversation);
    svc.expire(woke_at + Duration::from_secs(21)).await;
    assert_eq!(machine.mode().unwrap(), VoiceMode::NameListen);
}

#[tokio::test]
async fn test_llm_exchange_speaks_reply_and_keeps_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "resp_1",
            "output": [{"content": [{"type": "output_text", "text": "It is sunny."}]}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let machine = VoiceMachine::new(VoiceMode::NameListen, settings(three_entries())).unwrap();
    let svc = service(dir.path(), machine.clone(), &format!("{}/v1/responses", server.uri()));

    assert_eq!(svc.handle_utterance("alpha").await, Heard::Woke);
    assert_eq!(svc.handle_utterance("let's talk").await, Heard::Matched("let's talk".to_owned()));
    assert_eq!(machine.mode().unwrap(), VoiceMode::Llm);

    assert_eq!(svc.handle_utterance("what is the weather").await, Heard::Answered);
    assert_eq!(machine.mode().unwrap(), VoiceMode::Llm);
    let said = std::fs::read_to_string(dir.path().join("said.txt")).unwrap();
    assert!(said.contains("It is sunny."));
}

// ────────────────────────────────────────────────────────────────────────────
// Script replacement via the NMS
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_script_set_replaces_previous_table() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cmd/poll/scanner01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "commands": [{
                "cmd_id": "v-1",
                "action": "voice.script.set",
                "category": "voice",
                "args": {"commands": [
                    {"phrase": "status please", "action": "status.report"},
                    {"phrase": "thank you", "reply": "You're welcome."}
                ]}
            }]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (ctx, _services) = common::context(common::config(dir.path(), &server.uri()));
    ctx.voice.replace_script(three_entries()).unwrap();
    let old_phrase = normalize("good morning");
    assert!(match_script(&old_phrase, &ctx.voice.snapshot().unwrap().script, 0.8).is_some());

    let nms: Arc<dyn NmsApi> = Arc::new(HttpNmsClient::new(&server.uri(), Duration::from_secs(2)).unwrap());
    let mut dispatcher = Dispatcher::new(Arc::clone(&ctx), nms, "scanner01");
    dispatcher.tick().await;

    let script = ctx.voice.snapshot().unwrap().script;
    assert_eq!(script.len(), 2);
    assert!(match_script(&old_phrase, &script, 0.8).is_none());
    assert_eq!(
        match_script(&normalize("Thank you!"), &script, 0.8).map(|e| e.reply.as_str()),
        Some("You're welcome.")
    );
}
