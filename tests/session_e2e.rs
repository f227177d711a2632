//! Full conversations over the in-process transport with scripted services.

use std::sync::Arc;
use voxagent::defaults::{AUDIO_OUT_SAMPLE_RATE, DEFAULT_LANGUAGE, GREETING_PROMPT, SYSTEM_PROMPT};
use voxagent::frame::FrameKind;
use voxagent::services::{MockSpeechToText, MockTextToSpeech, ScriptedLlm};
use voxagent::transport::{ClientHandle, Outbound};
use voxagent::{
    Config, FrameData, LocalTransport, Message, PipelineRunner, Role, SessionServices, TaskOutcome,
    build_session,
};

const SAMPLE_RATE: u32 = 16000;

/// 20ms of 16kHz audio at a constant amplitude.
fn chunk(amplitude: i16) -> Vec<i16> {
    vec![amplitude; 320]
}

/// Half a second of speech followed by enough silence to end the turn.
fn speak(client: &mut ClientHandle) {
    for _ in 0..25 {
        client.send_audio(chunk(8000), SAMPLE_RATE).unwrap();
    }
    for _ in 0..15 {
        client.send_audio(chunk(0), SAMPLE_RATE).unwrap();
    }
}

async fn collect_reply(client: &mut ClientHandle) -> (String, usize) {
    let mut text = String::new();
    let mut audio_chunks = 0;
    loop {
        match client.recv().await {
            Some(Outbound::Text(fragment)) => text.push_str(&fragment),
            Some(Outbound::Audio(_)) => audio_chunks += 1,
            Some(Outbound::ResponseEnd) | None => return (text, audio_chunks),
        }
    }
}

#[tokio::test]
async fn test_greeting_on_connect() {
    let llm = ScriptedLlm::new("cerebras").with_reply(&["Привіт! ", "Я Олеся."]);
    let tts = MockTextToSpeech::new();
    let (transport, mut client) = LocalTransport::new();
    let services = SessionServices {
        llm: vec![Arc::new(llm.clone())],
        tts: Some(Arc::new(tts.clone())),
        ..SessionServices::default()
    };
    let session = build_session(&Config::default(), services, &transport, Vec::new()).unwrap();
    let handle = session.handle.clone();
    let context = session.context.clone();
    let metrics = session.metrics.clone().unwrap();
    let runner = PipelineRunner::new(false);
    let run = tokio::spawn(async move { session.run(&runner).await });

    client.connect("alice").unwrap();
    let (reply, audio_chunks) = collect_reply(&mut client).await;
    assert_eq!(reply, "Привіт! Я Олеся.");
    assert!(audio_chunks > 0);

    handle.stop_when_done().unwrap();
    assert_eq!(run.await.unwrap(), TaskOutcome::Completed);

    assert_eq!(
        context.messages(),
        vec![
            Message::system(SYSTEM_PROMPT),
            Message::system(GREETING_PROMPT),
            Message::assistant("Привіт! Я Олеся."),
        ]
    );
    let generated_from = &llm.contexts()[0];
    assert_eq!(generated_from.len(), 2);

    let calls = tts.calls();
    let spoken: Vec<&str> = calls.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(spoken, vec!["Привіт!", "Я Олеся."]);
    let tts_config = Config::default().tts;
    assert!(calls.iter().all(|c| c.settings.voice_id == tts_config.voice_id
        && c.settings.model == tts_config.model));

    let summary = metrics.summary();
    assert_eq!(summary.llm_usage.completion_tokens, 2);
    assert!(summary.tts_characters > 0);
    assert!(metrics.count(FrameKind::TtsAudio) > 0);
}

#[tokio::test]
async fn test_typed_turns_build_history() {
    let llm = ScriptedLlm::new("llm")
        .with_reply(&["Добре, дякую."])
        .with_reply(&["Сонячно."]);
    let mut config = Config::default();
    config.prompt.greeting.clear();
    let (transport, mut client) = LocalTransport::new();
    let services = SessionServices {
        llm: vec![Arc::new(llm.clone())],
        ..SessionServices::default()
    };
    let session = build_session(&config, services, &transport, Vec::new()).unwrap();
    let handle = session.handle.clone();
    let context = session.context.clone();
    let runner = PipelineRunner::new(false);
    let run = tokio::spawn(async move { session.run(&runner).await });

    client.connect("alice").unwrap();
    client.send_text("Як справи?").unwrap();
    assert_eq!(client.next_response().await.as_deref(), Some("Добре, дякую."));
    client.send_text("Яка погода?").unwrap();
    assert_eq!(client.next_response().await.as_deref(), Some("Сонячно."));

    handle.stop_when_done().unwrap();
    assert_eq!(run.await.unwrap(), TaskOutcome::Completed);

    let roles: Vec<Role> = context.messages().iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            Role::System,
            Role::User,
            Role::Assistant,
            Role::User,
            Role::Assistant
        ]
    );

    // The second request saw the whole first exchange
    let second = &llm.contexts()[1];
    assert_eq!(second.len(), 4);
    assert_eq!(second.messages()[3], Message::user("Яка погода?"));
}

#[tokio::test]
async fn test_spoken_turn_reaches_llm() {
    let stt = MockSpeechToText::new().with_utterance(&["Привіт,", "як справи?"]);
    let llm = ScriptedLlm::new("llm").with_reply(&["Чудово!"]);
    let mut config = Config::default();
    config.prompt.greeting.clear();
    let (transport, mut client) = LocalTransport::new();
    let services = SessionServices {
        stt: Some(Arc::new(stt.clone())),
        llm: vec![Arc::new(llm.clone())],
        tts: Some(Arc::new(MockTextToSpeech::new())),
        ..SessionServices::default()
    };
    let session = build_session(&config, services, &transport, Vec::new()).unwrap();
    let handle = session.handle.clone();
    let context = session.context.clone();
    let runner = PipelineRunner::new(false);
    let run = tokio::spawn(async move { session.run(&runner).await });

    client.connect("alice").unwrap();
    speak(&mut client);
    let (reply, _) = collect_reply(&mut client).await;
    assert_eq!(reply, "Чудово!");

    handle.stop_when_done().unwrap();
    assert_eq!(run.await.unwrap(), TaskOutcome::Completed);

    assert_eq!(stt.opened(), vec![DEFAULT_LANGUAGE.to_string()]);
    assert!(stt.audio_samples() > 0);
    assert_eq!(
        context.messages()[1],
        Message::user("Привіт, як справи?")
    );
    assert_eq!(context.messages()[2], Message::assistant("Чудово!"));
}

#[tokio::test]
async fn test_queued_speech_bypasses_llm() {
    let llm = ScriptedLlm::new("llm");
    let tts = MockTextToSpeech::new();
    let mut config = Config::default();
    config.prompt.greeting.clear();
    let (transport, mut client) = LocalTransport::new();
    let services = SessionServices {
        llm: vec![Arc::new(llm.clone())],
        tts: Some(Arc::new(tts.clone())),
        ..SessionServices::default()
    };
    let session = build_session(&config, services, &transport, Vec::new()).unwrap();
    let handle = session.handle.clone();
    let runner = PipelineRunner::new(false);
    let run = tokio::spawn(async move { session.run(&runner).await });

    handle
        .queue_frame(FrameData::TtsSpeak("Зачекайте, будь ласка.".into()))
        .unwrap();
    match client.recv().await {
        Some(Outbound::Audio(chunk)) => assert_eq!(chunk.sample_rate, AUDIO_OUT_SAMPLE_RATE),
        other => panic!("expected audio, got {other:?}"),
    }

    handle.stop_when_done().unwrap();
    assert_eq!(run.await.unwrap(), TaskOutcome::Completed);
    assert!(llm.contexts().is_empty());
    assert_eq!(tts.calls().len(), 1);
}

#[tokio::test]
async fn test_completion_leaves_no_open_connection() {
    let llm = ScriptedLlm::new("llm").with_reply(&["Бувайте!"]);
    let mut config = Config::default();
    config.prompt.greeting.clear();
    let (transport, mut client) = LocalTransport::new();
    let services = SessionServices {
        llm: vec![Arc::new(llm)],
        ..SessionServices::default()
    };
    let session = build_session(&config, services, &transport, Vec::new()).unwrap();
    let handle = session.handle.clone();
    let runner = PipelineRunner::new(false);
    let run = tokio::spawn(async move { session.run(&runner).await });

    client.connect("alice").unwrap();
    client.send_text("До побачення").unwrap();
    assert_eq!(client.next_response().await.as_deref(), Some("Бувайте!"));

    handle.stop_when_done().unwrap();
    assert_eq!(run.await.unwrap(), TaskOutcome::Completed);

    assert!(client.send_text("ви ще тут?").is_err());
    assert_eq!(client.recv().await, None);
}
