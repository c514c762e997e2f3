//! Voice assistant loop
//!
//! Speech-to-text, text-to-speech and the room transport live outside this
//! crate. Final transcripts arrive over a channel, replies leave through a
//! [`Speaker`].

use crate::adapter::{ChatContext, ChatOptions, ChatRole, GraphLlm};
use crate::checkpoint::ThreadId;
use crate::graph::GraphError;
use crate::system_prompt::{GREETING, VOICE_SYSTEM_PROMPT};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("speech output failed: {0}")]
    Speaker(String),
}

/// Text-to-speech seam
#[async_trait]
pub trait Speaker: Send + Sync {
    async fn say(&self, text: &str, allow_interruptions: bool) -> Result<(), VoiceError>;
}

/// Output of the speech-to-text engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    /// Interim hypotheses are ignored; only final ones start a turn
    pub is_final: bool,
}

impl Transcript {
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Prints replies to stdout, for running the assistant from a terminal
pub struct ConsoleSpeaker;

#[async_trait]
impl Speaker for ConsoleSpeaker {
    async fn say(&self, text: &str, _allow_interruptions: bool) -> Result<(), VoiceError> {
        let mut stdout = tokio::io::stdout();
        let line = format!("assistant> {text}\n");
        stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|e| VoiceError::Speaker(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| VoiceError::Speaker(e.to_string()))
    }
}

pub struct VoiceAssistant<S> {
    llm: GraphLlm,
    speaker: S,
    chat_ctx: ChatContext,
    session: Option<ThreadId>,
}

impl<S: Speaker> VoiceAssistant<S> {
    /// Assistant whose context starts with the voice persona prompt
    pub fn new(llm: GraphLlm, speaker: S) -> Self {
        Self {
            llm,
            speaker,
            chat_ctx: ChatContext::new().append(ChatRole::System, VOICE_SYSTEM_PROMPT),
            session: None,
        }
    }

    /// Run every turn on one checkpointed thread instead of a fresh one
    pub fn with_session(mut self, thread_id: ThreadId) -> Self {
        self.session = Some(thread_id);
        self
    }

    pub async fn greet(&mut self) -> Result<(), VoiceError> {
        self.speaker.say(GREETING, true).await?;
        self.chat_ctx.push(ChatRole::Assistant, GREETING);
        Ok(())
    }

    /// Answer one transcript. Returns the spoken reply, or `None` when the
    /// transcript did not start a turn.
    pub async fn handle_transcript(
        &mut self,
        transcript: Transcript,
    ) -> Result<Option<String>, VoiceError> {
        if !transcript.is_final || transcript.text.trim().is_empty() {
            return Ok(None);
        }

        self.chat_ctx.push(ChatRole::User, transcript.text);
        let options = self
            .session
            .clone()
            .map(ChatOptions::session)
            .unwrap_or_default();
        let stream = self.llm.chat(&self.chat_ctx, options)?;
        tracing::debug!(request_id = stream.request_id(), "Voice turn started");
        let reply = stream.collect_text().await?;

        self.speaker.say(&reply, true).await?;
        self.chat_ctx.push(ChatRole::Assistant, reply.clone());
        Ok(Some(reply))
    }

    /// Greet, then answer transcripts until the channel closes.
    ///
    /// A failed turn is logged and the loop keeps listening; speech output
    /// failures end it.
    pub async fn run(mut self, mut transcripts: mpsc::Receiver<Transcript>) -> Result<(), VoiceError> {
        self.greet().await?;
        while let Some(transcript) = transcripts.recv().await {
            match self.handle_transcript(transcript).await {
                Ok(_) => {}
                Err(VoiceError::Graph(e)) => {
                    tracing::error!(error = %e, "Voice turn failed");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(turns = self.chat_ctx.messages.len(), "Transcript stream closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::graph::{ConversationGraph, DEFAULT_MAX_STEPS};
    use crate::llm::testing::MockLlmService;
    use crate::llm::LlmError;
    use crate::tools::ToolRegistry;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct RecordingSpeaker {
        spoken: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingSpeaker {
        fn spoken(&self) -> Vec<String> {
            self.spoken.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Speaker for RecordingSpeaker {
        async fn say(&self, text: &str, _allow_interruptions: bool) -> Result<(), VoiceError> {
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn assistant(mock: Arc<MockLlmService>) -> (VoiceAssistant<RecordingSpeaker>, RecordingSpeaker) {
        let graph = ConversationGraph::assistant(
            mock,
            "collect contract terms",
            Arc::new(ToolRegistry::empty()),
            Arc::new(CheckpointStore::default()),
            DEFAULT_MAX_STEPS,
        )
        .unwrap();
        let speaker = RecordingSpeaker::default();
        let voice = VoiceAssistant::new(GraphLlm::new(Arc::new(graph)), speaker.clone());
        (voice, speaker)
    }

    #[tokio::test]
    async fn test_greeting_is_spoken_and_remembered() {
        let (mut voice, speaker) = assistant(Arc::new(MockLlmService::new("mock")));
        voice.greet().await.unwrap();

        assert_eq!(speaker.spoken(), vec![GREETING.to_string()]);
        let roles: Vec<_> = voice.chat_ctx.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![ChatRole::System, ChatRole::Assistant]);
    }

    #[tokio::test]
    async fn test_final_transcript_runs_a_turn() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_text("Sure. What is the property address?");
        let (mut voice, speaker) = assistant(mock.clone());
        voice.greet().await.unwrap();

        let reply = voice
            .handle_transcript(Transcript::final_text("I want to write an offer"))
            .await
            .unwrap();

        assert_eq!(reply.as_deref(), Some("Sure. What is the property address?"));
        assert_eq!(speaker.spoken().len(), 2);
        assert_eq!(voice.chat_ctx.messages.len(), 4);

        let request = &mock.recorded_requests()[0];
        assert_eq!(request.system[1].text, VOICE_SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn test_session_keeps_turns_on_one_thread() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_text("Which property?");
        mock.queue_text("What is your offer?");
        let store = Arc::new(CheckpointStore::default());
        let graph = ConversationGraph::assistant(
            mock,
            "collect contract terms",
            Arc::new(ToolRegistry::empty()),
            Arc::clone(&store),
            DEFAULT_MAX_STEPS,
        )
        .unwrap();
        let thread = ThreadId::new("console");
        let mut voice = VoiceAssistant::new(GraphLlm::new(Arc::new(graph)), RecordingSpeaker::default())
            .with_session(thread.clone());

        voice.handle_transcript(Transcript::final_text("hello")).await.unwrap();
        voice.handle_transcript(Transcript::final_text("123 Main St")).await.unwrap();

        assert_eq!(store.len(), 1);
        let stored = store.snapshot(&thread).await.unwrap().conversation;
        assert_eq!(stored.len(), 5);
        assert_eq!(stored.last().unwrap().content, "What is your offer?");
    }

    #[tokio::test]
    async fn test_interim_transcripts_are_ignored() {
        let mock = Arc::new(MockLlmService::new("mock"));
        let (mut voice, _speaker) = assistant(mock.clone());

        let interim = Transcript {
            text: "I want".to_string(),
            is_final: false,
        };
        assert_eq!(voice.handle_transcript(interim).await.unwrap(), None);
        assert_eq!(
            voice.handle_transcript(Transcript::final_text("  ")).await.unwrap(),
            None
        );
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn test_run_survives_failed_turns() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_error(LlmError::network("connection reset"));
        mock.queue_text("Got it.");
        let (voice, speaker) = assistant(mock);

        let (tx, rx) = mpsc::channel(4);
        tx.send(Transcript::final_text("hello")).await.unwrap();
        tx.send(Transcript::final_text("123 Main St")).await.unwrap();
        drop(tx);

        voice.run(rx).await.unwrap();
        assert_eq!(speaker.spoken(), vec![GREETING.to_string(), "Got it.".to_string()]);
    }
}
