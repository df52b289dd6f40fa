//! services/api/src/adapters/qa_llm.rs
//!
//! This module contains the adapter for the question-answering LLM.
//! It implements the `AnsweringService` port from the `core` crate.

const SYSTEM_INSTRUCTIONS: &str = r#"You are a helpful assistant answering questions about a document the user has uploaded.

The conversation so far is included, oldest first. Answer the user's latest question.

Citations:
- Whenever a statement comes from a specific page of the document, cite it inline with a marker of the form [p. N], where N is the page number.
- Use one marker per page; repeat markers only when you refer to a page again.
- Do not invent pages you have no basis for. If you cannot tell where something is, do not cite it.

Style:
- Be direct and concise. A few sentences or a short list is usually enough.
- If the question cannot be answered from the document, say so plainly."#;

const USER_INPUT_TEMPLATE: &str = r#"DOCUMENT: {filename} ({size} bytes)

QUESTION:
{question}"#;

/// Inline citation markers such as `[p. 3]`, `[p3]` or `[page 12]`.
const CITATION_MARKER: &str = r"(?i)\[\s*(?:p\.?|page)\s*(\d+)\s*\]";

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use doc_chat_core::{
    Answer, AnswerRequest, AnsweringService, Citation, Message, PortError, PortResult, Sender,
};
use regex::Regex;
use tracing::{debug, info};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `AnsweringService` using an OpenAI-compatible LLM.
#[derive(Clone)]
pub struct OpenAiAnsweringAdapter {
    client: Client<OpenAIConfig>,
    model: String,
    citation_marker: Regex,
}

impl OpenAiAnsweringAdapter {
    /// Creates a new `OpenAiAnsweringAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String) -> PortResult<Self> {
        let citation_marker =
            Regex::new(CITATION_MARKER).map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(Self {
            client,
            model,
            citation_marker,
        })
    }

    fn build_messages(request: &AnswerRequest) -> PortResult<Vec<ChatCompletionRequestMessage>> {
        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(SYSTEM_INSTRUCTIONS)
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
        ];

        for message in request.transcript.iter().filter(|m| is_conversational(m)) {
            let entry: ChatCompletionRequestMessage = match message.sender {
                Sender::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(message.body.clone())
                    .build()
                    .map_err(|e| PortError::Unexpected(e.to_string()))?
                    .into(),
                _ => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(message.body.clone())
                    .build()
                    .map_err(|e| PortError::Unexpected(e.to_string()))?
                    .into(),
            };
            messages.push(entry);
        }

        let user_input = USER_INPUT_TEMPLATE
            .replace("{filename}", &request.document.filename)
            .replace("{size}", &request.document.byte_size.to_string())
            .replace("{question}", &request.query);
        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_input)
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
        );
        Ok(messages)
    }
}

/// The welcome text and failed answers are not part of the exchange with the model.
fn is_conversational(message: &Message) -> bool {
    message.sender != Sender::System && !message.is_error
}

/// Splits a raw model reply into answer text and the pages it cites, in order of first mention.
pub fn parse_answer(raw: &str, citation_marker: &Regex) -> Answer {
    let mut citations: Vec<Citation> = Vec::new();
    for captures in citation_marker.captures_iter(raw) {
        let Some(page) = captures.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) else {
            continue;
        };
        if citations.iter().any(|c| c.target_page == page) {
            continue;
        }
        citations.push(Citation::new(page, format!("Page {page}")));
    }

    let stripped = citation_marker.replace_all(raw, "");
    let text = stripped
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
        .replace(" .", ".")
        .replace(" ,", ",")
        .trim()
        .to_string();

    Answer { text, citations }
}

//=========================================================================================
// `AnsweringService` Trait Implementation
//=========================================================================================

#[async_trait]
impl AnsweringService for OpenAiAnsweringAdapter {
    /// Answers a question about the referenced document, keeping the prior transcript as context.
    async fn answer(&self, request: AnswerRequest) -> PortResult<Answer> {
        debug!(
            "Answering '{}' about '{}' with {} prior message(s).",
            request.query,
            request.document.filename,
            request.transcript.len()
        );
        let messages = Self::build_messages(&request)?;

        let completion = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .n(1)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        // Call the API and manually map the error, which respects the orphan rule.
        let response = self
            .client
            .chat()
            .create(completion)
            .await
            .map_err(|e: OpenAIError| PortError::Unexpected(e.to_string()))?;

        let raw = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                PortError::Unexpected("Answering LLM returned no text content.".to_string())
            })?;

        let answer = parse_answer(&raw, &self.citation_marker);
        info!(
            "Answer generated with {} citation(s) for '{}'.",
            answer.citations.len(),
            request.document.filename
        );
        Ok(answer)
    }
}
