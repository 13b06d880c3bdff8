use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::gemini;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu, MissingApiKeySnafu,
    ProviderConfig, ProviderError, ProviderResult, ProviderStreamHandle, ProviderWorker,
    ResponseProvider, Role, StreamEventMapped, StreamEventPayload, StreamRequest, StreamTarget,
    make_event_stream,
};

pub const RIG_GEMINI_PROVIDER_ID: &str = "gemini";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

type GeminiCompletionModel = gemini::completion::CompletionModel;
type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    <GeminiCompletionModel as CompletionModel>::StreamingResponse,
>;

pub struct RigProviderAdapter {
    config: ProviderConfig,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: RIG_GEMINI_PROVIDER_ID,
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<gemini::Client> {
        gemini::Client::builder()
            .api_key(config.api_key.as_str())
            .build()
            .context(HttpClientSnafu {
                stage: "build-client",
            })
    }

    fn to_rig_message(message: &super::provider::PromptMessage) -> RigMessage {
        match message.role {
            Role::User => RigMessage::user(message.content.clone()),
            Role::Assistant => RigMessage::assistant(message.content.clone()),
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());

        let mut messages = request
            .messages
            .iter()
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                target: request.target,
            }
            .fail();
        };

        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        target: StreamTarget,
        error: ProviderError,
    ) {
        let _ = event_tx.send(StreamEventMapped {
            target,
            payload: StreamEventPayload::Error(error.to_string()),
        });
    }

    fn map_stream_item<R>(
        target: StreamTarget,
        item: StreamedAssistantContent<R>,
    ) -> Option<StreamEventMapped>
    where
        R: Clone + Unpin,
    {
        let payload = match item {
            StreamedAssistantContent::Text(text) => StreamEventPayload::Delta(text.text),
            // Reasoning and tool-call chunks never belong in the reply text.
            StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => return None,
        };

        Some(StreamEventMapped { target, payload })
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target;
        let mut stream = match Self::open_stream(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, target, error);
                return;
            }
        };

        let mut cancelled = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    // Cancel the upstream Rig stream so provider IO stops promptly.
                    tracing::debug!(target = ?target, "provider stream cancelled");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(target, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(
                                target = ?target,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, target, error);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !cancelled && !stream_failed {
            let _ = event_tx.send(StreamEventMapped {
                target,
                payload: StreamEventPayload::Done,
            });
        }
    }
}

impl ResponseProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        RIG_GEMINI_PROVIDER_ID
    }

    fn default_model(&self) -> &str {
        self.config
            .default_model
            .as_deref()
            .unwrap_or(DEFAULT_GEMINI_MODEL)
    }

    fn stream_reply(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-reply",
                target: request.target,
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::PromptMessage;

    #[test]
    fn adapter_rejects_missing_api_key() {
        let config = ProviderConfig::new(RIG_GEMINI_PROVIDER_ID, "   ", None);
        assert!(matches!(
            RigProviderAdapter::new(config),
            Err(ProviderError::MissingApiKey { .. })
        ));
    }

    #[test]
    fn adapter_falls_back_to_default_model() {
        let adapter =
            RigProviderAdapter::new(ProviderConfig::new(RIG_GEMINI_PROVIDER_ID, "key", None))
                .expect("adapter");
        assert_eq!(adapter.default_model(), DEFAULT_GEMINI_MODEL);

        let adapter = RigProviderAdapter::new(ProviderConfig::new(
            RIG_GEMINI_PROVIDER_ID,
            "key",
            Some("gemini-1.5-pro".to_string()),
        ))
        .expect("adapter");
        assert_eq!(adapter.default_model(), "gemini-1.5-pro");
    }

    #[test]
    fn empty_request_is_rejected_before_any_io() {
        let adapter =
            RigProviderAdapter::new(ProviderConfig::new(RIG_GEMINI_PROVIDER_ID, "key", None))
                .expect("adapter");

        let request = StreamRequest::new(StreamTarget(1), DEFAULT_GEMINI_MODEL, Vec::new());
        assert!(matches!(
            adapter.stream_reply(request),
            Err(ProviderError::EmptyMessageSet { .. })
        ));
    }

    #[test]
    fn request_builder_keeps_prompt_last() {
        let request = StreamRequest::new(
            StreamTarget(2),
            DEFAULT_GEMINI_MODEL,
            vec![
                PromptMessage::new(Role::User, "earlier turn"),
                PromptMessage::new(Role::Assistant, "earlier reply"),
                PromptMessage::user("current prompt"),
            ],
        )
        .with_temperature(0.7)
        .with_max_tokens(2_048);

        assert_eq!(request.messages.last().map(|m| m.content.as_str()), Some("current prompt"));
        assert_eq!(request.temperature, Some(0.7));
        assert_eq!(request.max_tokens, Some(2_048));
    }
}
