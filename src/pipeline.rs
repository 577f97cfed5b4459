//! Two-stage request chain: plan (model proposes a search) -> search and
//! extract -> answer (model writes the final response from the page text),
//! with content deltas relayed to the caller as they arrive.

use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::protocol::{ChatRequest, Message, PlanResponse, RelayEvent, Tool, ToolCall};
use crate::search::{fetch_pages, SearchBackend, SearchResult};
use crate::sse::{decode_line, LineReader, StreamEvent};
use crate::toolcall::PendingToolCall;
use crate::tools::{default_registry, ToolDefinition, WebSearchArgs};

const PLANNING_PROMPT: &str = "You are a helpful agent with the ability to access the internet \
via the tool provided to you. Use the webSearch tool to find relevant information for the \
user's query. If the query is about the current weather at a location, generate the query as \
\"Current weather at LOCATION weather.com ten day forecast\". Always generate 4 thoughtful \
related search queries that would help explore different aspects or angles of the topic.";

const ANSWER_WITH_SOURCES_PROMPT: &str = "You are a helpful agent that answers the user's \
question based on the web content. Provide a detailed answer for the query and always include \
the source url at the end as a hyperlink. The final output should be in formatted markdown and \
have nice formatting and spacing.";

const ANSWER_DIRECT_PROMPT: &str = "You are a helpful AI assistant. Answer the question to the \
best of your ability and think step-by-step for problems that require reasoning, math, or \
science. Your responses should be in markdown format and be formatted nicely.";

/// One user query plus the cancellation signal scoped to its run. All
/// per-run state (line buffer, pending tool call, message log) lives inside
/// the run itself; nothing is shared across requests.
pub struct PipelineRequest {
    pub query: String,
    pub cancel: CancellationToken,
}

impl PipelineRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self::with_cancel(query, CancellationToken::new())
    }

    pub fn with_cancel(query: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            query: query.into(),
            cancel,
        }
    }
}

/// Output of the planning stage: the message log so far, and the tool call
/// if the model committed to one.
pub struct Plan {
    pub messages: Vec<Message>,
    pub tool_call: Option<ToolCall>,
    pub content: String,
}

#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub answer: String,
    pub search_results: Vec<SearchResult>,
    pub related_searches: Vec<String>,
    pub tool_call: Option<ToolCall>,
}

struct TurnOutcome {
    content: String,
    tool_call: Option<ToolCall>,
}

pub struct Pipeline {
    client: reqwest::Client,
    config: ApiConfig,
    search: Arc<dyn SearchBackend>,
    tools: Vec<ToolDefinition>,
}

impl Pipeline {
    pub fn new(client: reqwest::Client, config: ApiConfig, search: Arc<dyn SearchBackend>) -> Self {
        Self {
            client,
            config,
            search,
            tools: default_registry(),
        }
    }

    /// Drive the full chain for one query, relaying events to `on_event`.
    /// Deltas already relayed before a failure are not retracted.
    pub async fn run<F, Fut>(
        &self,
        request: &PipelineRequest,
        mut on_event: F,
    ) -> Result<PipelineOutcome>
    where
        F: FnMut(RelayEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let plan = self.plan(request, &mut on_event).await?;

        let Some(tool_call) = plan.tool_call.clone() else {
            // The model chose not to search; whatever it streamed during
            // planning is the whole answer.
            tracing::info!("model answered without searching");
            return Ok(PipelineOutcome {
                answer: plan.content,
                tool_call: None,
                ..Default::default()
            });
        };

        if request.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let args = WebSearchArgs::parse(&tool_call.function.arguments)?;
        tracing::info!(query = %args.query, "executing web search");
        let results = self.search.search_results(&args.query).await?;
        on_event(RelayEvent::SearchResults {
            results: results.clone(),
        })
        .await;
        on_event(RelayEvent::RelatedSearches {
            queries: args.related_searches.clone(),
        })
        .await;

        let pages = fetch_pages(self.search.as_ref(), &results).await;

        let mut messages = plan.messages;
        messages.push(Message::assistant_tool_call(tool_call.clone()));
        messages.push(Message::tool_result(&tool_call, pages.join("\n\n")));

        let turn = self
            .chat_turn(&messages, None, &request.cancel, &mut |text| {
                on_event(RelayEvent::Content { content: text })
            })
            .await?;

        Ok(PipelineOutcome {
            answer: turn.content,
            search_results: results,
            related_searches: args.related_searches,
            tool_call: Some(tool_call),
        })
    }

    /// Planning stage: offer the tool registry and stream the response.
    /// Content deltas are relayed; a proposed tool call is accumulated.
    pub async fn plan<F, Fut>(&self, request: &PipelineRequest, on_event: &mut F) -> Result<Plan>
    where
        F: FnMut(RelayEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let tools: Vec<Tool> = self.tools.iter().map(|tool| tool.as_tool()).collect();
        let messages = vec![
            Message::system(PLANNING_PROMPT),
            Message::user(request.query.clone()),
        ];

        let turn = self
            .chat_turn(&messages, Some(tools), &request.cancel, &mut |text| {
                on_event(RelayEvent::Content { content: text })
            })
            .await?;

        if let Some(call) = &turn.tool_call {
            tracing::info!(id = %call.id, name = %call.function.name, "tool call proposed");
        }
        Ok(Plan {
            messages,
            tool_call: turn.tool_call,
            content: turn.content,
        })
    }

    /// Planning plus the search lookup, without fetching pages or
    /// answering. Backs the non-streaming `/api/results` endpoint.
    pub async fn plan_results(&self, request: &PipelineRequest) -> Result<PlanResponse> {
        let plan = self
            .plan(request, &mut |_: RelayEvent| std::future::ready(()))
            .await?;

        let Some(tool_call) = plan.tool_call else {
            return Ok(PlanResponse {
                search_results: Vec::new(),
                related_searches: Vec::new(),
                tool_call: None,
                original_query: request.query.clone(),
            });
        };

        let args = WebSearchArgs::parse(&tool_call.function.arguments)?;
        let search_results = self.search.search_results(&args.query).await?;
        Ok(PlanResponse {
            search_results,
            related_searches: args.related_searches,
            tool_call: Some(tool_call),
            original_query: request.query.clone(),
        })
    }

    /// Answering stage on its own, for a previously planned search. With a
    /// tool call and results, the page text is fed back as the tool
    /// message; otherwise the model answers directly.
    pub async fn answer<F, Fut>(
        &self,
        query: &str,
        tool_call: Option<&ToolCall>,
        search_results: &[SearchResult],
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<String>
    where
        F: FnMut(RelayEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let messages = match tool_call {
            Some(call) if !search_results.is_empty() => {
                let pages = fetch_pages(self.search.as_ref(), search_results).await;
                vec![
                    Message::system(ANSWER_WITH_SOURCES_PROMPT),
                    Message::user(query),
                    Message::assistant_tool_call(call.clone()),
                    Message::tool_result(call, pages.join("\n\n")),
                ]
            }
            _ => vec![Message::system(ANSWER_DIRECT_PROMPT), Message::user(query)],
        };

        let turn = self
            .chat_turn(&messages, None, cancel, &mut |text| {
                on_event(RelayEvent::Content { content: text })
            })
            .await?;
        Ok(turn.content)
    }

    /// One streamed model call: send the request, reassemble lines, decode
    /// deltas, relay content, and accumulate at most one tool call. The
    /// cancellation token is checked before the send and before every
    /// chunk read.
    async fn chat_turn<F, Fut>(
        &self,
        messages: &[Message],
        tools: Option<Vec<Tool>>,
        cancel: &CancellationToken,
        on_content: &mut F,
    ) -> Result<TurnOutcome>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        let body = ChatRequest::new(&self.config, messages.to_vec(), tools);
        let send = self
            .client
            .post(&self.config.base_url)
            .headers(self.config.api_headers())
            .json(&body)
            .send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = send => response?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api { status, body });
        }

        let mut stream = response.bytes_stream();
        let mut reader = LineReader::new();
        let mut pending = PendingToolCall::new();
        let mut content = String::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            for line in reader.push(&chunk) {
                for event in decode_line(&line) {
                    match event {
                        StreamEvent::Content(text) => {
                            content.push_str(&text);
                            on_content(text).await;
                        }
                        StreamEvent::ToolCall(fragment) => {
                            pending.ingest(&fragment);
                            // No end-of-arguments marker exists; completeness
                            // is re-checked on every fragment.
                            tracing::trace!(complete = pending.is_complete(), "tool call fragment");
                        }
                        StreamEvent::Done => {}
                    }
                }
            }
        }

        if let Some(line) = reader.finish() {
            for event in decode_line(&line) {
                match event {
                    StreamEvent::Content(text) => {
                        content.push_str(&text);
                        on_content(text).await;
                    }
                    StreamEvent::ToolCall(fragment) => pending.ingest(&fragment),
                    StreamEvent::Done => {}
                }
            }
        }

        Ok(TurnOutcome {
            content,
            tool_call: pending.into_call(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse_body(frames: &[String]) -> String {
        let mut body = String::new();
        for frame in frames {
            body.push_str("data: ");
            body.push_str(frame);
            body.push_str("\n\n");
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn content_frame(text: &str) -> String {
        json!({"choices": [{"delta": {"content": text}}]}).to_string()
    }

    fn tool_open_frame(id: &str, name: &str, arguments: &str) -> String {
        json!({"choices": [{"delta": {"tool_calls": [
            {"id": id, "function": {"name": name, "arguments": arguments}}
        ]}}]})
        .to_string()
    }

    fn tool_more_frame(arguments: &str) -> String {
        json!({"choices": [{"delta": {"tool_calls": [
            {"function": {"arguments": arguments}}
        ]}}]})
        .to_string()
    }

    struct FakeSearch {
        results: Vec<SearchResult>,
        searches: Mutex<Vec<String>>,
    }

    impl FakeSearch {
        fn with_results(results: Vec<SearchResult>) -> Arc<Self> {
            Arc::new(Self {
                results,
                searches: Mutex::new(Vec::new()),
            })
        }

        fn empty() -> Arc<Self> {
            Self::with_results(Vec::new())
        }
    }

    #[async_trait]
    impl SearchBackend for FakeSearch {
        async fn search_results(&self, query: &str) -> Result<Vec<SearchResult>> {
            self.searches.lock().unwrap().push(query.to_string());
            if self.results.is_empty() {
                return Err(Error::NoResults {
                    query: query.to_string(),
                });
            }
            Ok(self.results.clone())
        }

        async fn fetch_page(&self, result: &SearchResult) -> Result<String> {
            Ok(format!("### Source URL: {}\n\npage text", result.url))
        }
    }

    fn result(url: &str) -> SearchResult {
        SearchResult {
            url: url.to_string(),
            title: "title".to_string(),
            favicon: String::new(),
        }
    }

    fn pipeline(server: &MockServer, search: Arc<FakeSearch>) -> Pipeline {
        let config = ApiConfig::new("test-key".to_string())
            .with_base_url(format!("{}/chat", server.uri()));
        Pipeline::new(reqwest::Client::new(), config, search)
    }

    fn sink(events: &mut Vec<RelayEvent>) -> impl FnMut(RelayEvent) -> std::future::Ready<()> + '_ {
        |event| {
            events.push(event);
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn planning_without_tool_call_ends_with_empty_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse_body(&[content_frame("Hello"), content_frame(" world")]),
                "text/event-stream",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let search = FakeSearch::with_results(vec![result("https://example.com")]);
        let pipeline = pipeline(&server, search.clone());
        let request = PipelineRequest::new("hi");

        let mut events = Vec::new();
        let outcome = pipeline.run(&request, sink(&mut events)).await.unwrap();

        assert_eq!(outcome.answer, "Hello world");
        assert!(outcome.search_results.is_empty());
        assert!(outcome.related_searches.is_empty());
        assert!(outcome.tool_call.is_none());
        assert_eq!(
            events,
            vec![
                RelayEvent::Content {
                    content: "Hello".to_string()
                },
                RelayEvent::Content {
                    content: " world".to_string()
                },
            ]
        );
        // The extraction boundary is never consulted.
        assert!(search.searches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_committed_arguments_fail_the_run() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse_body(&[tool_open_frame("call_1", "webSearch", "{oops")]),
                "text/event-stream",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let search = FakeSearch::with_results(vec![result("https://example.com")]);
        let pipeline = pipeline(&server, search.clone());

        let err = pipeline
            .run(&PipelineRequest::new("hi"), |_| std::future::ready(()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolArguments { .. }));
        assert!(search.searches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_search_results_fail_before_any_answer_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse_body(&[tool_open_frame(
                    "call_1",
                    "webSearch",
                    r#"{"query":"x","relatedSearches":["a","b","c","d"]}"#,
                )]),
                "text/event-stream",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let pipeline = pipeline(&server, FakeSearch::empty());
        let err = pipeline
            .run(&PipelineRequest::new("hi"), |_| std::future::ready(()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoResults { .. }));
    }

    #[tokio::test]
    async fn full_run_searches_fetches_and_relays_the_answer() {
        let server = MockServer::start().await;

        // Planning call: the only request carrying tool definitions.
        Mock::given(method("POST"))
            .and(path("/chat"))
            .and(body_string_contains("\"tools\""))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse_body(&[
                    tool_open_frame(
                        "call_1",
                        "webSearch",
                        "{\"query\":\"Current weather at Tokyo weather.com ten day forecast\",",
                    ),
                    tool_more_frame(
                        "\"relatedSearches\":[\"Tokyo humidity\",\"Tokyo forecast map\",\"Tokyo rain radar\",\"Tokyo climate\"]}",
                    ),
                ]),
                "text/event-stream",
            ))
            .expect(1)
            .mount(&server)
            .await;

        // Answering call: carries the tool message with the page text.
        Mock::given(method("POST"))
            .and(path("/chat"))
            .and(body_string_contains("\"role\":\"tool\""))
            .and(body_string_contains("Source URL"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse_body(&[content_frame("It is "), content_frame("sunny.")]),
                "text/event-stream",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let search = FakeSearch::with_results(vec![result("https://weather.example/tokyo")]);
        let pipeline = pipeline(&server, search.clone());

        let mut events = Vec::new();
        let outcome = pipeline
            .run(&PipelineRequest::new("weather in Tokyo"), sink(&mut events))
            .await
            .unwrap();

        assert_eq!(outcome.answer, "It is sunny.");
        assert_eq!(outcome.related_searches.len(), 4);
        assert_eq!(outcome.search_results, vec![result("https://weather.example/tokyo")]);
        assert_eq!(
            outcome.tool_call.as_ref().map(|c| c.id.as_str()),
            Some("call_1")
        );
        assert_eq!(
            *search.searches.lock().unwrap(),
            vec!["Current weather at Tokyo weather.com ten day forecast"]
        );

        // Search results and related searches are relayed before the answer.
        assert!(matches!(events[0], RelayEvent::SearchResults { .. }));
        assert!(matches!(events[1], RelayEvent::RelatedSearches { .. }));
        assert_eq!(
            events[2..],
            [
                RelayEvent::Content {
                    content: "It is ".to_string()
                },
                RelayEvent::Content {
                    content: "sunny.".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn cancellation_mid_planning_stops_promptly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(
                        sse_body(&[content_frame("slow")]),
                        "text/event-stream",
                    )
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let pipeline = pipeline(&server, FakeSearch::empty());
        let request = PipelineRequest::new("hi");
        let cancel = request.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let err = pipeline
            .run(&request, |_| std::future::ready(()))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn plan_results_returns_the_planning_summary() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse_body(&[tool_open_frame(
                    "call_7",
                    "webSearch",
                    r#"{"query":"rust 2024 edition","relatedSearches":["a","b","c","d"]}"#,
                )]),
                "text/event-stream",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let search = FakeSearch::with_results(vec![
            result("https://example.com/1"),
            result("https://example.com/2"),
        ]);
        let pipeline = pipeline(&server, search);

        let response = pipeline
            .plan_results(&PipelineRequest::new("what is the rust 2024 edition"))
            .await
            .unwrap();
        assert_eq!(response.search_results.len(), 2);
        assert_eq!(response.related_searches, vec!["a", "b", "c", "d"]);
        assert_eq!(response.tool_call.unwrap().id, "call_7");
        assert_eq!(response.original_query, "what is the rust 2024 edition");
    }

    #[tokio::test]
    async fn answer_without_a_tool_call_asks_the_model_directly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .and(body_string_contains("helpful AI assistant"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse_body(&[content_frame("42")]),
                "text/event-stream",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let pipeline = pipeline(&server, FakeSearch::empty());
        let answer = pipeline
            .answer(
                "meaning of life?",
                None,
                &[],
                &CancellationToken::new(),
                |_| std::future::ready(()),
            )
            .await
            .unwrap();
        assert_eq!(answer, "42");
    }
}
