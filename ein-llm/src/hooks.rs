//! Lifecycle event listeners.
//!
//! Listeners are observers: they are told about model, chain, tool and agent
//! events and may log them, but nothing they do can change the outcome of the
//! operation being observed. A listener that panics is logged and skipped.

use std::error::Error as StdError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

// ── Event payloads ────────────────────────────────────────────────────────

/// Identifies the component that emitted an event.
#[derive(Debug, Clone, Serialize)]
pub struct Component {
    pub name: String,
}

impl Component {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Completed model call.
#[derive(Debug, Clone, Serialize)]
pub struct LlmResult {
    pub generations: Vec<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentAction {
    pub tool: String,
    pub tool_input: String,
    pub log: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentFinish {
    pub output: serde_json::Value,
    pub log: String,
}

// ── Listener interface ────────────────────────────────────────────────────

/// One method per lifecycle event. Implementations are registered explicitly
/// with a [`CallbackManager`].
pub trait EventListener: Send + Sync {
    /// Skip llm events.
    fn ignore_llm(&self) -> bool;
    /// Skip chain events.
    fn ignore_chain(&self) -> bool;
    /// Skip agent and tool events.
    fn ignore_agent(&self) -> bool;
    /// Receive events even when the manager is not verbose.
    fn always_verbose(&self) -> bool;

    fn on_llm_start(&self, component: &Component, prompts: &[String]);
    fn on_llm_new_token(&self, token: &str);
    fn on_llm_end(&self, result: &LlmResult);
    fn on_llm_error(&self, error: &dyn StdError);

    fn on_chain_start(&self, component: &Component, inputs: &serde_json::Value);
    fn on_chain_end(&self, outputs: &serde_json::Value);
    fn on_chain_error(&self, error: &dyn StdError);

    fn on_tool_start(&self, component: &Component, input: &str);
    fn on_tool_end(&self, output: &str, observation_prefix: Option<&str>, llm_prefix: Option<&str>);
    fn on_tool_error(&self, error: &dyn StdError);

    fn on_agent_action(&self, action: &AgentAction);
    fn on_agent_finish(&self, finish: &AgentFinish);
    fn on_text(&self, text: &str);
}

#[derive(Debug, Clone, Copy)]
enum Category {
    Llm,
    Chain,
    Agent,
    Text,
}

impl Category {
    fn ignored_by(self, listener: &dyn EventListener) -> bool {
        match self {
            Self::Llm => listener.ignore_llm(),
            Self::Chain => listener.ignore_chain(),
            Self::Agent => listener.ignore_agent(),
            Self::Text => false,
        }
    }
}

// ── Callback manager ──────────────────────────────────────────────────────

/// Fans events out to registered listeners.
pub struct CallbackManager {
    listeners: Vec<Arc<dyn EventListener>>,
    verbose: bool,
}

impl Default for CallbackManager {
    fn default() -> Self {
        Self::new(false)
    }
}

impl CallbackManager {
    pub fn new(verbose: bool) -> Self {
        Self {
            listeners: Vec::new(),
            verbose,
        }
    }

    /// Manager with a single [`LoggingListener`] registered.
    pub fn with_logging(verbose: bool) -> Self {
        let mut manager = Self::new(verbose);
        manager.register(Arc::new(LoggingListener));
        manager
    }

    pub fn register(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn dispatch(&self, event: &'static str, category: Category, notify: impl Fn(&dyn EventListener)) {
        for listener in &self.listeners {
            let listener = listener.as_ref();
            if category.ignored_by(listener) {
                continue;
            }
            if !self.verbose && !listener.always_verbose() {
                continue;
            }
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| notify(listener))) {
                tracing::warn!(event, "Event listener panicked: {}", panic_message(panic.as_ref()));
            }
        }
    }

    pub fn on_llm_start(&self, component: &Component, prompts: &[String]) {
        self.dispatch("on_llm_start", Category::Llm, |l| l.on_llm_start(component, prompts));
    }

    pub fn on_llm_new_token(&self, token: &str) {
        self.dispatch("on_llm_new_token", Category::Llm, |l| l.on_llm_new_token(token));
    }

    pub fn on_llm_end(&self, result: &LlmResult) {
        self.dispatch("on_llm_end", Category::Llm, |l| l.on_llm_end(result));
    }

    pub fn on_llm_error(&self, error: &dyn StdError) {
        self.dispatch("on_llm_error", Category::Llm, |l| l.on_llm_error(error));
    }

    pub fn on_chain_start(&self, component: &Component, inputs: &serde_json::Value) {
        self.dispatch("on_chain_start", Category::Chain, |l| l.on_chain_start(component, inputs));
    }

    pub fn on_chain_end(&self, outputs: &serde_json::Value) {
        self.dispatch("on_chain_end", Category::Chain, |l| l.on_chain_end(outputs));
    }

    pub fn on_chain_error(&self, error: &dyn StdError) {
        self.dispatch("on_chain_error", Category::Chain, |l| l.on_chain_error(error));
    }

    pub fn on_tool_start(&self, component: &Component, input: &str) {
        self.dispatch("on_tool_start", Category::Agent, |l| l.on_tool_start(component, input));
    }

    pub fn on_tool_end(&self, output: &str, observation_prefix: Option<&str>, llm_prefix: Option<&str>) {
        self.dispatch("on_tool_end", Category::Agent, |l| {
            l.on_tool_end(output, observation_prefix, llm_prefix)
        });
    }

    pub fn on_tool_error(&self, error: &dyn StdError) {
        self.dispatch("on_tool_error", Category::Agent, |l| l.on_tool_error(error));
    }

    pub fn on_agent_action(&self, action: &AgentAction) {
        self.dispatch("on_agent_action", Category::Agent, |l| l.on_agent_action(action));
    }

    pub fn on_agent_finish(&self, finish: &AgentFinish) {
        self.dispatch("on_agent_finish", Category::Agent, |l| l.on_agent_finish(finish));
    }

    pub fn on_text(&self, text: &str) {
        self.dispatch("on_text", Category::Text, |l| l.on_text(text));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ── Logging listener ──────────────────────────────────────────────────────

/// Logs every event through `tracing`.
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn ignore_llm(&self) -> bool {
        false
    }

    fn ignore_chain(&self) -> bool {
        false
    }

    fn ignore_agent(&self) -> bool {
        false
    }

    fn always_verbose(&self) -> bool {
        true
    }

    fn on_llm_start(&self, component: &Component, prompts: &[String]) {
        let prompts = serde_json::to_string(prompts).unwrap_or_default();
        tracing::debug!(component = %component.name, %prompts, "on_llm_start");
    }

    fn on_llm_new_token(&self, token: &str) {
        tracing::trace!(token, "on_llm_new_token");
    }

    fn on_llm_end(&self, result: &LlmResult) {
        tracing::debug!(
            prompt_tokens = result.prompt_tokens,
            completion_tokens = result.completion_tokens,
            "on_llm_end"
        );
    }

    fn on_llm_error(&self, error: &dyn StdError) {
        tracing::error!("on_llm_error error={}", error);
    }

    fn on_chain_start(&self, component: &Component, _inputs: &serde_json::Value) {
        tracing::info!("Entering new {} chain...", component.name);
    }

    fn on_chain_end(&self, _outputs: &serde_json::Value) {
        tracing::info!("Finished chain.");
    }

    fn on_chain_error(&self, error: &dyn StdError) {
        tracing::error!("on_chain_error error={}", error);
    }

    fn on_tool_start(&self, component: &Component, input: &str) {
        tracing::debug!(tool = %component.name, input, "on_tool_start");
    }

    fn on_tool_end(&self, output: &str, observation_prefix: Option<&str>, llm_prefix: Option<&str>) {
        tracing::info!(
            "{}\n{}\n{}",
            observation_prefix.unwrap_or_default(),
            output,
            llm_prefix.unwrap_or_default()
        );
    }

    fn on_tool_error(&self, error: &dyn StdError) {
        tracing::error!("on_tool_error error={}", error);
    }

    fn on_agent_action(&self, action: &AgentAction) {
        tracing::info!(tool = %action.tool, "{}", action.log);
    }

    fn on_agent_finish(&self, finish: &AgentFinish) {
        tracing::info!("{}", finish.log);
    }

    fn on_text(&self, text: &str) {
        tracing::info!("{}", text);
    }
}

// ── Counting listener ─────────────────────────────────────────────────────

/// Tallies events. Handy for diagnostics and for asserting in tests that the
/// expected hooks fired.
#[derive(Default)]
pub struct CountingListener {
    ignore_llm: bool,
    ignore_chain: bool,
    ignore_agent: bool,
    always_verbose: bool,
    starts: AtomicU64,
    ends: AtomicU64,
    errors: AtomicU64,
    text: AtomicU64,
    llm_starts: AtomicU64,
    llm_ends: AtomicU64,
    llm_streams: AtomicU64,
    chain_starts: AtomicU64,
    chain_ends: AtomicU64,
    tool_starts: AtomicU64,
    tool_ends: AtomicU64,
    agent_actions: AtomicU64,
    agent_ends: AtomicU64,
}

/// Point-in-time copy of a [`CountingListener`]'s counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub starts: u64,
    pub ends: u64,
    pub errors: u64,
    pub text: u64,
    pub llm_starts: u64,
    pub llm_ends: u64,
    pub llm_streams: u64,
    pub chain_starts: u64,
    pub chain_ends: u64,
    pub tool_starts: u64,
    pub tool_ends: u64,
    pub agent_actions: u64,
    pub agent_ends: u64,
}

impl CountingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ignoring_llm(mut self) -> Self {
        self.ignore_llm = true;
        self
    }

    pub fn ignoring_chain(mut self) -> Self {
        self.ignore_chain = true;
        self
    }

    pub fn ignoring_agent(mut self) -> Self {
        self.ignore_agent = true;
        self
    }

    pub fn always_verbose(mut self) -> Self {
        self.always_verbose = true;
        self
    }

    pub fn counts(&self) -> EventCounts {
        let get = |c: &AtomicU64| c.load(Ordering::SeqCst);
        EventCounts {
            starts: get(&self.starts),
            ends: get(&self.ends),
            errors: get(&self.errors),
            text: get(&self.text),
            llm_starts: get(&self.llm_starts),
            llm_ends: get(&self.llm_ends),
            llm_streams: get(&self.llm_streams),
            chain_starts: get(&self.chain_starts),
            chain_ends: get(&self.chain_ends),
            tool_starts: get(&self.tool_starts),
            tool_ends: get(&self.tool_ends),
            agent_actions: get(&self.agent_actions),
            agent_ends: get(&self.agent_ends),
        }
    }

    fn bump(&self, counters: &[&AtomicU64]) {
        for c in counters {
            c.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl EventListener for CountingListener {
    fn ignore_llm(&self) -> bool {
        self.ignore_llm
    }

    fn ignore_chain(&self) -> bool {
        self.ignore_chain
    }

    fn ignore_agent(&self) -> bool {
        self.ignore_agent
    }

    fn always_verbose(&self) -> bool {
        self.always_verbose
    }

    fn on_llm_start(&self, _component: &Component, _prompts: &[String]) {
        self.bump(&[&self.starts, &self.llm_starts]);
    }

    fn on_llm_new_token(&self, _token: &str) {
        self.bump(&[&self.llm_streams]);
    }

    fn on_llm_end(&self, _result: &LlmResult) {
        self.bump(&[&self.ends, &self.llm_ends]);
    }

    fn on_llm_error(&self, _error: &dyn StdError) {
        self.bump(&[&self.errors]);
    }

    fn on_chain_start(&self, _component: &Component, _inputs: &serde_json::Value) {
        self.bump(&[&self.starts, &self.chain_starts]);
    }

    fn on_chain_end(&self, _outputs: &serde_json::Value) {
        self.bump(&[&self.ends, &self.chain_ends]);
    }

    fn on_chain_error(&self, _error: &dyn StdError) {
        self.bump(&[&self.errors]);
    }

    fn on_tool_start(&self, _component: &Component, _input: &str) {
        self.bump(&[&self.starts, &self.tool_starts]);
    }

    fn on_tool_end(&self, _output: &str, _observation_prefix: Option<&str>, _llm_prefix: Option<&str>) {
        self.bump(&[&self.ends, &self.tool_ends]);
    }

    fn on_tool_error(&self, _error: &dyn StdError) {
        self.bump(&[&self.errors]);
    }

    fn on_agent_action(&self, _action: &AgentAction) {
        self.bump(&[&self.starts, &self.agent_actions]);
    }

    fn on_agent_finish(&self, _finish: &AgentFinish) {
        self.bump(&[&self.ends, &self.agent_ends]);
    }

    fn on_text(&self, _text: &str) {
        self.bump(&[&self.text]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    struct PanickingListener;

    impl EventListener for PanickingListener {
        fn ignore_llm(&self) -> bool {
            false
        }
        fn ignore_chain(&self) -> bool {
            false
        }
        fn ignore_agent(&self) -> bool {
            false
        }
        fn always_verbose(&self) -> bool {
            true
        }
        fn on_llm_start(&self, _: &Component, _: &[String]) {
            panic!("listener bug");
        }
        fn on_llm_new_token(&self, _: &str) {}
        fn on_llm_end(&self, _: &LlmResult) {}
        fn on_llm_error(&self, _: &dyn StdError) {}
        fn on_chain_start(&self, _: &Component, _: &serde_json::Value) {}
        fn on_chain_end(&self, _: &serde_json::Value) {}
        fn on_chain_error(&self, _: &dyn StdError) {}
        fn on_tool_start(&self, _: &Component, _: &str) {}
        fn on_tool_end(&self, _: &str, _: Option<&str>, _: Option<&str>) {}
        fn on_tool_error(&self, _: &dyn StdError) {}
        fn on_agent_action(&self, _: &AgentAction) {}
        fn on_agent_finish(&self, _: &AgentFinish) {}
        fn on_text(&self, _: &str) {}
    }

    fn sample_result() -> LlmResult {
        LlmResult {
            generations: vec!["4".into()],
            prompt_tokens: 3,
            completion_tokens: 1,
        }
    }

    #[test]
    fn verbose_manager_reaches_every_listener() {
        let counter = Arc::new(CountingListener::new());
        let mut manager = CallbackManager::new(true);
        manager.register(counter.clone());

        manager.on_llm_start(&Component::named("echo"), &["hi".into()]);
        manager.on_llm_new_token("h");
        manager.on_llm_end(&sample_result());
        manager.on_chain_start(&Component::named("chat"), &serde_json::json!({"question": "hi"}));
        manager.on_chain_end(&serde_json::json!({"answer": "h"}));
        manager.on_text("note");

        let counts = counter.counts();
        assert_eq!(counts.llm_starts, 1);
        assert_eq!(counts.llm_streams, 1);
        assert_eq!(counts.llm_ends, 1);
        assert_eq!(counts.chain_starts, 1);
        assert_eq!(counts.chain_ends, 1);
        assert_eq!(counts.starts, 2);
        assert_eq!(counts.ends, 2);
        assert_eq!(counts.text, 1);
    }

    #[test]
    fn quiet_manager_only_reaches_always_verbose_listeners() {
        let quiet = Arc::new(CountingListener::new());
        let loud = Arc::new(CountingListener::new().always_verbose());
        let mut manager = CallbackManager::new(false);
        manager.register(quiet.clone());
        manager.register(loud.clone());

        manager.on_llm_start(&Component::named("echo"), &[]);

        assert_eq!(quiet.counts().llm_starts, 0);
        assert_eq!(loud.counts().llm_starts, 1);
    }

    #[test]
    fn ignore_flags_filter_by_category() {
        let no_llm = Arc::new(CountingListener::new().ignoring_llm());
        let no_chain = Arc::new(CountingListener::new().ignoring_chain());
        let no_agent = Arc::new(CountingListener::new().ignoring_agent());
        let mut manager = CallbackManager::new(true);
        manager.register(no_llm.clone());
        manager.register(no_chain.clone());
        manager.register(no_agent.clone());

        manager.on_llm_end(&sample_result());
        manager.on_chain_end(&serde_json::Value::Null);
        manager.on_tool_start(&Component::named("search"), "rust");
        manager.on_tool_end("results", Some("Observation:"), Some("Thought:"));
        manager.on_agent_finish(&AgentFinish {
            output: serde_json::json!("done"),
            log: "done".into(),
        });

        assert_eq!(no_llm.counts().llm_ends, 0);
        assert_eq!(no_llm.counts().chain_ends, 1);
        assert_eq!(no_chain.counts().chain_ends, 0);
        assert_eq!(no_chain.counts().tool_starts, 1);
        assert_eq!(no_agent.counts().tool_starts, 0);
        assert_eq!(no_agent.counts().tool_ends, 0);
        assert_eq!(no_agent.counts().agent_ends, 0);
        assert_eq!(no_agent.counts().llm_ends, 1);
    }

    #[test]
    fn agent_decisions_are_counted() {
        let counter = Arc::new(CountingListener::new());
        let mut manager = CallbackManager::new(true);
        manager.register(counter.clone());

        manager.on_agent_action(&AgentAction {
            tool: "search".into(),
            tool_input: "rust".into(),
            log: "looking it up".into(),
        });
        manager.on_agent_finish(&AgentFinish {
            output: serde_json::json!("done"),
            log: "done".into(),
        });

        let counts = counter.counts();
        assert_eq!(counts.agent_actions, 1);
        assert_eq!(counts.agent_ends, 1);
        assert_eq!(counts.starts, 1);
        assert_eq!(counts.ends, 1);
    }

    #[test]
    fn errors_are_counted_per_event() {
        let counter = Arc::new(CountingListener::new());
        let mut manager = CallbackManager::new(true);
        manager.register(counter.clone());

        let err = EngineError::Inference("out of memory".into());
        manager.on_llm_error(&err);
        manager.on_chain_error(&err);
        manager.on_tool_error(&err);

        assert_eq!(counter.counts().errors, 3);
    }

    #[test]
    fn panicking_listener_does_not_stop_dispatch() {
        let counter = Arc::new(CountingListener::new());
        let mut manager = CallbackManager::new(true);
        manager.register(Arc::new(PanickingListener));
        manager.register(counter.clone());

        manager.on_llm_start(&Component::named("echo"), &["q".into()]);

        assert_eq!(counter.counts().llm_starts, 1);
    }

    #[test]
    fn logging_listener_handles_every_event() {
        let manager = CallbackManager::with_logging(false);
        assert_eq!(manager.len(), 1);

        manager.on_llm_start(&Component::named("llama"), &["Question: hi".into()]);
        manager.on_llm_new_token("tok");
        manager.on_llm_end(&sample_result());
        manager.on_agent_action(&AgentAction {
            tool: "search".into(),
            tool_input: "rust".into(),
            log: "searching".into(),
        });
        manager.on_text("hello");
    }
}
