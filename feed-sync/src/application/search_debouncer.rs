use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use super::feed_sync::FeedSynchronizer;
use crate::data::post_repository::PostRepository;
use crate::domain::filter::normalize_query;
use crate::infrastructure::settings::SyncSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStream {
    Suggestions,
    FullSearch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub stream: SearchStream,
    pub query: String,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Debounced {
    /// Запрос уйдёт потребителю после окна тишины, если его не перебьют.
    Scheduled,
    /// Слишком короткий запрос подсказок: потребителю сразу ушёл пустой запрос.
    EmptySuggestions,
}

#[derive(Default)]
struct DebounceState {
    sequence: u64,
    pending: Option<JoinHandle<()>>,
}

/// Дебаунсер одного потока поисковых запросов.
///
/// Каждый новый ввод отменяет ещё не сработавшую отправку. Таймер держит отдельная
/// задача `tokio`, поэтому `on_query_changed` вызывается внутри рантайма.
/// Номер ввода, отложенная задача и сама отправка меняются под одним мютексом.
pub struct SearchDebouncer {
    stream: SearchStream,
    window: Duration,
    min_chars: usize,
    tx: mpsc::UnboundedSender<SearchRequest>,
    state: Arc<Mutex<DebounceState>>,
}

impl SearchDebouncer {
    pub fn new(
        stream: SearchStream,
        window: Duration,
        min_chars: usize,
        tx: mpsc::UnboundedSender<SearchRequest>,
    ) -> Self {
        Self {
            stream,
            window,
            min_chars,
            tx,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    pub fn suggestions(settings: &SyncSettings, tx: mpsc::UnboundedSender<SearchRequest>) -> Self {
        Self::new(
            SearchStream::Suggestions,
            settings.suggestion_debounce(),
            settings.suggestion_min_chars,
            tx,
        )
    }

    pub fn full_search(settings: &SyncSettings, tx: mpsc::UnboundedSender<SearchRequest>) -> Self {
        Self::new(
            SearchStream::FullSearch,
            settings.search_debounce(),
            settings.suggestion_min_chars,
            tx,
        )
    }

    pub fn stream(&self) -> SearchStream {
        self.stream
    }

    pub fn on_query_changed(&self, text: &str) -> Debounced {
        let mut state = lock(&self.state);
        state.sequence += 1;
        let sequence = state.sequence;
        if let Some(handle) = state.pending.take() {
            handle.abort();
        }

        let query = text.trim().to_string();
        if self.stream == SearchStream::Suggestions
            && normalize_query(&query).chars().count() < self.min_chars
        {
            debug!(sequence, "suggestion query too short, clearing suggestions");
            send(
                &self.tx,
                SearchRequest {
                    stream: self.stream,
                    query: String::new(),
                    sequence,
                },
            );
            return Debounced::EmptySuggestions;
        }

        let deadline = Instant::now() + self.window;
        let shared = self.state.clone();
        let tx = self.tx.clone();
        let stream = self.stream;
        state.pending = Some(tokio::spawn(async move {
            sleep_until(deadline).await;
            let state = lock(&shared);
            if state.sequence != sequence {
                return;
            }
            send(
                &tx,
                SearchRequest {
                    stream,
                    query,
                    sequence,
                },
            );
        }));
        Debounced::Scheduled
    }

    /// Отменяет отложенную отправку, если она ещё не ушла.
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        state.sequence += 1;
        if let Some(handle) = state.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for SearchDebouncer {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.state).pending.take() {
            handle.abort();
        }
    }
}

fn lock(state: &Mutex<DebounceState>) -> MutexGuard<'_, DebounceState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn send(tx: &mpsc::UnboundedSender<SearchRequest>, request: SearchRequest) {
    let sequence = request.sequence;
    if tx.send(request).is_err() {
        debug!(sequence, "search consumer gone, dropping query");
    }
}

/// Потребитель запросов: полный поиск идёт в `apply_search`, подсказки публикуются
/// в `suggestions`. Завершается, когда закрыты все отправители.
pub async fn run_search_dispatch<R: PostRepository>(
    feed: Arc<FeedSynchronizer<R>>,
    mut requests: mpsc::UnboundedReceiver<SearchRequest>,
    suggestions: watch::Sender<Vec<String>>,
) {
    while let Some(request) = requests.recv().await {
        match request.stream {
            SearchStream::FullSearch => {
                let visible = feed.apply_search(&request.query);
                debug!(
                    sequence = request.sequence,
                    visible = visible.len(),
                    "search applied"
                );
            }
            SearchStream::Suggestions => {
                suggestions.send_replace(feed.suggestions(&request.query));
            }
        }
    }
}
