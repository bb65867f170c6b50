//! One collection cycle: compile, filter, fetch and normalize in parallel,
//! assemble, then apply data actions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{Notify, OnceCell};

use crate::actions::{process_actions, DataAction};
use crate::config::CollectorConfig;
use crate::declaration::{tag_collections, Declaration};
use crate::error::LoadError;
use crate::filter::StatsFilterCache;
use crate::loader::{request_key, EndpointLoader};
use crate::normalize::{event as parse_event, normalize};
use crate::property::CompiledProperty;
use crate::scheduler::{Done, HandlerFuture, TaskInfo, TaskQueue};
use crate::tagging::TagScope;
use crate::types::{CollectionError, CollectionOutput, Context, Definitions, ErrorStage};

/// Cooperative stop request shared between a collector and its owner.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

type Outcome = Result<Value, CollectionError>;

/// Fetches endpoints for one cycle, sharing responses between properties
/// that read the same endpoint.
struct Fetcher {
    loader: Arc<dyn EndpointLoader>,
    timeout: Duration,
    responses: DashMap<String, Arc<OnceCell<Result<Value, LoadError>>>>,
}

impl Fetcher {
    async fn fetch(&self, endpoint: &str, key_args: Option<&Value>) -> Result<Value, LoadError> {
        let cell = self
            .responses
            .entry(request_key(endpoint, key_args))
            .or_default()
            .value()
            .clone();
        cell.get_or_init(|| async {
            let started = Instant::now();
            let result = tokio::time::timeout(self.timeout, self.loader.load_endpoint(endpoint, key_args))
                .await
                .unwrap_or_else(|_| Err(LoadError::Timeout(endpoint.to_string())));
            tracing::debug!("fetched '{endpoint}' in {:?}", started.elapsed());
            result.map(ensure_items)
        })
        .await
        .clone()
    }

    async fn run(&self, property: &CompiledProperty) -> Outcome {
        let raw = self
            .fetch(property.endpoint(), property.descriptor.key_args.as_ref())
            .await
            .map_err(|e| CollectionError::new(&property.name, ErrorStage::Fetch, e))?;
        normalize(raw, &property.pipeline)
            .map_err(|e| CollectionError::new(&property.name, ErrorStage::Transform, e))
    }
}

/// An empty collection comes back as `{kind, selfLink}` with no `items`;
/// give it an empty list so item-oriented steps behave the same either way.
fn ensure_items(mut response: Value) -> Value {
    if let Value::Object(map) = &mut response {
        let is_state = map
            .get("kind")
            .and_then(Value::as_str)
            .is_some_and(|kind| kind.ends_with("state"));
        if is_state && map.len() == 2 && !map.contains_key("items") {
            map.insert("items".to_string(), Value::Array(Vec::new()));
        }
    }
    response
}

struct Job {
    index: usize,
    property: Arc<CompiledProperty>,
}

/// Runs collection cycles against an endpoint loader.
pub struct Collector {
    loader: Arc<dyn EndpointLoader>,
    config: CollectorConfig,
    filter_cache: StatsFilterCache,
    stop: Arc<StopSignal>,
}

impl Collector {
    pub fn new(loader: Arc<dyn EndpointLoader>, config: CollectorConfig) -> Self {
        Self {
            loader,
            config,
            filter_cache: StatsFilterCache::new(),
            stop: Arc::new(StopSignal::default()),
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn filter_cache(&self) -> &StatsFilterCache {
        &self.filter_cache
    }

    pub fn stop_signal(&self) -> Arc<StopSignal> {
        Arc::clone(&self.stop)
    }

    /// Run one collection cycle. Failures are reported per property in the
    /// output; the cycle itself always completes.
    pub async fn collect(&self, declaration: &Declaration, context: &Context) -> CollectionOutput {
        let started = Instant::now();
        let (properties, mut errors) = declaration.compile(context);
        let survivors = self
            .filter_cache
            .get_or_compute(&properties, &declaration.actions, &declaration.filter);
        let selected: Vec<Arc<CompiledProperty>> = properties
            .into_iter()
            .filter(|p| survivors.contains(&p.name))
            .map(Arc::new)
            .collect();

        let results: Arc<Mutex<Vec<Option<Outcome>>>> = Arc::new(Mutex::new(vec![None; selected.len()]));
        let fetcher = Arc::new(Fetcher {
            loader: Arc::clone(&self.loader),
            timeout: self.config.fetch_timeout,
            responses: DashMap::new(),
        });

        let handler = {
            let results = Arc::clone(&results);
            move |job: Job, done: Done, _info: TaskInfo| -> HandlerFuture {
                let results = Arc::clone(&results);
                let fetcher = Arc::clone(&fetcher);
                Box::pin(async move {
                    let outcome = fetcher.run(&job.property).await;
                    let mut slots = results.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(slot) = slots.get_mut(job.index) {
                        *slot = Some(outcome);
                    }
                    drop(slots);
                    done.done();
                    Ok(())
                })
            }
        };
        let queue = TaskQueue::new(self.config.queue_config(), handler);

        let mut unscheduled: Option<(usize, String)> = None;
        for (index, property) in selected.iter().enumerate() {
            if self.stop.is_stopped() {
                unscheduled = Some((index, "collection stopped before scheduling".to_string()));
                break;
            }
            let job = Job {
                index,
                property: Arc::clone(property),
            };
            if let Err(e) = queue.push(job) {
                tracing::warn!("stopped scheduling at '{}': {e}", property.name);
                unscheduled = Some((index, e.to_string()));
                break;
            }
        }

        tokio::select! {
            _ = queue.drain() => {}
            _ = self.stop.stopped() => {
                tracing::info!("stop requested, waiting for in-flight properties");
                queue.stop().await;
            }
        }

        let mut outcomes = std::mem::take(&mut *results.lock().unwrap_or_else(|e| e.into_inner()));
        let mut stats = Map::new();
        for (index, property) in selected.iter().enumerate() {
            match outcomes.get_mut(index).and_then(Option::take) {
                Some(Ok(value)) => insert_stat(&mut stats, property, value),
                Some(Err(error)) => {
                    tracing::warn!("property '{}' failed: {}", property.name, error.message);
                    if property.is_custom() && error.stage == ErrorStage::Fetch {
                        insert_stat(&mut stats, property, Value::Object(Map::new()));
                    }
                    errors.push(error);
                }
                None => {
                    let reason = match &unscheduled {
                        Some((first, reason)) if index >= *first => reason.clone(),
                        _ => "collection stopped before the property ran".to_string(),
                    };
                    errors.push(CollectionError::new(&property.name, ErrorStage::Scheduling, reason));
                }
            }
        }

        let scope = TagScope::Poller(tag_collections(selected.iter().map(Arc::as_ref)));
        let mut output = Value::Object(stats);
        process_actions(&mut output, &declaration.actions, &scope, &declaration.definitions);
        let stats = match output {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        tracing::info!(
            "collection finished in {:?}: {} stats, {} errors",
            started.elapsed(),
            stats.len(),
            errors.len()
        );
        CollectionOutput { stats, errors }
    }
}

fn insert_stat(stats: &mut Map<String, Value>, property: &CompiledProperty, value: Value) {
    let Some(parent) = property.parent_key() else {
        stats.insert(property.name.clone(), value);
        return;
    };
    let entry = stats
        .entry(parent.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    match entry {
        Value::Object(group) => {
            group.insert(property.name.clone(), value);
        }
        other => {
            tracing::warn!("'{parent}' is not an object, replacing it to hold '{}'", property.name);
            let mut group = Map::new();
            group.insert(property.name.clone(), value);
            *other = Value::Object(group);
        }
    }
}

/// Parse one event line and apply data actions to it.
pub fn process_event(raw: &str, actions: &[DataAction], definitions: &Definitions) -> Value {
    let mut event = parse_event(raw);
    process_actions(&mut event, actions, &TagScope::event(), definitions);
    event
}
