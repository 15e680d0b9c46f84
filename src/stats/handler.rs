use super::{
    CallResult, CorrelationToken, RpcStats, RpcTagInfo, StatsHandler, TimingRecord,
    results::{CallResults, ResultSender, ResultsBuffer},
    status_code_of,
};
use crate::{
    errors::CallError,
    ids::{IdSource, OsIdSource},
};
use dashmap::{DashMap, mapref::entry::Entry};
use http::Extensions;
use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;

/// Options for a [CallStatsHandler]. Construct with [StatsHandlerOptionsBuilder]
#[derive(Clone, Debug, derive_builder::Builder)]
#[non_exhaustive]
pub struct StatsHandlerOptions {
    /// How results are buffered between the handler and whoever aggregates them
    #[builder(default)]
    pub results_buffer: ResultsBuffer,
    /// If set, a sweeper started with [CallStatsHandler::spawn_stale_sweeper] evicts calls that
    /// have been in flight for longer than this. Only needed for transports which can drop a call
    /// without ever reporting its end.
    #[builder(setter(into, strip_option), default)]
    pub stale_record_ttl: Option<Duration>,
    /// How often the sweeper looks for stale calls
    #[builder(default = "Duration::from_secs(1)")]
    pub sweep_interval: Duration,
}

impl Default for StatsHandlerOptions {
    fn default() -> Self {
        Self {
            results_buffer: ResultsBuffer::default(),
            stale_record_ttl: None,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Measures every call it is told about and emits one [CallResult] per call once the call ends.
///
/// Calls are correlated through a [CorrelationToken] that [StatsHandler::tag_rpc] stores in the
/// call's extensions. The token keys the call's [TimingRecord] in a concurrent table, which is
/// updated by whatever task happens to deliver the call's next event. Events arriving with no
/// token, or with a token that is no longer in the table, are ignored.
pub struct CallStatsHandler {
    /// Maps correlation token -> timings of that in-flight call
    records: DashMap<CorrelationToken, TimingRecord>,
    results: ResultSender,
    ids: Arc<dyn IdSource>,
    opts: StatsHandlerOptions,
}

impl CallStatsHandler {
    /// Create a handler along with the receiving end of its results
    pub fn new(opts: StatsHandlerOptions) -> (Self, CallResults) {
        Self::with_id_source(opts, Arc::new(OsIdSource))
    }

    /// Create a handler which draws correlation tokens from `ids`
    pub fn with_id_source(
        opts: StatsHandlerOptions,
        ids: Arc<dyn IdSource>,
    ) -> (Self, CallResults) {
        let (results, rx) = ResultSender::channel(opts.results_buffer);
        (
            Self {
                records: DashMap::new(),
                results,
                ids,
                opts,
            },
            rx,
        )
    }

    /// Number of calls currently being tracked
    pub fn in_flight(&self) -> usize {
        self.records.len()
    }

    /// True if the call with this token is being tracked
    pub fn is_tracked(&self, token: &CorrelationToken) -> bool {
        self.records.contains_key(token)
    }

    /// Number of results dropped because a bounded results buffer was full
    pub fn dropped_results(&self) -> u64 {
        self.results.dropped()
    }

    /// Stop tracking calls that were tagged more than `max_age` ago, emitting an
    /// [CallError::Abandoned] result for each. Returns how many were evicted.
    pub fn evict_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let is_stale = |r: &TimingRecord| now.saturating_duration_since(r.tagged_at) > max_age;
        let candidates: Vec<CorrelationToken> = self
            .records
            .iter()
            .filter(|e| is_stale(e.value()))
            .map(|e| *e.key())
            .collect();
        let mut evicted = 0;
        for token in candidates {
            // The call may have ended since we looked
            if let Some((token, timing)) = self.records.remove_if(&token, |_, r| is_stale(r)) {
                let age = now.saturating_duration_since(timing.tagged_at);
                warn!(%token, ?age, "Evicting call which never reported its end");
                let begin = timing.begin.unwrap_or(timing.tagged_at);
                self.results.send(CallResult {
                    token,
                    error: Some(Box::new(CallError::Abandoned { age })),
                    status_code: String::new(),
                    duration: now.saturating_duration_since(begin),
                    timing,
                });
                evicted += 1;
            }
        }
        evicted
    }

    /// Periodically evict stale calls, per [StatsHandlerOptions::stale_record_ttl]. Returns `None`
    /// if no ttl is configured. The sweeper stops once the handler is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_stale_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let ttl = self.opts.stale_record_ttl?;
        let every = self.opts.sweep_interval;
        let handler: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                handler.evict_stale(ttl);
            }
        }))
    }

    fn new_token(&self) -> Option<CorrelationToken> {
        match self.ids.next_id() {
            Ok(id) => Some(CorrelationToken::from(id)),
            Err(e) => {
                warn!(error = %e, "Could not generate correlation token, call won't be measured");
                None
            }
        }
    }

    fn complete(
        &self,
        token: CorrelationToken,
        begin_time: Option<Instant>,
        end_time: Instant,
        error: Option<super::BoxError>,
    ) {
        // Removing first means a duplicate end can't produce a second result
        let Some((token, timing)) = self.records.remove(&token) else {
            return;
        };
        let begin = begin_time
            .or(timing.begin)
            .unwrap_or(timing.tagged_at);
        let status_code = error
            .as_deref()
            .map(|e| status_code_of(e))
            .unwrap_or_default();
        trace!(%token, ?timing, "Call completed");
        self.results.send(CallResult {
            token,
            error,
            status_code,
            duration: end_time.saturating_duration_since(begin),
            timing,
        });
    }
}

impl StatsHandler for CallStatsHandler {
    fn tag_rpc(&self, ctx: &mut Extensions, info: &RpcTagInfo) {
        let Some(token) = self.new_token() else {
            return;
        };
        match self.records.entry(token) {
            Entry::Occupied(_) => {
                warn!(%token, method = %info.full_method_name,
                      "Correlation token collided with a live call, call won't be measured");
            }
            Entry::Vacant(v) => {
                v.insert(TimingRecord::new(Instant::now()));
                ctx.insert(token);
            }
        }
    }

    fn handle_rpc(&self, ctx: &Extensions, stats: RpcStats) {
        let Some(&token) = ctx.get::<CorrelationToken>() else {
            return;
        };
        if let RpcStats::End {
            begin_time,
            end_time,
            error,
        } = stats
        {
            self.complete(token, begin_time, end_time, error);
            return;
        }
        let Some(mut timing) = self.records.get_mut(&token) else {
            return;
        };
        match stats {
            RpcStats::Begin { begin_time } => timing.begin = Some(begin_time),
            RpcStats::OutHeader => timing.out_header = Some(Instant::now()),
            RpcStats::OutPayload { sent_time, .. } => {
                timing.out_payload = Some(sent_time);
                timing.out_payloads += 1;
            }
            RpcStats::InHeader => timing.in_header = Some(Instant::now()),
            RpcStats::InPayload { recv_time, .. } => {
                timing.in_payload = Some(recv_time);
                timing.in_payloads += 1;
            }
            RpcStats::InTrailer => timing.in_trailer = Some(Instant::now()),
            RpcStats::End { .. } => {}
        }
    }
}
